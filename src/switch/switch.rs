use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::multicast::dispatcher::Multicaster;
use crate::protocol::address::{Mac, PeerAddress};
use crate::protocol::group::MulticastGroup;
use crate::protocol::packet::{is_fragment, Fragment, IncomingPacket, Packet};
use crate::protocol::ETHERTYPE_ARP;
use crate::switch::config::SwitchConfig;
use crate::switch::defrag::FragmentReassembler;
use crate::switch::nat::NatCoordinator;
use crate::switch::tx_queue::{OutboundQueue, TxQueueEntry};
use crate::switch::whois::IdentityResolver;
use crate::topology::{NetworkRegistry, NetworkView, PacketDecoder, PacketEgress, PacketSealer, PeerDirectory};
use crate::util::lock;
use crate::util::random::{Random, RngRandom};

/// Where everything meets: wire packets come in here, as do frames from the
/// virtual interfaces, and this sends them where they need to go - directly,
/// queued behind identity resolution, relayed, or fanned out as multicast.
/// Timer tasks drive every retry and expiry.
///
/// Every entry point is synchronous and safe to call from any thread; each
/// internal table has its own short-lived lock.
pub struct Switch<R: Random = RngRandom> {
    myself: PeerAddress,
    config: Arc<SwitchConfig>,
    peers: Arc<dyn PeerDirectory>,
    networks: Arc<dyn NetworkRegistry>,
    sealer: Arc<dyn PacketSealer>,
    decoder: Arc<dyn PacketDecoder>,
    whois: IdentityResolver<R>,
    defrag: FragmentReassembler,
    tx_queue: OutboundQueue,
    nat: NatCoordinator<R>,
    multicaster: Multicaster<R>,
    /// complete inbound packets whose decode is blocked on an unknown identity
    rx_queue: Mutex<Vec<IncomingPacket>>,
    last_multicast_clean: AtomicU64,
}

impl<R: Random> Switch<R> {
    pub fn new(
        myself: PeerAddress,
        config: Arc<SwitchConfig>,
        peers: Arc<dyn PeerDirectory>,
        networks: Arc<dyn NetworkRegistry>,
        sealer: Arc<dyn PacketSealer>,
        decoder: Arc<dyn PacketDecoder>,
    ) -> Switch<R> {
        Switch {
            myself,
            whois: IdentityResolver::new(myself, config.clone(), peers.clone(), sealer.clone()),
            defrag: FragmentReassembler::new(config.clone()),
            tx_queue: OutboundQueue::new(config.clone()),
            nat: NatCoordinator::new(myself, config.clone(), peers.clone(), sealer.clone()),
            multicaster: Multicaster::new(myself, config.clone(), peers.clone(), networks.clone(), sealer.clone()),
            config,
            peers,
            networks,
            sealer,
            decoder,
            rx_queue: Default::default(),
            last_multicast_clean: AtomicU64::new(0),
        }
    }

    pub fn multicaster(&self) -> &Multicaster<R> {
        &self.multicaster
    }

    /// Raw bytes arrived from the physical network: classify as fragment or
    /// whole packet, relay what is not ours, reassemble and decode the rest.
    pub fn on_remote_packet(&self, from: SocketAddr, data: &[u8], now: u64) {
        if is_fragment(data) {
            match Fragment::try_from_slice(data) {
                Ok(fragment) => self.handle_fragment(fragment, now),
                Err(e) => trace!("dropped fragment from {}: {}", from, e),
            }
        } else if data.len() >= Packet::HEADER_LENGTH {
            match Packet::try_from_slice(data) {
                Ok(packet) => self.handle_packet_head(from, packet, now),
                Err(e) => trace!("dropped packet from {}: {}", from, e),
            }
        }
    }

    /// A frame left the local virtual interface of `network`: unicast within
    /// the network goes out as a wrapped frame, multicast and broadcast go
    /// through the multicast dispatcher.
    pub fn on_local_frame(
        &self,
        network: &NetworkView,
        from: Mac,
        to: Mac,
        ether_type: u16,
        payload: &[u8],
        now: u64,
    ) {
        // our own MAC looping back is a bridge loop or an OS artifact
        if to == network.mac {
            return;
        }
        if from != network.mac {
            trace!("dropped frame from foreign MAC {:?} on {:016x} (bridging not supported)", from, network.network_id);
            return;
        }

        if to.is_multicast() {
            let mut group = MulticastGroup::new(to, 0);

            if to.is_broadcast() {
                if let Some(target_ip) = ipv4_arp_request_target(ether_type, payload) {
                    // scope the ARP broadcast channel by the address being
                    // resolved, so it scales with hosts rather than networks
                    group = MulticastGroup::for_address_resolution(target_ip);
                } else if !network.broadcast_enabled {
                    trace!("dropped broadcast frame, disabled on network {:016x}", network.network_id);
                    return;
                }
            }

            self.multicaster.send(
                self,
                network.membership_credential.as_deref(),
                network.multicast_limit,
                now,
                network.network_id,
                &network.active_bridges,
                group,
                None,
                ether_type,
                payload,
            );
            return;
        }

        if to.first_octet() == Mac::first_octet_for_network(network.network_id) {
            // in-network MACs are derived from addresses, so this reverses
            let destination = to.to_address(network.network_id);
            let packet = Packet::frame(destination, self.myself, R::next_u64(), network.network_id, ether_type, payload);
            self.send(packet, true, network.network_id, now);
            return;
        }

        trace!("dropped frame to {:?}: not on network {:016x} (bridging not supported)", to, network.network_id);
    }

    /// Egress for a composed packet: out immediately when the destination's
    /// identity is known and a path (direct or via a root) exists, otherwise
    /// parked in the outbound queue with identity resolution under way.
    pub fn send(&self, packet: Packet, encrypt: bool, network_id: u64, now: u64) {
        let destination = packet.destination();
        if destination == self.myself {
            warn!("caught attempt to send to self, ignored");
            return;
        }

        if !self.try_send(&packet, encrypt, network_id, now) {
            if !self.peers.is_known(destination) && !self.whois.is_outstanding(destination) {
                self.whois.request(destination, now);
            }
            self.tx_queue.enqueue(
                destination,
                TxQueueEntry {
                    creation_time: now,
                    network_id,
                    packet,
                    encrypt,
                },
            );
        }
    }

    /// see [NatCoordinator::unite]
    pub fn unite(&self, p1: PeerAddress, p2: PeerAddress, force: bool, now: u64) -> bool {
        self.nat.unite(p1, p2, force, now)
    }

    /// see [NatCoordinator::rendezvous]
    pub fn rendezvous(&self, peer: PeerAddress, at: SocketAddr, now: u64) {
        self.nat.rendezvous(peer, at, now);
    }

    pub fn request_whois(&self, address: PeerAddress, now: u64) {
        self.whois.request(address, now);
    }

    pub fn cancel_whois(&self, address: PeerAddress) {
        self.whois.cancel(address);
    }

    /// A peer's identity became known (lookup response, direct hello, ...):
    /// close the lookup and release everything parked on it - blocked
    /// inbound decodes first, then the outbound queue in arrival order.
    pub fn on_peer_identified(&self, peer: PeerAddress, now: u64) {
        self.whois.resolve(peer);

        lock(&self.rx_queue).retain(|packet| !self.decoder.try_decode(packet, now));

        self.tx_queue
            .drain(peer, |entry| self.try_send(&entry.packet, entry.encrypt, entry.network_id, now));
    }

    /// Runs all timer-driven maintenance. Returns the delay in milliseconds
    /// until the next time this needs to run, at most the configured poll
    /// ceiling.
    pub fn do_timer_tasks(&self, now: u64) -> u64 {
        let mut next_delay = self.config.max_timer_interval;

        if let Some(delay) = self.nat.advance_contacts(now) {
            next_delay = next_delay.min(delay);
        }
        if let Some(delay) = self.whois.sweep(now) {
            next_delay = next_delay.min(delay);
        }

        self.tx_queue
            .sweep(now, |entry| self.try_send(&entry.packet, entry.encrypt, entry.network_id, now));

        lock(&self.rx_queue).retain(|packet| {
            if now.saturating_sub(packet.receive_time) > self.config.rx_queue_timeout {
                trace!("inbound packet {:016x} timed out awaiting identity", packet.packet.packet_id());
                false
            } else {
                true
            }
        });

        self.defrag.sweep(now);

        let last_clean = self.last_multicast_clean.load(Ordering::Relaxed);
        if now.saturating_sub(last_clean) >= self.config.multicast_clean_interval {
            self.last_multicast_clean.store(now, Ordering::Relaxed);
            self.multicaster.clean(now);
        }

        next_delay.min(self.config.max_timer_interval)
    }

    fn handle_fragment(&self, mut fragment: Fragment, now: u64) {
        let destination = fragment.destination();

        if destination != self.myself {
            // in transit - relay it (rendezvous is left to the packet head)
            if fragment.hops() >= self.config.relay_max_hops {
                trace!("dropped relayed fragment to {:?}, max hops exceeded", destination);
                return;
            }
            fragment.increment_hops();
            self.send_via(destination, &[], fragment.as_bytes(), now);
            return;
        }

        if let Some(packet) = self.defrag.on_fragment(fragment, now) {
            self.receive(packet, now);
        }
    }

    fn handle_packet_head(&self, from: SocketAddr, mut packet: Packet, now: u64) {
        let source = packet.source();
        let destination = packet.destination();

        if destination != self.myself {
            if packet.hops() >= self.config.relay_max_hops {
                trace!("dropped relay {:?}({}) -> {:?}, max hops exceeded", source, from, destination);
                return;
            }
            packet.increment_hops();

            if self.peers.is_known(destination) && self.peers.send(destination, packet.as_bytes(), now) {
                // both ends talk through us - tell them about each other
                self.nat.unite(source, destination, false, now);
            } else if let Some(root) = self.peers.best_root(&[source]) {
                self.peers.send(root, packet.as_bytes(), now);
            }
            return;
        }

        if packet.fragmented() {
            if let Some(complete) = self.defrag.on_head(packet, now) {
                self.receive(complete, now);
            }
            // else: head stored, waiting for its fragments
            return;
        }

        self.receive_from(packet, from, now);
    }

    fn receive(&self, packet: Packet, now: u64) {
        // reassembled packets keep no meaningful physical origin
        self.receive_from(packet, SocketAddr::from(([0, 0, 0, 0], 0)), now);
    }

    fn receive_from(&self, packet: Packet, from: SocketAddr, now: u64) {
        let incoming = IncomingPacket {
            packet,
            from,
            receive_time: now,
        };
        if !self.decoder.try_decode(&incoming, now) {
            // decode is waiting on an identity; resolution or expiry decides
            lock(&self.rx_queue).push(incoming);
        }
    }

    /// One sealed send attempt, fragmenting when the packet exceeds the MTU.
    /// False when the identity is unknown, the network is gone, or there is
    /// no path even via a root.
    fn try_send(&self, packet: &Packet, encrypt: bool, network_id: u64, now: u64) -> bool {
        let destination = packet.destination();

        if !self.peers.is_known(destination) {
            return false;
        }
        // we probably just left this network - let its packets die
        if network_id != 0 && self.networks.network(network_id).is_none() {
            return false;
        }

        let mut tmp = packet.clone();
        let total_len = tmp.len();
        let mtu = self.config.payload_mtu;
        tmp.set_fragmented(total_len > mtu);

        if !self.sealer.seal(&mut tmp, encrypt) {
            return false;
        }

        let head_len = total_len.min(mtu);
        if !self.send_via(destination, &[], &tmp.as_bytes()[..head_len], now) {
            return false;
        }

        if head_len < total_len {
            // too big for one wire packet - the remainder goes as fragments
            let chunk_size = mtu - Fragment::HEADER_LENGTH;
            let remaining = total_len - head_len;
            let total_fragments = 1 + remaining.div_ceil(chunk_size);
            debug_assert!(total_fragments <= Fragment::MAX_FRAGMENTS);

            let mut offset = head_len;
            let mut fragment_no = 1u8;
            while offset < total_len && (fragment_no as usize) < Fragment::MAX_FRAGMENTS {
                let end = (offset + chunk_size).min(total_len);
                let fragment = Fragment::compose(
                    tmp.packet_id(),
                    destination,
                    fragment_no,
                    total_fragments as u8,
                    &tmp.as_bytes()[offset..end],
                );
                self.send_via(destination, &[], fragment.as_bytes(), now);
                offset = end;
                fragment_no += 1;
            }
        }
        true
    }

    /// direct if the peer has a path, otherwise via the best root not in `skip`
    fn send_via(&self, destination: PeerAddress, skip: &[PeerAddress], data: &[u8], now: u64) -> bool {
        if self.peers.send(destination, data, now) {
            return true;
        }
        match self.peers.best_root(skip) {
            Some(root) => self.peers.send(root, data, now),
            None => {
                debug!("no path to {:?} and no root to relay via", destination);
                false
            }
        }
    }
}

impl<R: Random> PacketEgress for Switch<R> {
    fn send_packet(&self, packet: Packet, encrypt: bool, network_id: u64, now: u64) {
        self.send(packet, encrypt, network_id, now);
    }
}

/// An IPv4 ARP request to the broadcast MAC? Returns the target protocol
/// address if so.
fn ipv4_arp_request_target(ether_type: u16, payload: &[u8]) -> Option<[u8; 4]> {
    if ether_type != ETHERTYPE_ARP || payload.len() < 28 {
        return None;
    }
    // ethernet/IPv4 ARP: ptype 0x0800, hlen 6, plen 4, opcode 1 (request)
    if payload[2] == 0x08 && payload[3] == 0x00 && payload[4] == 6 && payload[5] == 4 && payload[7] == 0x01 {
        Some([payload[24], payload[25], payload[26], payload[27]])
    } else {
        None
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::Verb;
    use crate::test_util::peer::{test_group_from_number, test_peer_addr_from_number, test_socket_addr_from_number};
    use crate::test_util::topology::{RecordingDecoder, TestTopology};

    struct Fixture {
        topology: Arc<TestTopology>,
        decoder: Arc<RecordingDecoder>,
        switch: Switch,
    }

    fn fixture() -> Fixture {
        fixture_with_config(SwitchConfig::new())
    }

    fn fixture_with_config(config: SwitchConfig) -> Fixture {
        let topology = Arc::new(TestTopology::new(test_peer_addr_from_number(1)));
        let decoder = Arc::new(RecordingDecoder::new(true));
        let switch = Switch::new(
            topology.myself,
            Arc::new(config),
            topology.clone(),
            topology.clone(),
            topology.clone(),
            decoder.clone(),
        );
        Fixture {
            topology,
            decoder,
            switch,
        }
    }

    fn network_view(topology: &TestTopology, network_id: u64) -> NetworkView {
        NetworkView {
            network_id,
            mac: Mac::from_address(topology.myself, network_id),
            multicast_limit: 32,
            broadcast_enabled: true,
            active_bridges: Vec::new(),
            membership_credential: None,
        }
    }

    #[test]
    fn test_local_unicast_frame_to_known_peer_goes_out_immediately() {
        let f = fixture();
        let peer = test_peer_addr_from_number(2);
        f.topology.add_peer(peer, test_socket_addr_from_number(2));
        let network = network_view(&f.topology, 0x11);
        f.topology.add_network(network.clone());

        let to = Mac::from_address(peer, 0x11);
        f.switch.on_local_frame(&network, network.mac, to, 0x0800, b"ip packet", 1000);

        let sent = f.topology.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer);
        assert_eq!(sent[0].1.destination(), peer);
        assert_eq!(sent[0].1.try_verb().unwrap(), Verb::Frame);
    }

    #[test]
    fn test_local_frame_to_own_mac_is_dropped() {
        let f = fixture();
        let network = network_view(&f.topology, 0x11);
        f.topology.add_network(network.clone());

        f.switch.on_local_frame(&network, network.mac, network.mac, 0x0800, b"loop", 1000);
        assert!(f.topology.sent_raw().is_empty());
    }

    #[test]
    fn test_send_to_unknown_peer_queues_and_asks_whois() {
        let f = fixture();
        let root = test_peer_addr_from_number(100);
        f.topology.add_root(root);
        let network = network_view(&f.topology, 0x11);
        f.topology.add_network(network.clone());
        let stranger = test_peer_addr_from_number(9);

        for n in 0..3u64 {
            let packet = Packet::frame(stranger, f.topology.myself, n, 0x11, 0x0800, b"data");
            f.switch.send(packet, true, 0x11, 1000);
        }

        // nothing went to the stranger; one WHOIS went upstream
        let sent = f.topology.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, root);
        assert_eq!(sent[0].1.try_verb().unwrap(), Verb::Whois);

        // resolution drains the queue in arrival order
        f.topology.clear_sent();
        f.topology.add_peer(stranger, test_socket_addr_from_number(9));
        f.switch.on_peer_identified(stranger, 2000);

        let drained: Vec<u64> = f
            .topology
            .sent_packets()
            .iter()
            .map(|(_, p)| p.packet_id())
            .collect();
        assert_eq!(drained, vec![0, 1, 2], "drain must be FIFO");
    }

    #[test]
    fn test_queued_packets_expire_unsent() {
        let f = fixture();
        let stranger = test_peer_addr_from_number(9);
        let network = network_view(&f.topology, 0x11);
        f.topology.add_network(network);

        let packet = Packet::frame(stranger, f.topology.myself, 7, 0x11, 0x0800, b"data");
        f.switch.send(packet, true, 0x11, 1000);

        f.switch.do_timer_tasks(7000); // past the 5s tx timeout

        // late resolution finds nothing left to send
        f.topology.add_peer(stranger, test_socket_addr_from_number(9));
        f.switch.on_peer_identified(stranger, 8000);
        assert!(f.topology.sent_packets().iter().all(|(_, p)| p.try_verb().unwrap() == Verb::Whois));
    }

    #[test]
    fn test_broadcast_respects_network_policy() {
        let f = fixture();
        let mut network = network_view(&f.topology, 0x11);
        network.broadcast_enabled = false;
        f.topology.add_network(network.clone());

        f.switch.on_local_frame(&network, network.mac, Mac::BROADCAST, 0x86dd, b"neighbor solicitation", 1000);
        assert!(f.topology.sent_raw().is_empty(), "broadcast disabled means dropped");
    }

    #[test]
    fn test_arp_broadcast_is_scoped_by_target_address() {
        let f = fixture();
        let mut network = network_view(&f.topology, 0x11);
        network.broadcast_enabled = false; // ARP must still pass
        f.topology.add_network(network.clone());

        // a member is known in the ARP-scoped group for 10.0.0.5
        let member = test_peer_addr_from_number(3);
        let scoped = MulticastGroup::for_address_resolution([10, 0, 0, 5]);
        f.switch.multicaster().add(&f.switch, 900, 0x11, scoped, member);

        let mut arp = vec![0u8; 28];
        arp[2] = 0x08; // ipv4
        arp[4] = 6; // hlen
        arp[5] = 4; // plen
        arp[7] = 0x01; // request
        arp[24..28].copy_from_slice(&[10, 0, 0, 5]);

        f.switch.on_local_frame(&network, network.mac, Mac::BROADCAST, ETHERTYPE_ARP, &arp, 1000);

        // queued fan-out notified the scoped member (member is unknown to the
        // peer directory, so the frame is parked - but the WHOIS proves the
        // fan-out ran against the scoped group)
        let queued = f.switch.multicaster().pending_transmissions(0x11, scoped);
        assert_eq!(queued, 1);
    }

    #[test]
    fn test_relay_forwards_and_unites() {
        let f = fixture();
        let source = test_peer_addr_from_number(2);
        let dest = test_peer_addr_from_number(3);
        f.topology.add_peer(source, test_socket_addr_from_number(2));
        f.topology.add_peer(dest, test_socket_addr_from_number(3));

        let transit = Packet::frame(dest, source, 42, 0x11, 0x0800, b"x");
        f.switch.on_remote_packet(test_socket_addr_from_number(2), transit.as_bytes(), 1000);

        let sent = f.topology.sent_packets();
        let forwarded: Vec<_> = sent.iter().filter(|(_, p)| p.packet_id() == 42).collect();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, dest);
        assert_eq!(forwarded[0].1.hops(), 1, "relay increments the hop count");

        let rendezvous_count = sent
            .iter()
            .filter(|(_, p)| p.try_verb().unwrap() == Verb::Rendezvous)
            .count();
        assert_eq!(rendezvous_count, 2, "both relayed ends learn each other's path");

        assert!(f.decoder.decoded().is_empty(), "transit traffic is never decoded locally");
    }

    #[test]
    fn test_relay_respects_the_hop_ceiling() {
        let f = fixture();
        let dest = test_peer_addr_from_number(3);
        f.topology.add_peer(dest, test_socket_addr_from_number(3));

        let mut transit = Packet::frame(dest, test_peer_addr_from_number(2), 42, 0x11, 0x0800, b"x");
        for _ in 0..3 {
            transit.increment_hops();
        }
        f.switch.on_remote_packet(test_socket_addr_from_number(2), transit.as_bytes(), 1000);

        assert!(f.topology.sent_raw().is_empty(), "max hops exceeded - dropped");
    }

    #[test]
    fn test_relay_falls_back_to_a_root() {
        let f = fixture();
        let root = test_peer_addr_from_number(100);
        f.topology.add_root(root);
        let dest = test_peer_addr_from_number(3); // unknown peer

        let transit = Packet::frame(dest, test_peer_addr_from_number(2), 42, 0x11, 0x0800, b"x");
        f.switch.on_remote_packet(test_socket_addr_from_number(2), transit.as_bytes(), 1000);

        let sent = f.topology.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, root, "no path to the destination - relayed upstream");
    }

    #[test]
    fn test_inbound_packet_for_us_is_decoded() {
        let f = fixture();
        let peer = test_peer_addr_from_number(2);
        let inbound = Packet::frame(f.topology.myself, peer, 77, 0x11, 0x0800, b"x");

        f.switch.on_remote_packet(test_socket_addr_from_number(2), inbound.as_bytes(), 1000);
        assert_eq!(f.decoder.decoded(), vec![77]);
    }

    #[test]
    fn test_identity_blocked_decode_is_parked_and_released() {
        let f = fixture();
        f.decoder.set_accept(false);
        let peer = test_peer_addr_from_number(2);
        let inbound = Packet::frame(f.topology.myself, peer, 77, 0x11, 0x0800, b"x");

        f.switch.on_remote_packet(test_socket_addr_from_number(2), inbound.as_bytes(), 1000);
        assert!(f.decoder.decoded().is_empty());

        f.decoder.set_accept(true);
        f.switch.on_peer_identified(peer, 1500);
        assert_eq!(f.decoder.decoded(), vec![77]);
    }

    #[test]
    fn test_parked_decodes_expire() {
        let f = fixture();
        f.decoder.set_accept(false);
        let peer = test_peer_addr_from_number(2);
        let inbound = Packet::frame(f.topology.myself, peer, 77, 0x11, 0x0800, b"x");
        f.switch.on_remote_packet(test_socket_addr_from_number(2), inbound.as_bytes(), 1000);

        f.switch.do_timer_tasks(7000); // past the 5s rx timeout

        f.decoder.set_accept(true);
        f.switch.on_peer_identified(peer, 8000);
        assert!(f.decoder.decoded().is_empty(), "expired packets are gone for good");
    }

    #[test]
    fn test_oversized_egress_fragments_and_reassembles() {
        let sender = fixture();
        let receiver_addr = test_peer_addr_from_number(2);
        sender.topology.add_peer(receiver_addr, test_socket_addr_from_number(2));
        let network = network_view(&sender.topology, 0x11);
        sender.topology.add_network(network);

        let payload = vec![0xabu8; 3000];
        let packet = Packet::frame(receiver_addr, sender.topology.myself, 7, 0x11, 0x0800, &payload);
        let expected_len = packet.len();
        sender.switch.send(packet, true, 0x11, 1000);

        let wire = sender.topology.sent_raw();
        assert!(wire.len() > 1, "must have been fragmented");
        assert!(is_fragment(&wire[1].1));

        // a second node, addressed by the fragments, reassembles them
        let receiver = {
            let topology = Arc::new(TestTopology::new(receiver_addr));
            let decoder = Arc::new(RecordingDecoder::new(true));
            let switch: Switch = Switch::new(
                receiver_addr,
                Arc::new(SwitchConfig::new()),
                topology.clone(),
                topology.clone(),
                topology.clone(),
                decoder.clone(),
            );
            (switch, decoder)
        };

        // deliver out of order for good measure
        for (_, data) in wire.iter().rev() {
            receiver.0.on_remote_packet(test_socket_addr_from_number(1), data, 2000);
        }

        assert_eq!(receiver.1.decoded(), vec![7]);
    }

    #[test]
    fn test_timer_delay_is_bounded_and_tracks_due_work() {
        let f = fixture();
        assert_eq!(f.switch.do_timer_tasks(1000), 1000, "idle switch polls at the ceiling");

        // a pending contact brings the next deadline closer
        let peer = test_peer_addr_from_number(2);
        f.topology.add_known_peer_without_path(peer);
        f.switch.rendezvous(peer, test_socket_addr_from_number(40000), 1000);
        let delay = f.switch.do_timer_tasks(1600);
        assert_eq!(delay, 400, "contact fires at 2000");
    }

    #[test]
    fn test_send_to_self_is_refused() {
        let f = fixture();
        let packet = Packet::frame(f.topology.myself, f.topology.myself, 1, 0, 0x0800, b"x");
        f.switch.send(packet, true, 0, 1000);
        assert!(f.topology.sent_raw().is_empty());
    }
}
