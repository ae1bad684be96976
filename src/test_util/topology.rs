use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::protocol::address::PeerAddress;
use crate::protocol::group::MulticastGroup;
use crate::protocol::packet::{IncomingPacket, Packet};
use crate::topology::{NetworkRegistry, NetworkView, PacketDecoder, PacketEgress, PacketSealer, PeerDirectory};
use crate::util::lock;

/// A recording in-memory collaborator for tests: peer directory, network
/// registry and (no-op) sealer in one. Peers added with a path are known,
/// alive and directly reachable; peers added without a path are known but
/// unreachable until a path appears. Every transmitted packet and contact
/// probe is logged.
pub struct TestTopology {
    pub myself: PeerAddress,
    known: Mutex<FxHashSet<PeerAddress>>,
    paths: Mutex<FxHashMap<PeerAddress, SocketAddr>>,
    roots: Mutex<Vec<PeerAddress>>,
    networks: Mutex<FxHashMap<u64, NetworkView>>,
    subscriptions: Mutex<FxHashSet<(u64, MulticastGroup)>>,
    sent: Mutex<Vec<(PeerAddress, Vec<u8>)>>,
    contacts: Mutex<Vec<(PeerAddress, SocketAddr)>>,
}

impl TestTopology {
    pub fn new(myself: PeerAddress) -> TestTopology {
        TestTopology {
            myself,
            known: Default::default(),
            paths: Default::default(),
            roots: Default::default(),
            networks: Default::default(),
            subscriptions: Default::default(),
            sent: Default::default(),
            contacts: Default::default(),
        }
    }

    /// a known peer with a working direct path
    pub fn add_peer(&self, peer: PeerAddress, path: SocketAddr) {
        lock(&self.known).insert(peer);
        lock(&self.paths).insert(peer, path);
    }

    /// a known, alive peer without any usable path
    pub fn add_known_peer_without_path(&self, peer: PeerAddress) {
        lock(&self.known).insert(peer);
    }

    /// a root peer, reachable like a regular peer
    pub fn add_root(&self, root: PeerAddress) {
        self.add_peer(root, SocketAddr::from(([127, 0, 0, 1], 9993)));
        lock(&self.roots).push(root);
    }

    pub fn add_network(&self, network: NetworkView) {
        lock(&self.networks).insert(network.network_id, network);
    }

    pub fn subscribe(&self, network_id: u64, group: MulticastGroup) {
        lock(&self.subscriptions).insert((network_id, group));
    }

    /// everything transmitted that parses as a whole packet (fragments and
    /// other raw bytes are in [sent_raw](Self::sent_raw))
    pub fn sent_packets(&self) -> Vec<(PeerAddress, Packet)> {
        lock(&self.sent)
            .iter()
            .filter(|(_, data)| !crate::protocol::packet::is_fragment(data))
            .filter_map(|(peer, data)| Packet::try_from_slice(data).ok().map(|p| (*peer, p)))
            .collect()
    }

    pub fn sent_raw(&self) -> Vec<(PeerAddress, Vec<u8>)> {
        lock(&self.sent).clone()
    }

    pub fn clear_sent(&self) {
        lock(&self.sent).clear();
    }

    pub fn contact_log(&self) -> Vec<(PeerAddress, SocketAddr)> {
        lock(&self.contacts).clone()
    }
}

impl PeerDirectory for TestTopology {
    fn is_known(&self, peer: PeerAddress) -> bool {
        lock(&self.known).contains(&peer)
    }

    fn is_alive(&self, peer: PeerAddress, _now: u64) -> bool {
        lock(&self.known).contains(&peer)
    }

    fn has_direct_path(&self, peer: PeerAddress, _now: u64) -> bool {
        lock(&self.paths).contains_key(&peer)
    }

    fn best_path(&self, peer: PeerAddress, _now: u64) -> Option<SocketAddr> {
        lock(&self.paths).get(&peer).copied()
    }

    fn send(&self, peer: PeerAddress, data: &[u8], _now: u64) -> bool {
        if !lock(&self.paths).contains_key(&peer) {
            return false;
        }
        lock(&self.sent).push((peer, data.to_vec()));
        true
    }

    fn contact_at(&self, peer: PeerAddress, at: SocketAddr, _now: u64) {
        lock(&self.contacts).push((peer, at));
    }

    fn best_root(&self, skip: &[PeerAddress]) -> Option<PeerAddress> {
        lock(&self.roots).iter().find(|r| !skip.contains(r)).copied()
    }
}

impl NetworkRegistry for TestTopology {
    fn network(&self, network_id: u64) -> Option<NetworkView> {
        lock(&self.networks).get(&network_id).cloned()
    }

    fn is_subscribed(&self, network_id: u64, group: &MulticastGroup, _include_self: bool) -> bool {
        lock(&self.subscriptions).contains(&(network_id, *group))
    }
}

impl PacketSealer for TestTopology {
    fn seal(&self, _packet: &mut Packet, _encrypt: bool) -> bool {
        true
    }
}

/// Records every packet handed to switch egress, in order.
#[derive(Default)]
pub struct RecordingEgress {
    sent: Mutex<Vec<(Packet, bool, u64)>>,
}

impl RecordingEgress {
    pub fn new() -> RecordingEgress {
        Default::default()
    }

    pub fn sent(&self) -> Vec<(Packet, bool, u64)> {
        lock(&self.sent).clone()
    }

    pub fn destinations(&self) -> Vec<PeerAddress> {
        lock(&self.sent).iter().map(|(p, _, _)| p.destination()).collect()
    }
}

impl PacketEgress for RecordingEgress {
    fn send_packet(&self, packet: Packet, encrypt: bool, network_id: u64, _now: u64) {
        lock(&self.sent).push((packet, encrypt, network_id));
    }
}

/// A [PacketDecoder] that can be switched between accepting everything and
/// reporting everything as blocked on identity, recording what it decoded.
pub struct RecordingDecoder {
    accept: AtomicBool,
    decoded: Mutex<Vec<u64>>,
}

impl RecordingDecoder {
    pub fn new(accept: bool) -> RecordingDecoder {
        RecordingDecoder {
            accept: AtomicBool::new(accept),
            decoded: Default::default(),
        }
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    /// packet ids of everything successfully decoded
    pub fn decoded(&self) -> Vec<u64> {
        lock(&self.decoded).clone()
    }
}

impl PacketDecoder for RecordingDecoder {
    fn try_decode(&self, packet: &IncomingPacket, _now: u64) -> bool {
        if self.accept.load(Ordering::SeqCst) {
            lock(&self.decoded).push(packet.packet.packet_id());
            true
        } else {
            false
        }
    }
}
