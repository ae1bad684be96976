use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::multicast::group_store::{MulticastGroupMember, MulticastGroupState, MulticastGroupStore};
use crate::multicast::outbound::OutboundMulticast;
use crate::protocol::address::{Mac, PeerAddress};
use crate::protocol::group::MulticastGroup;
use crate::protocol::packet::Packet;
use crate::switch::config::SwitchConfig;
use crate::topology::{NetworkRegistry, PacketEgress, PacketSealer, PeerDirectory, PendingSend};
use crate::util::lock;
use crate::util::random::{Random, RngRandom};

/// Multicast distribution: membership tracking with expiry, randomized
/// gather responses, and the two fan-out strategies (direct when enough
/// members are known, queued with an upstream gather when not).
///
/// All mutation happens under the single group-store lock; packets decided
/// under it are buffered and emitted only after release.
pub struct Multicaster<R: Random = RngRandom> {
    myself: PeerAddress,
    config: Arc<SwitchConfig>,
    peers: Arc<dyn PeerDirectory>,
    networks: Arc<dyn NetworkRegistry>,
    sealer: Arc<dyn PacketSealer>,
    groups: Mutex<MulticastGroupStore>,
    pd: PhantomData<R>,
}

impl<R: Random> Multicaster<R> {
    pub fn new(
        myself: PeerAddress,
        config: Arc<SwitchConfig>,
        peers: Arc<dyn PeerDirectory>,
        networks: Arc<dyn NetworkRegistry>,
        sealer: Arc<dyn PacketSealer>,
    ) -> Multicaster<R> {
        Multicaster {
            myself,
            config,
            peers,
            networks,
            sealer,
            groups: Mutex::new(MulticastGroupStore::new()),
            pd: PhantomData,
        }
    }

    /// Adds or refreshes one group member. A new member is immediately
    /// offered to every pending transmission of the group that has not
    /// reached its limit yet.
    pub fn add(&self, sw: &dyn PacketEgress, now: u64, network_id: u64, group: MulticastGroup, member: PeerAddress) {
        let mut sends = Vec::new();
        {
            let mut groups = lock(&self.groups);
            if let Some(gs) = groups.get_or_create(network_id, group, self.config.max_multicast_groups) {
                Self::add_to_group(self.myself, &mut sends, gs, member, now);
            }
        }
        self.emit(sw, sends, now);
    }

    /// Bulk add from a flat buffer of `count` 5-byte big-endian addresses,
    /// as carried by gather responses. The caller guarantees the buffer is
    /// at least `count` addresses long.
    pub fn add_multiple(
        &self,
        sw: &dyn PacketEgress,
        now: u64,
        network_id: u64,
        group: MulticastGroup,
        addresses: &[u8],
        count: usize,
    ) {
        if addresses.len() < count * PeerAddress::LENGTH {
            warn!("bulk member add with inconsistent sizes: {} addresses in {} bytes", count, addresses.len());
            debug_assert!(false, "caller must bounds-check the address buffer");
            return;
        }

        let mut sends = Vec::new();
        {
            let mut groups = lock(&self.groups);
            if let Some(gs) = groups.get_or_create(network_id, group, self.config.max_multicast_groups) {
                let mut buf = addresses;
                for _ in 0..count {
                    let member = PeerAddress::from_u64(buf.get_uint(PeerAddress::LENGTH));
                    Self::add_to_group(self.myself, &mut sends, gs, member, now);
                }
            }
        }
        self.emit(sw, sends, now);
    }

    /// Removes a member if present; unknown members and groups are a no-op.
    /// A group left with neither members nor pending sends is erased.
    pub fn remove(&self, network_id: u64, group: MulticastGroup, member: PeerAddress) {
        let mut groups = lock(&self.groups);
        if let Some(gs) = groups.find_mut(network_id, group) {
            gs.members.retain(|m| m.address != member);
            if gs.members.is_empty() && gs.tx_queue.is_empty() {
                groups.erase(network_id, group);
            }
        }
    }

    /// known members of a group, newest first, at most `limit`
    pub fn members(&self, network_id: u64, group: MulticastGroup, limit: usize) -> Vec<PeerAddress> {
        let groups = lock(&self.groups);
        match groups.find(network_id, group) {
            Some(gs) => gs.members.iter().rev().take(limit).map(|m| m.address).collect(),
            None => Vec::new(),
        }
    }

    /// Appends a gather response to `append_to`: a 4-byte total-known count,
    /// a 2-byte appended count, then up to `limit` member addresses - a
    /// random subset, so repeated gathers against a large group surface
    /// different members. The requester is counted but never appended; the
    /// local node, if subscribed, comes first. Returns the appended count.
    ///
    /// The two count fields are always written, even when nothing follows.
    pub fn gather(
        &self,
        requester: PeerAddress,
        network_id: u64,
        group: MulticastGroup,
        append_to: &mut BytesMut,
        limit: usize,
    ) -> usize {
        // the appended count is a u16 on the wire
        let limit = limit.min(0xffff);
        let mut added = 0usize;
        let mut total_known = 0u32;

        let total_at = append_to.len();
        append_to.put_u32(0);
        let added_at = append_to.len();
        append_to.put_u16(0);

        let fits = |append_to: &BytesMut, mtu: usize| append_to.len() + PeerAddress::LENGTH <= mtu;

        if self.networks.is_subscribed(network_id, &group, true) {
            total_known += 1;
            if added < limit && fits(append_to, self.config.payload_mtu) {
                self.myself.ser(append_to);
                added += 1;
            }
        }

        {
            let groups = lock(&self.groups);
            if let Some(gs) = groups.find(network_id, group) {
                if !gs.members.is_empty() {
                    total_known += gs.members.len() as u32;

                    // sampling without replacement: draw an index, bump it
                    // linearly on collision (bounded - every bump reaches a
                    // fresh member eventually)
                    let mut picked: Vec<PeerAddress> = Vec::new();
                    while added < limit
                        && picked.len() < gs.members.len()
                        && fits(append_to, self.config.payload_mtu)
                    {
                        let mut rptr = R::next_u64() as usize;
                        let address = loop {
                            let candidate = gs.members[rptr % gs.members.len()].address;
                            if !picked.contains(&candidate) {
                                break candidate;
                            }
                            rptr = rptr.wrapping_add(1);
                        };
                        picked.push(address);

                        // the peer asking obviously knows itself
                        if address != requester {
                            address.ser(append_to);
                            added += 1;
                        }
                    }
                }
            }
        }

        append_to[total_at..total_at + 4].copy_from_slice(&total_known.to_be_bytes());
        append_to[added_at..added_at + 2].copy_from_slice(&(added as u16).to_be_bytes());

        trace!("gather for {:?} on {:016x}: {} of {} known members appended", group, network_id, added, total_known);
        added
    }

    /// Sends one multicast. With at least `limit` known members the fan-out
    /// completes immediately (direct strategy); otherwise a transmission is
    /// queued to pick up members as they are learned, and an explicit
    /// upstream gather is issued unless one went out recently (queued
    /// strategy).
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        sw: &dyn PacketEgress,
        credential: Option<&[u8]>,
        limit: usize,
        now: u64,
        network_id: u64,
        always_send_to: &[PeerAddress],
        group: MulticastGroup,
        source_mac: Option<Mac>,
        ether_type: u16,
        payload: &[u8],
    ) {
        if limit == 0 {
            error!("multicast send with a zero recipient limit");
            return;
        }

        let mut sends = Vec::new();
        let mut gather_request: Option<Packet> = None;
        {
            let mut groups = lock(&self.groups);
            match groups.get_or_create(network_id, group, self.config.max_multicast_groups) {
                Some(gs) => {
                    // random permutation of the member list (Fisher-Yates)
                    let mut indexes: Vec<usize> = (0..gs.members.len()).collect();
                    for i in (1..indexes.len()).rev() {
                        let j = R::gen_usize_range(0..i + 1);
                        indexes.swap(i, j);
                    }

                    if gs.members.len() >= limit {
                        // enough members known - skip the queue entirely, but
                        // still ask recipients for a taste of fresh members
                        let out = OutboundMulticast::new(
                            now, self.myself, network_id, credential, limit, 1, group,
                            source_mac, ether_type, payload,
                        );

                        let mut count = 0;
                        for &ast in always_send_to {
                            if ast != self.myself {
                                out.send_only::<R>(&mut sends, ast);
                                count += 1;
                                if count >= limit {
                                    break;
                                }
                            }
                        }
                        let mut idx = 0;
                        while count < limit && idx < gs.members.len() {
                            let member = gs.members[indexes[idx]].address;
                            idx += 1;
                            if !always_send_to.contains(&member) {
                                out.send_only::<R>(&mut sends, member);
                                count += 1;
                            }
                        }
                    } else {
                        let mut gather_limit = (limit - gs.members.len()) + 1;
                        if now.saturating_sub(gs.last_explicit_gather) >= self.config.explicit_gather_interval {
                            gs.last_explicit_gather = now;
                            if let Some(root) = self.peers.best_root(&[]) {
                                debug!("requesting up to {} members of {:?} on {:016x} from upstream", gather_limit, group, network_id);
                                gather_request = Some(Packet::multicast_gather(
                                    root, self.myself, R::next_u64(), network_id, group, gather_limit as u32,
                                ));
                            }
                            // the explicit gather replaces the per-frame one
                            gather_limit = 0;
                        }

                        let mut out = OutboundMulticast::new(
                            now, self.myself, network_id, credential, limit, gather_limit as u32,
                            group, source_mac, ether_type, payload,
                        );

                        let mut count = 0;
                        for &ast in always_send_to {
                            if ast != self.myself {
                                out.send_and_log::<R>(&mut sends, ast);
                                count += 1;
                                if count >= limit {
                                    break;
                                }
                            }
                        }
                        let mut idx = 0;
                        while count < limit && idx < gs.members.len() {
                            let member = gs.members[indexes[idx]].address;
                            idx += 1;
                            if !always_send_to.contains(&member) {
                                out.send_and_log::<R>(&mut sends, member);
                                count += 1;
                            }
                        }

                        // later member adds keep feeding this until it hits
                        // its limit or expires
                        gs.tx_queue.push(out);
                    }
                }
                None => {
                    // ceiling reached and the group is untracked: degrade to
                    // the mandatory recipients, queue and gather nothing
                    let out = OutboundMulticast::new(
                        now, self.myself, network_id, credential, limit, 0, group,
                        source_mac, ether_type, payload,
                    );
                    let mut count = 0;
                    for &ast in always_send_to {
                        if ast != self.myself {
                            out.send_only::<R>(&mut sends, ast);
                            count += 1;
                            if count >= limit {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.emit(sw, sends, now);
        if let Some(mut packet) = gather_request {
            let root = packet.destination();
            if self.sealer.seal(&mut packet, true) {
                self.peers.send(root, packet.as_bytes(), now);
            }
        }
    }

    /// Periodic sweep: expired or completed transmissions go first, then
    /// members outside the liveness window; a group that ends up empty on
    /// both counts is dropped. Finishes by compacting the table.
    pub fn clean(&self, now: u64) {
        let mut groups = lock(&self.groups);
        groups.retain(|gs| {
            gs.tx_queue
                .retain(|tx| !tx.expired(now, self.config.multicast_transmit_timeout) && !tx.at_limit());
            gs.members
                .retain(|m| now.saturating_sub(m.last_seen) < self.config.member_liveness_window);

            // stale members are gone either way; the group itself survives
            // only while something still references it
            !gs.members.is_empty() || !gs.tx_queue.is_empty()
        });
        groups.compact();
    }

    /// assumes the group lock is held via `gs`
    fn add_to_group(
        myself: PeerAddress,
        sends: &mut Vec<PendingSend>,
        gs: &mut MulticastGroupState,
        member: PeerAddress,
        now: u64,
    ) {
        // never track ourselves, even if someone else reports us
        if member == myself {
            return;
        }

        if let Some(existing) = gs.members.iter_mut().find(|m| m.address == member) {
            existing.last_seen = now;
            return;
        }

        gs.members.push(MulticastGroupMember {
            address: member,
            last_seen: now,
        });
        trace!("{:?} joined multicast group {:?} on {:016x}", member, gs.group, gs.network_id);

        // a fresh member is news for every transmission still collecting
        gs.tx_queue.retain_mut(|tx| {
            if tx.at_limit() {
                return false;
            }
            tx.send_if_new::<R>(sends, member);
            !tx.at_limit()
        });
    }

    fn emit(&self, sw: &dyn PacketEgress, sends: Vec<PendingSend>, now: u64) {
        for send in sends {
            sw.send_packet(send.packet, send.encrypt, send.network_id, now);
        }
    }

    #[cfg(test)]
    pub(crate) fn group_count(&self) -> usize {
        lock(&self.groups).len()
    }

    #[cfg(test)]
    pub(crate) fn pending_transmissions(&self, network_id: u64, group: MulticastGroup) -> usize {
        lock(&self.groups)
            .find(network_id, group)
            .map_or(0, |gs| gs.tx_queue.len())
    }
}
