use crate::protocol::address::{Mac, PeerAddress};
use crate::protocol::group::MulticastGroup;
use crate::protocol::packet::Packet;
use crate::topology::PendingSend;
use crate::util::random::Random;

/// The fan-out state of one multicast send: a composed frame template plus
/// the set of addresses already notified. A transmission either completes by
/// reaching its dissemination limit or ages out of its group's queue.
///
/// Per-recipient packets are cloned off the template with the destination
/// and a fresh packet id patched in; the membership credential and the
/// gather budget were baked into the template at creation.
pub(crate) struct OutboundMulticast {
    tx_time: u64,
    network_id: u64,
    limit: usize,
    gather_limit: u32,
    frame_template: Packet,
    already_sent_to: Vec<PeerAddress>,
}

impl OutboundMulticast {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        now: u64,
        myself: PeerAddress,
        network_id: u64,
        credential: Option<&[u8]>,
        limit: usize,
        gather_limit: u32,
        group: MulticastGroup,
        source_mac: Option<Mac>,
        ether_type: u16,
        payload: &[u8],
    ) -> OutboundMulticast {
        let frame_template = Packet::multicast_frame(
            PeerAddress::NIL,
            myself,
            0,
            network_id,
            credential,
            gather_limit,
            group,
            source_mac,
            ether_type,
            payload,
        );
        OutboundMulticast {
            tx_time: now,
            network_id,
            limit,
            gather_limit,
            frame_template,
            already_sent_to: Vec::new(),
        }
    }

    pub fn expired(&self, now: u64, timeout: u64) -> bool {
        now.saturating_sub(self.tx_time) >= timeout
    }

    /// enough distinct addresses notified - nothing more to do
    pub fn at_limit(&self) -> bool {
        self.already_sent_to.len() >= self.limit
    }

    pub fn gather_limit(&self) -> u32 {
        self.gather_limit
    }

    pub fn sent_count(&self) -> usize {
        self.already_sent_to.len()
    }

    /// emit without recording - for transient sends that are never revisited
    pub fn send_only<R: Random>(&self, out: &mut Vec<PendingSend>, destination: PeerAddress) {
        let mut packet = self.frame_template.clone();
        packet.set_destination(destination);
        packet.set_packet_id(R::next_u64());
        out.push(PendingSend {
            packet,
            encrypt: true,
            network_id: self.network_id,
        });
    }

    /// emit and record, counting toward the limit
    pub fn send_and_log<R: Random>(&mut self, out: &mut Vec<PendingSend>, destination: PeerAddress) {
        self.already_sent_to.push(destination);
        self.send_only::<R>(out, destination);
    }

    /// emit only if this address was never notified by this transmission
    pub fn send_if_new<R: Random>(&mut self, out: &mut Vec<PendingSend>, destination: PeerAddress) {
        if !self.already_sent_to.contains(&destination) {
            self.send_and_log::<R>(out, destination);
        }
    }
}
