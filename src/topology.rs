//! Narrow views of the node's collaborators. Everything the switching and
//! multicast core needs to know about peers, networks, sealing and decoding
//! comes in through these traits, which keeps the core synchronous and
//! deterministic under test.

use std::net::SocketAddr;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::protocol::address::{Mac, PeerAddress};
use crate::protocol::group::MulticastGroup;
use crate::protocol::packet::{IncomingPacket, Packet};

/// The peer directory: who we know, how to reach them, and the upstream
/// roots used for identity lookups and relaying.
#[cfg_attr(test, automock)]
pub trait PeerDirectory: Send + Sync {
    /// true when the peer's identity (key material) is known locally
    fn is_known(&self, peer: PeerAddress) -> bool;

    fn is_alive(&self, peer: PeerAddress, now: u64) -> bool;

    fn has_direct_path(&self, peer: PeerAddress, now: u64) -> bool;

    /// the peer's currently best physical path, if any
    fn best_path(&self, peer: PeerAddress, now: u64) -> Option<SocketAddr>;

    /// Transmits wire bytes to a peer along its best available path. The
    /// bytes are sent as-is; false when there is no usable path.
    fn send(&self, peer: PeerAddress, data: &[u8], now: u64) -> bool;

    /// fire a bare contact probe at a specific physical address (NAT traversal)
    fn contact_at(&self, peer: PeerAddress, at: SocketAddr, now: u64);

    /// upstream/root selection, skipping peers that were already consulted
    fn best_root(&self, skip: &[PeerAddress]) -> Option<PeerAddress>;
}

/// What the core needs to know about one virtual network when handling a
/// frame from its interface.
#[derive(Clone, Debug)]
pub struct NetworkView {
    pub network_id: u64,
    /// the local node's MAC on this network
    pub mac: Mac,
    pub multicast_limit: usize,
    pub broadcast_enabled: bool,
    /// peers that receive every multicast regardless of the subscriber list
    pub active_bridges: Vec<PeerAddress>,
    /// opaque membership credential attached to multicast sends, if the
    /// network requires one
    pub membership_credential: Option<Bytes>,
}

#[cfg_attr(test, automock)]
pub trait NetworkRegistry: Send + Sync {
    fn network(&self, network_id: u64) -> Option<NetworkView>;

    /// `include_self`: count a subscription held by the local node itself
    fn is_subscribed(&self, network_id: u64, group: &MulticastGroup, include_self: bool) -> bool;
}

/// Cryptographic sealing of composed packets. The core composes packets in
/// the clear and hands them here before transmission; what "sealing" means
/// (authentication tag, payload encryption) is not this crate's concern.
#[cfg_attr(test, automock)]
pub trait PacketSealer: Send + Sync {
    /// seal in place; false when there is no key material for the destination
    fn seal(&self, packet: &mut Packet, encrypt: bool) -> bool;
}

/// Decode/handle one complete inbound packet addressed to the local node.
#[cfg_attr(test, automock)]
pub trait PacketDecoder: Send + Sync {
    /// true when fully handled; false when decoding is blocked on a peer
    /// identity that is not known yet (the switch parks the packet and
    /// retries after resolution)
    fn try_decode(&self, packet: &IncomingPacket, now: u64) -> bool;
}

/// Hand a composed packet to the switch egress path, which sends it
/// immediately or parks it behind identity resolution.
///
/// This is the seam through which the multicast dispatcher fans out without
/// holding its own lock across the egress path.
#[cfg_attr(test, automock)]
pub trait PacketEgress: Send + Sync {
    fn send_packet(&self, packet: Packet, encrypt: bool, network_id: u64, now: u64);
}

/// A send that was decided under a table lock and is emitted after release.
pub(crate) struct PendingSend {
    pub packet: Packet,
    pub encrypt: bool,
    pub network_id: u64,
}
