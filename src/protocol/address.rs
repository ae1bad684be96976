use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut};

/// 40-bit overlay node address, the key for every peer-indexed table in this
/// crate. Addresses are assigned out of band and are immutable once obtained.
///
/// NB: Addresses whose first byte is 0xff are reserved and never assigned -
///  the fragment wire format relies on this (see [crate::protocol::packet]).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerAddress(u64);

impl PeerAddress {
    pub const LENGTH: usize = 5;

    /// the all-zero address, used as a placeholder before a destination is known
    pub const NIL: PeerAddress = PeerAddress(0);

    pub const fn from_u64(raw: u64) -> PeerAddress {
        PeerAddress(raw & 0xff_ffff_ffff)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    pub fn is_reserved(self) -> bool {
        (self.0 >> 32) == 0xff
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uint(self.0, Self::LENGTH);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerAddress> {
        if buf.remaining() < Self::LENGTH {
            return Err(anyhow!("buffer too short for a peer address"));
        }
        Ok(PeerAddress(buf.get_uint(Self::LENGTH)))
    }
}

impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}


/// 48-bit ethernet MAC address as seen on the virtual interface.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Mac(u64);

impl Mac {
    pub const LENGTH: usize = 6;

    pub const BROADCAST: Mac = Mac(0xffff_ffff_ffff);

    pub const fn from_u64(raw: u64) -> Mac {
        Mac(raw & 0xffff_ffff_ffff)
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn first_octet(self) -> u8 {
        (self.0 >> 40) as u8
    }

    /// group bit of the first octet - set for multicast and broadcast
    pub fn is_multicast(self) -> bool {
        (self.0 >> 40) & 0x01 != 0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// The first octet shared by all in-network unicast MACs of one network:
    /// locally administered, unicast, with the network id folded in so that
    /// distinct networks get distinct prefixes.
    pub fn first_octet_for_network(network_id: u64) -> u8 {
        let folded = network_id
            ^ (network_id >> 8)
            ^ (network_id >> 16)
            ^ (network_id >> 24)
            ^ (network_id >> 32)
            ^ (network_id >> 40)
            ^ (network_id >> 48)
            ^ (network_id >> 56);
        (folded as u8 & 0xfe) | 0x02
    }

    /// Deterministic MAC of a peer on a network. The mapping is invertible
    /// via [to_address](Self::to_address), which is how local-frame ingress
    /// resolves destination peers without any lookup table.
    pub fn from_address(address: PeerAddress, network_id: u64) -> Mac {
        let first = Self::first_octet_for_network(network_id) as u64;
        let low = address.to_u64() ^ Self::address_key(network_id);
        Mac((first << 40) | low)
    }

    pub fn to_address(self, network_id: u64) -> PeerAddress {
        PeerAddress::from_u64((self.0 & 0xff_ffff_ffff) ^ Self::address_key(network_id))
    }

    fn address_key(network_id: u64) -> u64 {
        (network_id >> 8) & 0xff_ffff_ffff
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uint(self.0, Self::LENGTH);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Mac> {
        if buf.remaining() < Self::LENGTH {
            return Err(anyhow!("buffer too short for a MAC address"));
        }
        Ok(Mac(buf.get_uint(Self::LENGTH)))
    }
}

impl Debug for Mac {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}
