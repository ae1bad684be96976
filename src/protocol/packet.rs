use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::address::{Mac, PeerAddress};
use crate::protocol::group::MulticastGroup;

/// Protocol message types carried in the packet header's verb byte.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Verb {
    Nop = 0,
    /// in-network ethernet frame: nwid, ether type, raw payload
    Frame = 1,
    /// identity lookup for a 5-byte address
    Whois = 2,
    /// "contact this peer at this physical address" NAT-traversal signal
    Rendezvous = 3,
    /// request for a random subset of a group's known members
    MulticastGather = 4,
    /// one multicast fan-out frame, optionally asking recipients to gather
    MulticastFrame = 5,
}

/// A protocol packet: fixed 28-byte header plus a verb-specific payload.
///
/// Layout (big-endian):
/// ```text
/// [0..8)   packet id
/// [8..13)  destination address
/// [13..18) source address
/// [18]     flags: 0x40 = fragmented, low 3 bits = hops
/// [19..27) authentication tag, zero until sealed (sealing is external)
/// [27]     verb
/// [28..]   verb payload
/// ```
///
/// Source addresses never start with 0xff (reserved prefix), which keeps the
/// fragment indicator at the same offset unambiguous - see [Fragment].
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    buf: BytesMut,
}

impl Packet {
    pub const IDX_PACKET_ID: usize = 0;
    pub const IDX_DESTINATION: usize = 8;
    pub const IDX_SOURCE: usize = 13;
    pub const IDX_FLAGS: usize = 18;
    pub const IDX_AUTH_TAG: usize = 19;
    pub const IDX_VERB: usize = 27;
    pub const HEADER_LENGTH: usize = 28;

    pub const FLAG_FRAGMENTED: u8 = 0x40;
    pub const MASK_HOPS: u8 = 0x07;

    pub const FLAG_MC_CREDENTIAL: u8 = 0x01;
    pub const FLAG_MC_GATHER: u8 = 0x02;
    pub const FLAG_MC_SOURCE_MAC: u8 = 0x04;

    pub fn new(destination: PeerAddress, source: PeerAddress, verb: Verb, packet_id: u64) -> Packet {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u64(packet_id);
        destination.ser(&mut buf);
        source.ser(&mut buf);
        buf.put_u8(0); // flags
        buf.put_u64(0); // authentication tag, filled by the sealing layer
        buf.put_u8(verb.into());
        Packet { buf }
    }

    pub fn try_from_slice(data: &[u8]) -> anyhow::Result<Packet> {
        if data.len() < Self::HEADER_LENGTH {
            return Err(anyhow!("packet too short: {} bytes", data.len()));
        }
        Ok(Packet {
            buf: BytesMut::from(data),
        })
    }

    pub fn packet_id(&self) -> u64 {
        u64::from_be_bytes(self.buf[Self::IDX_PACKET_ID..Self::IDX_PACKET_ID + 8].try_into().unwrap())
    }

    pub fn set_packet_id(&mut self, packet_id: u64) {
        self.buf[Self::IDX_PACKET_ID..Self::IDX_PACKET_ID + 8].copy_from_slice(&packet_id.to_be_bytes());
    }

    pub fn destination(&self) -> PeerAddress {
        Self::address_at(&self.buf, Self::IDX_DESTINATION)
    }

    pub fn set_destination(&mut self, destination: PeerAddress) {
        self.buf[Self::IDX_DESTINATION..Self::IDX_DESTINATION + PeerAddress::LENGTH]
            .copy_from_slice(&destination.to_u64().to_be_bytes()[3..]);
    }

    pub fn source(&self) -> PeerAddress {
        Self::address_at(&self.buf, Self::IDX_SOURCE)
    }

    pub fn try_verb(&self) -> anyhow::Result<Verb> {
        Verb::try_from(self.buf[Self::IDX_VERB]).map_err(|e| anyhow!("unknown verb: {}", e))
    }

    pub fn fragmented(&self) -> bool {
        self.buf[Self::IDX_FLAGS] & Self::FLAG_FRAGMENTED != 0
    }

    pub fn set_fragmented(&mut self, fragmented: bool) {
        if fragmented {
            self.buf[Self::IDX_FLAGS] |= Self::FLAG_FRAGMENTED;
        } else {
            self.buf[Self::IDX_FLAGS] &= !Self::FLAG_FRAGMENTED;
        }
    }

    pub fn hops(&self) -> u8 {
        self.buf[Self::IDX_FLAGS] & Self::MASK_HOPS
    }

    pub fn increment_hops(&mut self) {
        let flags = self.buf[Self::IDX_FLAGS];
        let hops = (flags & Self::MASK_HOPS).saturating_add(1).min(Self::MASK_HOPS);
        self.buf[Self::IDX_FLAGS] = (flags & !Self::MASK_HOPS) | hops;
    }

    pub fn auth_tag(&self) -> &[u8] {
        &self.buf[Self::IDX_AUTH_TAG..Self::IDX_AUTH_TAG + 8]
    }

    pub fn set_auth_tag(&mut self, tag: [u8; 8]) {
        self.buf[Self::IDX_AUTH_TAG..Self::IDX_AUTH_TAG + 8].copy_from_slice(&tag);
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[Self::HEADER_LENGTH..]
    }

    /// reassembly: trailing fragment payloads are appended verbatim
    pub fn append_payload(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    fn address_at(buf: &[u8], idx: usize) -> PeerAddress {
        let mut raw = 0u64;
        for &b in &buf[idx..idx + PeerAddress::LENGTH] {
            raw = (raw << 8) | b as u64;
        }
        PeerAddress::from_u64(raw)
    }

    // ---- verb-specific composition ------------------------------------------------

    pub fn frame(
        destination: PeerAddress,
        source: PeerAddress,
        packet_id: u64,
        network_id: u64,
        ether_type: u16,
        payload: &[u8],
    ) -> Packet {
        let mut p = Packet::new(destination, source, Verb::Frame, packet_id);
        p.buf.put_u64(network_id);
        p.buf.put_u16(ether_type);
        p.buf.put_slice(payload);
        p
    }

    pub fn whois(destination: PeerAddress, source: PeerAddress, packet_id: u64, target: PeerAddress) -> Packet {
        let mut p = Packet::new(destination, source, Verb::Whois, packet_id);
        target.ser(&mut p.buf);
        p
    }

    pub fn rendezvous(
        destination: PeerAddress,
        source: PeerAddress,
        packet_id: u64,
        about: PeerAddress,
        at: SocketAddr,
    ) -> Packet {
        let mut p = Packet::new(destination, source, Verb::Rendezvous, packet_id);
        p.buf.put_u8(0);
        about.ser(&mut p.buf);
        p.buf.put_u16(at.port());
        match at.ip() {
            IpAddr::V4(ip) => {
                p.buf.put_u8(4);
                p.buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                p.buf.put_u8(16);
                p.buf.put_slice(&ip.octets());
            }
        }
        p
    }

    pub fn multicast_gather(
        destination: PeerAddress,
        source: PeerAddress,
        packet_id: u64,
        network_id: u64,
        group: MulticastGroup,
        gather_limit: u32,
    ) -> Packet {
        let mut p = Packet::new(destination, source, Verb::MulticastGather, packet_id);
        p.buf.put_u64(network_id);
        p.buf.put_u8(0);
        group.ser(&mut p.buf);
        p.buf.put_u32(gather_limit);
        p
    }

    #[allow(clippy::too_many_arguments)]
    pub fn multicast_frame(
        destination: PeerAddress,
        source: PeerAddress,
        packet_id: u64,
        network_id: u64,
        credential: Option<&[u8]>,
        gather_limit: u32,
        group: MulticastGroup,
        source_mac: Option<Mac>,
        ether_type: u16,
        payload: &[u8],
    ) -> Packet {
        let mut p = Packet::new(destination, source, Verb::MulticastFrame, packet_id);
        p.buf.put_u64(network_id);

        let mut flags = 0u8;
        if credential.is_some() {
            flags |= Self::FLAG_MC_CREDENTIAL;
        }
        if gather_limit > 0 {
            flags |= Self::FLAG_MC_GATHER;
        }
        if source_mac.is_some() {
            flags |= Self::FLAG_MC_SOURCE_MAC;
        }
        p.buf.put_u8(flags);

        if let Some(credential) = credential {
            p.buf.put_u16(credential.len() as u16);
            p.buf.put_slice(credential);
        }
        if gather_limit > 0 {
            p.buf.put_u32(gather_limit);
        }
        group.ser(&mut p.buf);
        if let Some(mac) = source_mac {
            mac.ser(&mut p.buf);
        }
        p.buf.put_u16(ether_type);
        p.buf.put_slice(payload);
        p
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PKT{{{:016x} {:?}->{:?} verb={:?} len={}}}",
            self.packet_id(),
            self.source(),
            self.destination(),
            self.try_verb().ok(),
            self.len()
        )
    }
}


/// One trailing fragment of an oversized packet. The head (fragment 0) is a
/// regular [Packet] with the fragmented flag set.
///
/// Layout (big-endian):
/// ```text
/// [0..8)   packet id of the fragmented packet
/// [8..13)  destination address
/// [13]     fragment indicator 0xff (never a valid source prefix)
/// [14]     fragment number, 1..=15
/// [15]     total fragment count including the head, 2..=16
/// [16]     hops (low 3 bits)
/// [17..]   fragment payload
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct Fragment {
    buf: BytesMut,
}

impl Fragment {
    pub const IDX_PACKET_ID: usize = 0;
    pub const IDX_DESTINATION: usize = 8;
    pub const IDX_INDICATOR: usize = 13;
    pub const IDX_FRAGMENT_NO: usize = 14;
    pub const IDX_TOTAL_FRAGMENTS: usize = 15;
    pub const IDX_HOPS: usize = 16;
    pub const HEADER_LENGTH: usize = 17;

    pub const INDICATOR: u8 = 0xff;
    /// head plus at most 15 trailing fragments
    pub const MAX_FRAGMENTS: usize = 16;

    pub fn compose(
        packet_id: u64,
        destination: PeerAddress,
        fragment_no: u8,
        total_fragments: u8,
        payload: &[u8],
    ) -> Fragment {
        debug_assert!(fragment_no >= 1 && (fragment_no as usize) < Self::MAX_FRAGMENTS);
        debug_assert!(total_fragments >= 2 && (total_fragments as usize) <= Self::MAX_FRAGMENTS);

        let mut buf = BytesMut::with_capacity(Self::HEADER_LENGTH + payload.len());
        buf.put_u64(packet_id);
        destination.ser(&mut buf);
        buf.put_u8(Self::INDICATOR);
        buf.put_u8(fragment_no);
        buf.put_u8(total_fragments);
        buf.put_u8(0); // hops
        buf.put_slice(payload);
        Fragment { buf }
    }

    pub fn try_from_slice(data: &[u8]) -> anyhow::Result<Fragment> {
        if data.len() <= Self::HEADER_LENGTH {
            return Err(anyhow!("fragment too short: {} bytes", data.len()));
        }
        if data[Self::IDX_INDICATOR] != Self::INDICATOR {
            return Err(anyhow!("missing fragment indicator"));
        }
        let fragment_no = data[Self::IDX_FRAGMENT_NO];
        let total = data[Self::IDX_TOTAL_FRAGMENTS];
        // the head is fragment 0, so a wire fragment is always 1.. of at least 2
        if fragment_no == 0
            || fragment_no as usize >= Self::MAX_FRAGMENTS
            || total < 2
            || total as usize > Self::MAX_FRAGMENTS
        {
            return Err(anyhow!("implausible fragment numbering {}/{}", fragment_no, total));
        }
        Ok(Fragment {
            buf: BytesMut::from(data),
        })
    }

    pub fn packet_id(&self) -> u64 {
        u64::from_be_bytes(self.buf[Self::IDX_PACKET_ID..Self::IDX_PACKET_ID + 8].try_into().unwrap())
    }

    pub fn destination(&self) -> PeerAddress {
        Packet::address_at(&self.buf, Self::IDX_DESTINATION)
    }

    pub fn fragment_no(&self) -> u8 {
        self.buf[Self::IDX_FRAGMENT_NO]
    }

    pub fn total_fragments(&self) -> u8 {
        self.buf[Self::IDX_TOTAL_FRAGMENTS]
    }

    pub fn hops(&self) -> u8 {
        self.buf[Self::IDX_HOPS] & Packet::MASK_HOPS
    }

    pub fn increment_hops(&mut self) {
        let hops = self.hops().saturating_add(1).min(Packet::MASK_HOPS);
        self.buf[Self::IDX_HOPS] = hops;
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[Self::HEADER_LENGTH..]
    }

    pub fn into_payload(mut self) -> Bytes {
        self.buf.advance(Self::HEADER_LENGTH);
        self.buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Debug for Fragment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FRAG{{{:016x} ->{:?} {}/{} len={}}}",
            self.packet_id(),
            self.destination(),
            self.fragment_no(),
            self.total_fragments(),
            self.len()
        )
    }
}

/// Classifies raw inbound bytes: a fragment carries the reserved indicator
/// where a packet head carries the first byte of its source address.
pub fn is_fragment(data: &[u8]) -> bool {
    data.len() > Fragment::IDX_INDICATOR && data[Fragment::IDX_INDICATOR] == Fragment::INDICATOR
}

/// A complete inbound packet on its way through decode, together with its
/// physical origin and arrival time.
pub struct IncomingPacket {
    pub packet: Packet,
    pub from: SocketAddr,
    pub receive_time: u64,
}
