use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::protocol::address::{Mac, PeerAddress};
use crate::protocol::group::MulticastGroup;

/// convenience for unit test code: create a [PeerAddress] based on a number,
///  the same number generating the same address and different numbers
///  different addresses
pub fn test_peer_addr_from_number(number: u16) -> PeerAddress {
    PeerAddress::from_u64(0x01_0000_0000 | number as u64)
}

/// a deterministic physical address per number, for path and probe tests
pub fn test_socket_addr_from_number(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), number).into()
}

/// a deterministic multicast group per number (IPv6-multicast-style MAC)
pub fn test_group_from_number(number: u16) -> MulticastGroup {
    MulticastGroup::new(Mac::from_u64(0x3333_0000_0000 | number as u64), 0)
}
