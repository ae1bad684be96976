use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};

use bytes::{Buf, BufMut};
use rustc_hash::FxHasher;

use crate::protocol::address::Mac;

/// A multicast distribution domain within one network: the multicast (or
/// broadcast) MAC plus a 32-bit additional distinguisher (ADI).
///
/// The same group value can exist on many networks - group state is always
/// keyed by (network id, group), and [address_hash](Self::address_hash)
/// deliberately covers only the group so that lookups must confirm the
/// network id with a full compare.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MulticastGroup {
    mac: Mac,
    adi: u32,
}

impl MulticastGroup {
    pub const LENGTH: usize = Mac::LENGTH + size_of::<u32>();

    pub fn new(mac: Mac, adi: u32) -> MulticastGroup {
        MulticastGroup { mac, adi }
    }

    /// The broadcast-scoping group for IPv4 address resolution: cramming the
    /// address being resolved into the ADI turns the single ARP broadcast
    /// channel into one channel per target address.
    pub fn for_address_resolution(ipv4: [u8; 4]) -> MulticastGroup {
        MulticastGroup {
            mac: Mac::BROADCAST,
            adi: u32::from_be_bytes(ipv4),
        }
    }

    pub fn mac(&self) -> Mac {
        self.mac
    }

    pub fn adi(&self) -> u32 {
        self.adi
    }

    /// hash over the group address only - NOT the network id
    pub fn address_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.mac.to_u64().hash(&mut hasher);
        self.adi.hash(&mut hasher);
        hasher.finish()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.mac.ser(buf);
        buf.put_u32(self.adi);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MulticastGroup> {
        let mac = Mac::try_deser(buf)?;
        let adi = buf.try_get_u32()?;
        Ok(MulticastGroup { mac, adi })
    }
}

impl Debug for MulticastGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{:08x}", self.mac, self.adi)
    }
}
