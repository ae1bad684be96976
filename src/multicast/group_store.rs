use tracing::trace;

use crate::multicast::outbound::OutboundMulticast;
use crate::protocol::address::PeerAddress;
use crate::protocol::group::MulticastGroup;
use crate::util::hash_table::{OpenAddressTable, TableEntry, TableKey};

/// One known subscriber of a group, refreshed in place whenever it is
/// re-observed - there is never more than one entry per address.
pub(crate) struct MulticastGroupMember {
    pub address: PeerAddress,
    pub last_seen: u64,
}

/// Everything tracked for one (network, group) pair: the subscribers we have
/// learned, the outbound multicasts still collecting recipients, and the
/// gather rate-limit timestamp.
pub(crate) struct MulticastGroupState {
    pub network_id: u64,
    pub group: MulticastGroup,
    pub last_explicit_gather: u64,
    pub members: Vec<MulticastGroupMember>,
    pub tx_queue: Vec<OutboundMulticast>,
}

impl MulticastGroupState {
    fn new(network_id: u64, group: MulticastGroup) -> MulticastGroupState {
        MulticastGroupState {
            network_id,
            group,
            last_explicit_gather: 0,
            members: Vec::new(),
            tx_queue: Vec::new(),
        }
    }
}

impl TableEntry for MulticastGroupState {
    fn entry_hash(&self) -> u64 {
        self.group.address_hash()
    }
}

/// Probe key for the group table. The hash covers the group address only
/// (the same group exists on many networks), so equality must confirm the
/// network id as well - a cross-network hash collision is a different group.
struct GroupRef {
    network_id: u64,
    group: MulticastGroup,
}

impl TableKey<MulticastGroupState> for GroupRef {
    fn key_hash(&self) -> u64 {
        self.group.address_hash()
    }

    fn matches(&self, entry: &MulticastGroupState) -> bool {
        entry.network_id == self.network_id && entry.group == self.group
    }
}

/// The group database, indexed by the open-addressing table so the lookup on
/// every multicast send and receive stays O(1) without per-erase rehashing.
pub(crate) struct MulticastGroupStore {
    table: OpenAddressTable<MulticastGroupState>,
}

impl MulticastGroupStore {
    pub fn new() -> MulticastGroupStore {
        MulticastGroupStore {
            table: OpenAddressTable::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn find(&self, network_id: u64, group: MulticastGroup) -> Option<&MulticastGroupState> {
        self.table.find(&GroupRef { network_id, group })
    }

    pub fn find_mut(&mut self, network_id: u64, group: MulticastGroup) -> Option<&mut MulticastGroupState> {
        self.table.find_mut(&GroupRef { network_id, group })
    }

    /// Find-or-create. Creation is refused (None) once `max_groups` is
    /// reached - the ceiling bounds memory under flood, and every creation
    /// path shares this check.
    pub fn get_or_create(
        &mut self,
        network_id: u64,
        group: MulticastGroup,
        max_groups: usize,
    ) -> Option<&mut MulticastGroupState> {
        let key = GroupRef { network_id, group };
        if self.table.find(&key).is_none() {
            if self.table.len() >= max_groups {
                trace!("group ceiling reached, not tracking {:?} on {:016x}", group, network_id);
                return None;
            }
            self.table.insert(&key, MulticastGroupState::new(network_id, group));
        }
        self.table.find_mut(&key)
    }

    pub fn erase(&mut self, network_id: u64, group: MulticastGroup) -> bool {
        self.table.erase(&GroupRef { network_id, group })
    }

    pub fn retain(&mut self, f: impl FnMut(&mut MulticastGroupState) -> bool) {
        self.table.retain(f);
    }

    pub fn compact(&mut self) {
        self.table.compact();
    }
}
