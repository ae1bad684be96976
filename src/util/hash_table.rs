use std::fmt::{Debug, Formatter};

/// A probe key for [OpenAddressTable]. A key must hash exactly like every
/// entry it can match - lookups compare hashes implicitly by probing from
/// `key_hash & mask` and explicitly via [TableKey::matches].
pub trait TableKey<T> {
    fn key_hash(&self) -> u64;
    fn matches(&self, entry: &T) -> bool;
}

/// Entries carry their own hash so the table can rehash on resize without
/// involving the caller. Mutable access to an entry must never change the
/// value this returns, nor what any key matches.
pub trait TableEntry {
    fn entry_hash(&self) -> u64;
}

enum Slot<T> {
    Empty,
    /// erased but not reclaimed - probe sequences walk over it until [OpenAddressTable::compact]
    Tombstone,
    Occupied(T),
}

/// Open-addressing hash set with linear probing and tombstone deletion.
///
/// Capacity is always a power of two so that `hash & (capacity - 1)` replaces
/// the modulo, and erasing never relocates other entries. The price is that
/// tombstones accumulate until an explicit [compact](OpenAddressTable::compact),
/// which the periodic sweeps of the callers provide. Iteration order is
/// unspecified and changes across inserts, erases and resizes.
pub struct OpenAddressTable<T: TableEntry> {
    slots: Vec<Slot<T>>,
    live: usize,
}

impl<T: TableEntry> OpenAddressTable<T> {
    pub const MIN_CAPACITY: usize = 8;

    pub fn new() -> OpenAddressTable<T> {
        OpenAddressTable {
            slots: (0..Self::MIN_CAPACITY).map(|_| Slot::Empty).collect(),
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Inserts `value` unless an entry matching `key` is already present, in
    /// which case the table is unchanged and `false` is returned. `key` must
    /// be the key of `value` itself.
    pub fn insert(&mut self, key: &impl TableKey<T>, value: T) -> bool {
        debug_assert_eq!(key.key_hash(), value.entry_hash());

        let mask = self.slots.len() - 1;
        let mut p = (key.key_hash() as usize) & mask;
        let mut reusable: Option<usize> = None;

        // probe past tombstones: an equal live entry may sit beyond them
        for _ in 0..self.slots.len() {
            match &self.slots[p] {
                Slot::Occupied(e) if key.matches(e) => return false,
                Slot::Occupied(_) => {}
                Slot::Tombstone => {
                    if reusable.is_none() {
                        reusable = Some(p);
                    }
                }
                Slot::Empty => {
                    self.slots[reusable.unwrap_or(p)] = Slot::Occupied(value);
                    self.live += 1;
                    self.grow_if_loaded();
                    return true;
                }
            }
            p = (p + 1) & mask;
        }

        // no empty slot left on the whole ring, only tombstones: reuse one.
        // The load factor keeps live strictly below capacity, so one exists.
        if let Some(p) = reusable {
            self.slots[p] = Slot::Occupied(value);
            self.live += 1;
            self.grow_if_loaded();
            return true;
        }
        unreachable!("open-addressing table full despite load-factor bound");
    }

    pub fn find<K: TableKey<T>>(&self, key: &K) -> Option<&T> {
        self.probe(key).map(|p| match &self.slots[p] {
            Slot::Occupied(e) => e,
            _ => unreachable!(),
        })
    }

    pub fn find_mut<K: TableKey<T>>(&mut self, key: &K) -> Option<&mut T> {
        match self.probe(key) {
            Some(p) => match &mut self.slots[p] {
                Slot::Occupied(e) => Some(e),
                _ => unreachable!(),
            },
            None => None,
        }
    }

    /// Marks the matching entry's slot as a tombstone. Does not shrink.
    pub fn erase<K: TableKey<T>>(&mut self, key: &K) -> bool {
        match self.probe(key) {
            Some(p) => {
                self.slots[p] = Slot::Tombstone;
                self.live -= 1;
                true
            }
            None => false,
        }
    }

    /// Sweep: drops every entry for which `f` returns false, tombstoning its
    /// slot. `f` may mutate entries but must keep their hash stable.
    pub fn retain(&mut self, mut f: impl FnMut(&mut T) -> bool) {
        for slot in self.slots.iter_mut() {
            if let Slot::Occupied(e) = slot {
                if !f(e) {
                    *slot = Slot::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(e) => Some(e),
            _ => None,
        })
    }

    /// Rehashes into the smallest power-of-two capacity that is at least
    /// [MIN_CAPACITY](Self::MIN_CAPACITY) and keeps the load under 50%,
    /// reclaiming all tombstones.
    pub fn compact(&mut self) {
        let mut new_capacity = self.slots.len();
        while new_capacity > Self::MIN_CAPACITY && self.live < new_capacity / 2 {
            new_capacity >>= 1;
        }
        self.resize(new_capacity);
    }

    fn probe<K: TableKey<T>>(&self, key: &K) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut p = (key.key_hash() as usize) & mask;

        for _ in 0..self.slots.len() {
            match &self.slots[p] {
                Slot::Occupied(e) if key.matches(e) => return Some(p),
                Slot::Occupied(_) | Slot::Tombstone => {}
                Slot::Empty => return None,
            }
            p = (p + 1) & mask;
        }
        None
    }

    fn grow_if_loaded(&mut self) {
        let capacity = self.slots.len();
        // > 87.5%
        if self.live > (capacity / 2) + (capacity / 4) + (capacity / 8) {
            self.resize(capacity << 1);
        }
    }

    fn resize(&mut self, new_capacity: usize) {
        debug_assert!(new_capacity.is_power_of_two() && new_capacity >= Self::MIN_CAPACITY);

        let old = std::mem::replace(
            &mut self.slots,
            (0..new_capacity).map(|_| Slot::Empty).collect(),
        );

        let mask = new_capacity - 1;
        for slot in old {
            if let Slot::Occupied(e) = slot {
                let mut p = (e.entry_hash() as usize) & mask;
                while !matches!(self.slots[p], Slot::Empty) {
                    p = (p + 1) & mask;
                }
                self.slots[p] = Slot::Occupied(e);
            }
        }
    }
}

impl<T: TableEntry> Default for OpenAddressTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TableEntry + Debug> Debug for OpenAddressTable<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// entry with an explicitly controlled hash, for forcing probe collisions
    #[derive(Debug, Eq, PartialEq, Clone)]
    struct E {
        key: u64,
        hash: u64,
    }
    impl TableEntry for E {
        fn entry_hash(&self) -> u64 {
            self.hash
        }
    }

    struct K {
        key: u64,
        hash: u64,
    }
    impl TableKey<E> for K {
        fn key_hash(&self) -> u64 {
            self.hash
        }
        fn matches(&self, entry: &E) -> bool {
            entry.key == self.key
        }
    }

    fn e(key: u64, hash: u64) -> E {
        E { key, hash }
    }
    fn k(key: u64, hash: u64) -> K {
        K { key, hash }
    }

    #[test]
    fn test_insert_find_erase() {
        let mut table = OpenAddressTable::new();

        assert!(table.insert(&k(1, 1), e(1, 1)));
        assert!(table.insert(&k(2, 2), e(2, 2)));
        assert!(!table.insert(&k(1, 1), e(1, 1)), "duplicate insert must be rejected");

        assert_eq!(table.len(), 2);
        assert_eq!(table.find(&k(1, 1)), Some(&e(1, 1)));
        assert_eq!(table.find(&k(3, 3)), None);

        assert!(table.erase(&k(1, 1)));
        assert!(!table.erase(&k(1, 1)));
        assert_eq!(table.find(&k(1, 1)), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_probing_walks_over_tombstones() {
        let mut table = OpenAddressTable::new();

        // three entries colliding on the same slot, then erase the middle one
        assert!(table.insert(&k(10, 5), e(10, 5)));
        assert!(table.insert(&k(11, 5), e(11, 5)));
        assert!(table.insert(&k(12, 5), e(12, 5)));
        assert!(table.erase(&k(11, 5)));

        // the entry behind the tombstone must remain reachable
        assert_eq!(table.find(&k(12, 5)), Some(&e(12, 5)));

        // and re-inserting the erased key must not duplicate the one behind it
        assert!(table.insert(&k(11, 5), e(11, 5)));
        assert!(!table.insert(&k(12, 5), e(12, 5)));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_grows_past_load_factor() {
        let mut table = OpenAddressTable::new();
        assert_eq!(table.capacity(), 8);

        for n in 0..7 {
            assert!(table.insert(&k(n, n), e(n, n)));
        }
        assert_eq!(table.capacity(), 8, "7/8 load is on the threshold, not over it");

        assert!(table.insert(&k(7, 7), e(7, 7)));
        assert_eq!(table.capacity(), 16);

        for n in 0..8 {
            assert_eq!(table.find(&k(n, n)), Some(&e(n, n)), "entry {} lost in resize", n);
        }
    }

    #[test]
    fn test_compact_shrinks_and_preserves_entries() {
        let mut table = OpenAddressTable::new();

        for n in 0..100 {
            assert!(table.insert(&k(n, n * 31), e(n, n * 31)));
        }
        let grown = table.capacity();
        assert!(grown >= 128);

        for n in 3..100 {
            assert!(table.erase(&k(n, n * 31)));
        }
        assert_eq!(table.capacity(), grown, "erase must not shrink");

        table.compact();
        assert_eq!(table.capacity(), OpenAddressTable::<E>::MIN_CAPACITY);
        for n in 0..3 {
            assert_eq!(table.find(&k(n, n * 31)), Some(&e(n, n * 31)));
        }
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_retain_sweeps_and_tombstones() {
        let mut table = OpenAddressTable::new();
        for n in 0..20 {
            table.insert(&k(n, n), e(n, n));
        }

        table.retain(|entry| entry.key % 2 == 0);

        assert_eq!(table.len(), 10);
        assert_eq!(table.find(&k(3, 3)), None);
        assert_eq!(table.find(&k(4, 4)), Some(&e(4, 4)));
    }

    #[rstest]
    #[case::few(5)]
    #[case::many(500)]
    fn test_churn_keeps_set_semantics(#[case] rounds: u64) {
        let mut table = OpenAddressTable::new();

        // alternating insert/erase with a narrow hash range provokes long
        // probe chains and tombstone-heavy rings
        for n in 0..rounds {
            assert!(table.insert(&k(n, n % 4), e(n, n % 4)));
            if n >= 2 {
                assert!(table.erase(&k(n - 2, (n - 2) % 4)));
            }
        }
        table.compact();

        let expected: Vec<u64> = (rounds.saturating_sub(2)..rounds).collect();
        assert_eq!(table.len(), expected.len());
        for n in expected {
            assert!(table.find(&k(n, n % 4)).is_some());
        }
        assert!(table.capacity().is_power_of_two());
        assert!(table.capacity() >= OpenAddressTable::<E>::MIN_CAPACITY);
    }

    #[test]
    fn test_insert_into_tombstone_only_ring() {
        let mut table = OpenAddressTable::new();

        // fill and erase so that most slots are tombstones, then insert with
        // a hash that lands on a tombstone run
        for n in 0..7 {
            table.insert(&k(n, 0), e(n, 0));
        }
        for n in 0..7 {
            table.erase(&k(n, 0));
        }
        assert!(table.insert(&k(100, 0), e(100, 0)));
        assert_eq!(table.find(&k(100, 0)), Some(&e(100, 0)));
    }
}
