use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::protocol::packet::{Fragment, Packet};
use crate::switch::config::SwitchConfig;
use crate::util::lock;

const MAX_TRAILING: usize = Fragment::MAX_FRAGMENTS - 1;

/// One partially received packet. `have` is a bitmask with the head at bit 0
/// and trailing fragment n at bit n; `total_fragments` stays 0 until any
/// trailing fragment reveals the count.
struct DefragEntry {
    creation_time: u64,
    head: Option<Packet>,
    fragments: [Option<Bytes>; MAX_TRAILING],
    total_fragments: u8,
    have: u32,
}

impl DefragEntry {
    fn new(creation_time: u64) -> DefragEntry {
        DefragEntry {
            creation_time,
            head: None,
            fragments: Default::default(),
            total_fragments: 0,
            have: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.total_fragments != 0 && self.have == (1u32 << self.total_fragments) - 1
    }

    /// head plus all trailing payloads, in fragment order
    fn assemble(mut self) -> Option<Packet> {
        let mut packet = self.head.take()?;
        for fragment in self.fragments.iter_mut().take(self.total_fragments as usize - 1) {
            if let Some(payload) = fragment.take() {
                packet.append_payload(&payload);
            }
        }
        Some(packet)
    }
}

/// Reassembly of fragmented packets, keyed by packet id. Completion promotes
/// the packet to the receive path; anything incomplete past the timeout is
/// dropped silently - reassembly failure is invisible upstream.
pub struct FragmentReassembler {
    config: Arc<SwitchConfig>,
    entries: Mutex<FxHashMap<u64, DefragEntry>>,
}

impl FragmentReassembler {
    pub fn new(config: Arc<SwitchConfig>) -> FragmentReassembler {
        FragmentReassembler {
            config,
            entries: Default::default(),
        }
    }

    /// A trailing fragment arrived (fragment number and total already
    /// validated at parse). Returns the reassembled packet on completion.
    pub fn on_fragment(&self, fragment: Fragment, now: u64) -> Option<Packet> {
        let packet_id = fragment.packet_id();
        let mut entries = lock(&self.entries);

        let entry = entries
            .entry(packet_id)
            .or_insert_with(|| DefragEntry::new(now));

        let bit = 1u32 << fragment.fragment_no();
        if entry.have & bit != 0 {
            trace!("duplicate fragment {}/{} of {:016x}", fragment.fragment_no(), fragment.total_fragments(), packet_id);
            return None;
        }

        entry.have |= bit;
        entry.total_fragments = fragment.total_fragments();
        let fragment_idx = fragment.fragment_no() as usize - 1;
        entry.fragments[fragment_idx] = Some(fragment.into_payload());

        Self::take_if_complete(&mut entries, packet_id)
    }

    /// The head of a fragmented packet arrived. Returns the reassembled
    /// packet if all trailing fragments were already here.
    pub fn on_head(&self, head: Packet, now: u64) -> Option<Packet> {
        let packet_id = head.packet_id();
        let mut entries = lock(&self.entries);

        match entries.entry(packet_id) {
            Entry::Vacant(e) => {
                let mut entry = DefragEntry::new(now);
                entry.head = Some(head);
                entry.have = 1;
                e.insert(entry);
                None
            }
            Entry::Occupied(mut e) => {
                if e.get().have & 1 != 0 {
                    trace!("duplicate head of {:016x}", packet_id);
                    return None;
                }
                e.get_mut().head = Some(head);
                e.get_mut().have |= 1;
                Self::take_if_complete(&mut entries, packet_id)
            }
        }
    }

    /// drops reassembly state older than the fragment timeout
    pub fn sweep(&self, now: u64) {
        lock(&self.entries).retain(|packet_id, entry| {
            if now.saturating_sub(entry.creation_time) > self.config.fragment_timeout {
                debug!("incomplete fragmented packet {:016x} timed out, fragments discarded", packet_id);
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        lock(&self.entries).len()
    }

    fn take_if_complete(entries: &mut FxHashMap<u64, DefragEntry>, packet_id: u64) -> Option<Packet> {
        if !entries.get(&packet_id)?.is_complete() {
            return None;
        }
        entries.remove(&packet_id)?.assemble()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::address::PeerAddress;
    use crate::protocol::packet::Verb;
    use rstest::rstest;

    fn head_packet(packet_id: u64, payload: &[u8]) -> Packet {
        let mut p = Packet::frame(
            PeerAddress::from_u64(1),
            PeerAddress::from_u64(2),
            packet_id,
            0x11,
            0x0800,
            payload,
        );
        p.set_fragmented(true);
        p
    }

    fn reassembler() -> FragmentReassembler {
        FragmentReassembler::new(Arc::new(SwitchConfig::new()))
    }

    #[rstest]
    #[case::head_first(true)]
    #[case::fragments_first(false)]
    fn test_reassembles_in_any_arrival_order(#[case] head_first: bool) {
        let r = reassembler();
        let head = head_packet(7, b"AAAA");
        let expected_len = head.len() + 4;

        let deliver_fragments = |r: &FragmentReassembler| {
            assert!(r.on_fragment(Fragment::compose(7, head.destination(), 1, 3, b"BB"), 0).is_none());
            r.on_fragment(Fragment::compose(7, head.destination(), 2, 3, b"CC"), 0)
        };

        let complete = if head_first {
            assert!(r.on_head(head.clone(), 0).is_none());
            deliver_fragments(&r)
        } else {
            assert!(deliver_fragments(&r).is_none());
            r.on_head(head.clone(), 0)
        };

        let complete = complete.expect("all three pieces arrived");
        assert_eq!(complete.len(), expected_len);
        assert_eq!(complete.packet_id(), 7);
        assert_eq!(complete.try_verb().unwrap(), Verb::Frame);
        assert!(complete.as_bytes().ends_with(b"AAAABBCC"));
        assert_eq!(r.pending(), 0, "completed state must be removed");
    }

    #[test]
    fn test_duplicate_pieces_are_ignored() {
        let r = reassembler();
        let head = head_packet(9, b"x");

        assert!(r.on_head(head.clone(), 0).is_none());
        assert!(r.on_head(head.clone(), 0).is_none());
        assert!(r.on_fragment(Fragment::compose(9, head.destination(), 1, 2, b"y"), 0).is_some());
    }

    #[test]
    fn test_unknown_total_waits_for_a_trailing_fragment() {
        let r = reassembler();
        let head = head_packet(5, b"x");

        // only the head: the total is unknown, nothing can complete
        assert!(r.on_head(head.clone(), 0).is_none());
        assert_eq!(r.pending(), 1);

        let complete = r.on_fragment(Fragment::compose(5, head.destination(), 1, 2, b"tail"), 0);
        assert!(complete.is_some());
    }

    #[test]
    fn test_sweep_drops_stale_entries() {
        let r = reassembler();
        let head = head_packet(5, b"x");
        r.on_head(head.clone(), 1000);

        r.sweep(1500);
        assert_eq!(r.pending(), 1);

        r.sweep(2001);
        assert_eq!(r.pending(), 0);

        // a late fragment just opens a fresh (doomed) entry
        assert!(r.on_fragment(Fragment::compose(5, head.destination(), 1, 2, b"y"), 2002).is_none());
    }
}
