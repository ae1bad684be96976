use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::protocol::address::PeerAddress;
use crate::protocol::packet::Packet;
use crate::switch::config::SwitchConfig;
use crate::util::lock;

/// A fully composed packet that could not be sent yet, usually because the
/// destination's identity is still being resolved.
pub struct TxQueueEntry {
    pub creation_time: u64,
    pub network_id: u64,
    pub packet: Packet,
    pub encrypt: bool,
}

/// Egress packets parked per destination, in insertion order. Entries leave
/// by being drained after identity resolution, by an opportunistic retry in
/// the timer sweep, or by aging out - an unresolvable destination never
/// blocks memory indefinitely.
pub struct OutboundQueue {
    config: Arc<SwitchConfig>,
    queue: Mutex<FxHashMap<PeerAddress, VecDeque<TxQueueEntry>>>,
}

impl OutboundQueue {
    pub fn new(config: Arc<SwitchConfig>) -> OutboundQueue {
        OutboundQueue {
            config,
            queue: Default::default(),
        }
    }

    pub fn enqueue(&self, destination: PeerAddress, entry: TxQueueEntry) {
        lock(&self.queue).entry(destination).or_default().push_back(entry);
    }

    /// Sends everything parked for `destination`, oldest first. `try_send`
    /// reports whether an entry actually left; on the first failure the
    /// remainder stays queued in order.
    pub fn drain(&self, destination: PeerAddress, mut try_send: impl FnMut(&TxQueueEntry) -> bool) {
        let mut queue = lock(&self.queue);
        if let Some(entries) = queue.get_mut(&destination) {
            while let Some(entry) = entries.front() {
                if !try_send(entry) {
                    break;
                }
                entries.pop_front();
            }
            if entries.is_empty() {
                queue.remove(&destination);
            }
        }
    }

    /// Timer pass: retry every entry once, then age out what still would not
    /// go through.
    pub fn sweep(&self, now: u64, mut try_send: impl FnMut(&TxQueueEntry) -> bool) {
        let mut queue = lock(&self.queue);
        for (destination, entries) in queue.iter_mut() {
            entries.retain(|entry| {
                if try_send(entry) {
                    return false;
                }
                if now.saturating_sub(entry.creation_time) > self.config.tx_queue_timeout {
                    debug!("queued packet for {:?} timed out unsent", destination);
                    return false;
                }
                true
            });
        }
        queue.retain(|_, entries| !entries.is_empty());
    }

    pub fn queued_for(&self, destination: PeerAddress) -> usize {
        lock(&self.queue).get(&destination).map_or(0, |e| e.len())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::Verb;
    use crate::test_util::peer::test_peer_addr_from_number;

    fn entry(creation_time: u64, payload_marker: u64) -> TxQueueEntry {
        TxQueueEntry {
            creation_time,
            network_id: 0x11,
            packet: Packet::new(
                test_peer_addr_from_number(9),
                test_peer_addr_from_number(1),
                Verb::Frame,
                payload_marker,
            ),
            encrypt: true,
        }
    }

    #[test]
    fn test_drain_is_fifo_per_destination() {
        let queue = OutboundQueue::new(Arc::new(SwitchConfig::new()));
        let dest = test_peer_addr_from_number(9);

        for n in 0..5 {
            queue.enqueue(dest, entry(0, n));
        }

        let mut sent = Vec::new();
        queue.drain(dest, |e| {
            sent.push(e.packet.packet_id());
            true
        });

        assert_eq!(sent, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.queued_for(dest), 0);
    }

    #[test]
    fn test_drain_stops_on_failure_and_keeps_order() {
        let queue = OutboundQueue::new(Arc::new(SwitchConfig::new()));
        let dest = test_peer_addr_from_number(9);
        for n in 0..3 {
            queue.enqueue(dest, entry(0, n));
        }

        let mut attempts = 0;
        queue.drain(dest, |_| {
            attempts += 1;
            attempts > 1 // first attempt fails
        });

        assert_eq!(attempts, 1);
        assert_eq!(queue.queued_for(dest), 3);
    }

    #[test]
    fn test_sweep_retries_then_expires() {
        let queue = OutboundQueue::new(Arc::new(SwitchConfig::new()));
        let dest = test_peer_addr_from_number(9);
        let other = test_peer_addr_from_number(10);

        queue.enqueue(dest, entry(0, 1));
        queue.enqueue(other, entry(4000, 2));

        // nothing sendable, dest entry is over the 5s timeout
        queue.sweep(6000, |_| false);
        assert_eq!(queue.queued_for(dest), 0);
        assert_eq!(queue.queued_for(other), 1);

        // opportunistic retry drains the survivor
        queue.sweep(6001, |_| true);
        assert_eq!(queue.queued_for(other), 0);
    }
}
