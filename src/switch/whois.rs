use std::collections::hash_map::Entry;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::protocol::address::PeerAddress;
use crate::protocol::packet::Packet;
use crate::switch::config::SwitchConfig;
use crate::topology::{PacketSealer, PeerDirectory};
use crate::util::lock;
use crate::util::random::{Random, RngRandom};

/// One address under resolution. The consulted list never repeats a peer
/// within a cycle and never exceeds the retry ceiling.
struct WhoisRequest {
    last_sent: u64,
    peers_consulted: Vec<PeerAddress>,
    retries: usize,
}

/// Tracks outstanding identity lookups and retries them against peers that
/// were not consulted yet, preferring upstream roots. Resolution itself
/// arrives from the outside (a lookup response or a direct hello) - this
/// table only drives the asking.
pub struct IdentityResolver<R: Random = RngRandom> {
    myself: PeerAddress,
    config: Arc<SwitchConfig>,
    peers: Arc<dyn PeerDirectory>,
    sealer: Arc<dyn PacketSealer>,
    outstanding: Mutex<FxHashMap<PeerAddress, WhoisRequest>>,
    pd: PhantomData<R>,
}

impl<R: Random> IdentityResolver<R> {
    pub fn new(
        myself: PeerAddress,
        config: Arc<SwitchConfig>,
        peers: Arc<dyn PeerDirectory>,
        sealer: Arc<dyn PacketSealer>,
    ) -> IdentityResolver<R> {
        IdentityResolver {
            myself,
            config,
            peers,
            sealer,
            outstanding: Default::default(),
            pd: PhantomData,
        }
    }

    /// Starts or pushes a resolution cycle for `address`. A fresh entry asks
    /// immediately; an existing one asks a peer not consulted yet, unless
    /// the ceiling is reached - then the timer sweep decides its fate.
    pub fn request(&self, address: PeerAddress, now: u64) {
        let mut outstanding = lock(&self.outstanding);

        match outstanding.entry(address) {
            Entry::Vacant(e) => {
                let consulted = self.send_request(address, &[], now);
                e.insert(WhoisRequest {
                    last_sent: now,
                    retries: if consulted.is_some() { 1 } else { 0 },
                    peers_consulted: consulted.into_iter().collect(),
                });
            }
            Entry::Occupied(mut e) => {
                let request = e.get_mut();
                if request.retries >= self.config.max_whois_retries {
                    return;
                }
                if let Some(consulted) = self.send_request(address, &request.peers_consulted, now) {
                    request.peers_consulted.push(consulted);
                    request.retries += 1;
                    request.last_sent = now;
                }
            }
        }
    }

    pub fn cancel(&self, address: PeerAddress) {
        lock(&self.outstanding).remove(&address);
    }

    /// the identity became known - drop the entry; the switch drains the
    /// queues that were waiting on it
    pub fn resolve(&self, address: PeerAddress) -> bool {
        lock(&self.outstanding).remove(&address).is_some()
    }

    pub fn is_outstanding(&self, address: PeerAddress) -> bool {
        lock(&self.outstanding).contains_key(&address)
    }

    /// Timer-driven retry pass. Returns the delay until this table next
    /// needs attention, if anything is outstanding.
    pub fn sweep(&self, now: u64) -> Option<u64> {
        let mut next_delay: Option<u64> = None;
        let mut min_delay = |d: u64| {
            next_delay = Some(next_delay.map_or(d, |n: u64| n.min(d)));
        };

        lock(&self.outstanding).retain(|&address, request| {
            let since = now.saturating_sub(request.last_sent);
            if since < self.config.whois_retry_interval {
                min_delay(self.config.whois_retry_interval - since);
                return true;
            }

            if request.retries >= self.config.max_whois_retries {
                debug!("identity lookup for {:?} timed out", address);
                return false;
            }

            if let Some(consulted) = self.send_request(address, &request.peers_consulted, now) {
                request.peers_consulted.push(consulted);
            }
            request.retries += 1;
            request.last_sent = now;
            trace!("identity lookup for {:?} (retry {})", address, request.retries);
            min_delay(self.config.whois_retry_interval);
            true
        });

        next_delay
    }

    /// asks the best root that was not consulted yet; returns the peer asked
    fn send_request(&self, address: PeerAddress, consulted: &[PeerAddress], now: u64) -> Option<PeerAddress> {
        let root = self.peers.best_root(consulted)?;

        let mut packet = Packet::whois(root, self.myself, R::next_u64(), address);
        if !self.sealer.seal(&mut packet, true) {
            return None;
        }
        if self.peers.send(root, packet.as_bytes(), now) {
            Some(root)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn consulted(&self, address: PeerAddress) -> Vec<PeerAddress> {
        lock(&self.outstanding)
            .get(&address)
            .map(|r| r.peers_consulted.clone())
            .unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::Verb;
    use crate::test_util::peer::test_peer_addr_from_number;
    use crate::test_util::topology::TestTopology;

    fn resolver(topology: &Arc<TestTopology>) -> IdentityResolver {
        IdentityResolver::new(
            topology.myself,
            Arc::new(SwitchConfig::new()),
            topology.clone(),
            topology.clone(),
        )
    }

    #[test]
    fn test_request_asks_a_root_and_records_it() {
        let root = test_peer_addr_from_number(100);
        let topology = Arc::new(TestTopology::new(test_peer_addr_from_number(1)));
        topology.add_root(root);

        let resolver = resolver(&topology);
        let target = test_peer_addr_from_number(7);
        resolver.request(target, 1000);

        assert!(resolver.is_outstanding(target));
        assert_eq!(resolver.consulted(target), vec![root]);

        let sent = topology.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, root);
        assert_eq!(sent[0].1.try_verb().unwrap(), Verb::Whois);
    }

    #[test]
    fn test_retries_never_consult_the_same_peer_twice() {
        let topology = Arc::new(TestTopology::new(test_peer_addr_from_number(1)));
        let roots: Vec<_> = (100..104).map(test_peer_addr_from_number).collect();
        for &r in &roots {
            topology.add_root(r);
        }

        let resolver = resolver(&topology);
        let target = test_peer_addr_from_number(7);

        resolver.request(target, 0);
        resolver.sweep(500);
        resolver.sweep(1000);
        resolver.sweep(1500);

        assert_eq!(resolver.consulted(target), roots, "each retry must pick a fresh root");
    }

    #[test]
    fn test_entry_expires_after_retry_ceiling() {
        let topology = Arc::new(TestTopology::new(test_peer_addr_from_number(1)));
        topology.add_root(test_peer_addr_from_number(100));
        topology.add_root(test_peer_addr_from_number(101));

        let resolver = resolver(&topology);
        let target = test_peer_addr_from_number(7);
        resolver.request(target, 0);

        // retries 2..=4 (both roots exhausted, later retries ask nobody new)
        for n in 1..=3u64 {
            resolver.sweep(n * 500);
            assert!(resolver.is_outstanding(target));
        }
        resolver.sweep(4 * 500);
        assert!(!resolver.is_outstanding(target), "ceiling reached - entry must be dropped");
    }

    #[test]
    fn test_resolve_and_cancel_remove_the_entry() {
        let topology = Arc::new(TestTopology::new(test_peer_addr_from_number(1)));
        topology.add_root(test_peer_addr_from_number(100));
        let resolver = resolver(&topology);

        let a = test_peer_addr_from_number(7);
        let b = test_peer_addr_from_number(8);
        resolver.request(a, 0);
        resolver.request(b, 0);

        assert!(resolver.resolve(a));
        assert!(!resolver.resolve(a));
        resolver.cancel(b);
        assert!(!resolver.is_outstanding(a));
        assert!(!resolver.is_outstanding(b));
    }

    #[test]
    fn test_sweep_reports_time_to_next_retry() {
        let topology = Arc::new(TestTopology::new(test_peer_addr_from_number(1)));
        topology.add_root(test_peer_addr_from_number(100));
        let resolver = resolver(&topology);

        assert_eq!(resolver.sweep(0), None, "empty table needs no timer");

        resolver.request(test_peer_addr_from_number(7), 1000);
        assert_eq!(resolver.sweep(1200), Some(300));
        assert_eq!(resolver.sweep(1500), Some(500), "retry just fired");
    }
}
