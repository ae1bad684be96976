use std::collections::hash_map::Entry;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::protocol::address::PeerAddress;
use crate::protocol::packet::Packet;
use crate::switch::config::SwitchConfig;
use crate::topology::{PacketSealer, PeerDirectory};
use crate::util::lock;
use crate::util::random::{Random, RngRandom};

/// One active attempt to open a direct path to a peer, advanced step by step
/// by the timer until it succeeds or runs out of strategies.
struct ContactEntry {
    peer: PeerAddress,
    fire_at: u64,
    address: SocketAddr,
    strategy_step: u32,
}

/// Coordinates NAT traversal: rate-limited pairwise rendezvous signaling and
/// the per-peer contact schedule that escalates through traversal
/// strategies (direct probe, then sequential ports for NATs that remap
/// predictably).
pub struct NatCoordinator<R: Random = RngRandom> {
    myself: PeerAddress,
    config: Arc<SwitchConfig>,
    peers: Arc<dyn PeerDirectory>,
    sealer: Arc<dyn PacketSealer>,
    /// key is the pair in ascending order, so (a,b) and (b,a) share a slot
    last_unite_attempt: Mutex<FxHashMap<(PeerAddress, PeerAddress), u64>>,
    contacts: Mutex<Vec<ContactEntry>>,
    pd: PhantomData<R>,
}

impl<R: Random> NatCoordinator<R> {
    pub fn new(
        myself: PeerAddress,
        config: Arc<SwitchConfig>,
        peers: Arc<dyn PeerDirectory>,
        sealer: Arc<dyn PacketSealer>,
    ) -> NatCoordinator<R> {
        NatCoordinator {
            myself,
            config,
            peers,
            sealer,
            last_unite_attempt: Default::default(),
            contacts: Default::default(),
            pd: PhantomData,
        }
    }

    /// Sends each of two peers the other's best path so they can attempt a
    /// direct connection. Requires both paths to be known. Attempts per pair
    /// are rate limited unless `force` is set. Returns whether rendezvous
    /// signals went out.
    pub fn unite(&self, p1: PeerAddress, p2: PeerAddress, force: bool, now: u64) -> bool {
        if p1 == self.myself || p2 == self.myself || p1 == p2 {
            return false;
        }
        let Some(p1_path) = self.peers.best_path(p1, now) else {
            return false;
        };
        let Some(p2_path) = self.peers.best_path(p2, now) else {
            return false;
        };

        {
            let mut last_attempt = lock(&self.last_unite_attempt);
            match last_attempt.entry(Self::unite_key(p1, p2)) {
                Entry::Occupied(mut e) => {
                    if !force && now.saturating_sub(*e.get()) < self.config.min_unite_interval {
                        trace!("unite {:?} <> {:?} rate limited", p1, p2);
                        return false;
                    }
                    e.insert(now);
                }
                Entry::Vacant(e) => {
                    e.insert(now);
                }
            }
        }

        debug!("unite: {:?}({}) <> {:?}({})", p1, p1_path, p2, p2_path);

        // NAT traversal can be sensitive to which side initiates first, so
        // the order of the two signals is flipped at random between attempts
        let mut alt = (R::next_u64() & 1) as u32;
        let completed = alt + 2;
        while alt != completed {
            if alt & 1 == 0 {
                self.send_rendezvous(p1, p2, p2_path, now);
            } else {
                self.send_rendezvous(p2, p1, p1_path, now);
            }
            alt += 1;
        }
        true
    }

    /// Starts contacting a peer at a physical address (we just learned it
    /// via rendezvous): probe immediately, then escalate on a schedule.
    pub fn rendezvous(&self, peer: PeerAddress, at: SocketAddr, now: u64) {
        debug!("sending NAT-t probe to {:?}({})", peer, at);
        self.peers.contact_at(peer, at, now);
        lock(&self.contacts).push(ContactEntry {
            peer,
            fire_at: now + self.config.nat_escalation_delay,
            address: at,
            strategy_step: 0,
        });
    }

    /// Timer pass over the contact schedule. Returns the delay until the
    /// next due entry, if any remain.
    pub fn advance_contacts(&self, now: u64) -> Option<u64> {
        let mut next_delay: Option<u64> = None;
        let mut min_delay = |d: u64| {
            next_delay = Some(next_delay.map_or(d, |n: u64| n.min(d)));
        };

        lock(&self.contacts).retain_mut(|entry| {
            if now < entry.fire_at {
                min_delay(entry.fire_at - now);
                return true;
            }

            // done or hopeless - either way stop probing
            if !self.peers.is_alive(entry.peer, now) || self.peers.has_direct_path(entry.peer, now) {
                return false;
            }

            if entry.strategy_step == 0 {
                // first strategy: probe the advertised address directly
                self.peers.contact_at(entry.peer, entry.address, now);
            } else if entry.strategy_step <= self.config.nat_port_escalation_steps {
                // subsequent strategies: walk upward through adjacent ports
                // for symmetric NATs that remap sequentially
                match entry.address.port().checked_add(entry.strategy_step as u16) {
                    Some(port) => {
                        let mut probe = entry.address;
                        probe.set_port(port);
                        self.peers.contact_at(entry.peer, probe, now);
                    }
                    None => return false,
                }
            } else {
                trace!("contact schedule for {:?} exhausted", entry.peer);
                return false;
            }

            entry.strategy_step += 1;
            entry.fire_at = now + self.config.nat_escalation_delay;
            min_delay(self.config.nat_escalation_delay);
            true
        });

        next_delay
    }

    fn send_rendezvous(&self, to: PeerAddress, about: PeerAddress, at: SocketAddr, now: u64) {
        let mut packet = Packet::rendezvous(to, self.myself, R::next_u64(), about, at);
        if self.sealer.seal(&mut packet, true) {
            self.peers.send(to, packet.as_bytes(), now);
        }
    }

    fn unite_key(p1: PeerAddress, p2: PeerAddress) -> (PeerAddress, PeerAddress) {
        if p1 <= p2 {
            (p1, p2)
        } else {
            (p2, p1)
        }
    }
}
