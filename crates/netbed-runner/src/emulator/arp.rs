//! Address-resolution cache for an emulated node.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};

use netbed_link::{LinkProfile, PhysicalLink};
use netbed_metrics::{metric_defs, metrics};
use netbed_packet::NodeAddr;
use tracing::{debug, warn};

use crate::directory::DirectoryMessage;

/// Where to reach one neighbor.
#[derive(Debug, Clone, PartialEq)]
pub struct ArpEntry {
    pub addr: SocketAddr,
    /// Present once the directory has told us the link's profile.
    pub link: Option<PhysicalLink>,
}

/// Neighbor address to transport address, plus the emulated physical link
/// to each neighbor.
#[derive(Debug, Clone, Default)]
pub struct ArpCache {
    entries: BTreeMap<NodeAddr, ArpEntry>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one update from the directory.
    pub fn apply(&mut self, message: DirectoryMessage) {
        match message {
            DirectoryMessage::Reset => {
                self.entries.clear();
                record_update("reset");
            }
            DirectoryMessage::Remove(addr) => {
                self.entries.remove(&addr);
                record_update("remove");
            }
            DirectoryMessage::Add {
                addr,
                host,
                port,
                profile,
            } => {
                if addr.is_broadcast() {
                    warn!(%addr, "Directory announced the broadcast address");
                    return;
                }
                match resolve(&host, port) {
                    Some(socket) => {
                        self.insert(addr, socket, profile);
                        record_update("add");
                    }
                    None => warn!(%addr, %host, port, "Could not resolve neighbor host"),
                }
            }
        }
    }

    /// Record or refresh a neighbor. A neighbor at an unchanged address keeps
    /// its link's queue clock.
    pub fn insert(&mut self, addr: NodeAddr, socket: SocketAddr, profile: Option<LinkProfile>) {
        let kept = self
            .entries
            .remove(&addr)
            .filter(|entry| entry.addr == socket)
            .and_then(|entry| entry.link);

        let link = match (profile, kept) {
            (None, _) => None,
            (Some(profile), Some(mut link)) => match link.set_profile(profile) {
                Ok(()) => Some(link),
                Err(e) => {
                    warn!(%addr, error = %e, "Ignoring invalid link profile");
                    None
                }
            },
            (Some(profile), None) => match PhysicalLink::new(profile) {
                Ok(link) => Some(link),
                Err(e) => {
                    warn!(%addr, error = %e, "Ignoring invalid link profile");
                    None
                }
            },
        };
        debug!(%addr, %socket, emulated = link.is_some(), "Neighbor added");
        self.entries.insert(addr, ArpEntry { addr: socket, link });
    }

    /// Note the source of an inbound packet. A new or moved neighbor is
    /// recorded without a link profile. Returns `true` if the cache changed.
    pub fn observe(&mut self, addr: NodeAddr, from: SocketAddr) -> bool {
        if addr.is_broadcast() {
            return false;
        }
        if self.entries.get(&addr).is_some_and(|entry| entry.addr == from) {
            return false;
        }
        debug!(%addr, %from, "Learned neighbor from inbound packet");
        self.entries.insert(
            addr,
            ArpEntry {
                addr: from,
                link: None,
            },
        );
        true
    }

    pub fn get(&self, addr: NodeAddr) -> Option<&ArpEntry> {
        self.entries.get(&addr)
    }

    pub fn get_mut(&mut self, addr: NodeAddr) -> Option<&mut ArpEntry> {
        self.entries.get_mut(&addr)
    }

    pub fn contains(&self, addr: NodeAddr) -> bool {
        self.entries.contains_key(&addr)
    }

    /// Known neighbor addresses in ascending order.
    pub fn neighbors(&self) -> Vec<NodeAddr> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

fn record_update(kind: &'static str) {
    metrics::counter!(metric_defs::DIRECTORY_UPDATES.name, "kind" => kind).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use netbed_common::{PacketCounters, SimTime};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::time::Duration;

    fn add(addr: u8, port: u16, profile: Option<LinkProfile>) -> DirectoryMessage {
        DirectoryMessage::Add {
            addr: NodeAddr(addr),
            host: "127.0.0.1".to_string(),
            port,
            profile,
        }
    }

    #[test]
    fn test_add_remove_reset() {
        let mut arp = ArpCache::new();
        arp.apply(add(1, 5001, None));
        arp.apply(add(2, 5002, Some(LinkProfile::default())));
        assert_eq!(arp.neighbors(), vec![NodeAddr(1), NodeAddr(2)]);
        assert_eq!(
            arp.get(NodeAddr(1)).unwrap().addr,
            "127.0.0.1:5001".parse().unwrap()
        );
        assert!(arp.get(NodeAddr(1)).unwrap().link.is_none());
        assert!(arp.get(NodeAddr(2)).unwrap().link.is_some());

        arp.apply(DirectoryMessage::Remove(NodeAddr(1)));
        assert_eq!(arp.neighbors(), vec![NodeAddr(2)]);

        arp.apply(DirectoryMessage::Reset);
        assert!(arp.is_empty());
    }

    #[test]
    fn test_refresh_keeps_link_clock() {
        let mut arp = ArpCache::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut counters = PacketCounters::new();
        arp.apply(add(1, 5001, Some(LinkProfile::default())));
        arp.get_mut(NodeAddr(1))
            .unwrap()
            .link
            .as_mut()
            .unwrap()
            .schedule(100, SimTime::ZERO, &mut rng, &mut counters)
            .unwrap();

        let slower = LinkProfile::default().with_delay(Duration::from_millis(9));
        arp.apply(add(1, 5001, Some(slower)));
        let link = arp.get(NodeAddr(1)).unwrap().link.as_ref().unwrap();
        assert_eq!(link.next_send_time(), SimTime::from_millis(10));
        assert_eq!(link.profile().delay, Duration::from_millis(9));

        // A moved neighbor starts over
        arp.apply(add(1, 5009, Some(slower)));
        let link = arp.get(NodeAddr(1)).unwrap().link.as_ref().unwrap();
        assert_eq!(link.next_send_time(), SimTime::ZERO);
    }

    #[test]
    fn test_observe() {
        let mut arp = ArpCache::new();
        let from: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        assert!(arp.observe(NodeAddr(7), from));
        assert!(!arp.observe(NodeAddr(7), from));
        assert!(arp.observe(NodeAddr(7), "127.0.0.1:6001".parse().unwrap()));
        assert!(!arp.observe(NodeAddr::BROADCAST, from));
        assert_eq!(arp.len(), 1);
    }

    #[test]
    fn test_broadcast_add_is_ignored() {
        let mut arp = ArpCache::new();
        arp.apply(add(255, 5001, None));
        assert!(arp.is_empty());
    }
}
