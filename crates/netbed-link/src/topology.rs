//! The topology registry: links plus failed nodes.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use netbed_packet::NodeAddr;

use crate::{Link, LinkError, LinkProfile};

/// Order-independent key for the link between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey(NodeAddr, NodeAddr);

impl LinkKey {
    pub fn new(a: NodeAddr, b: NodeAddr) -> Self {
        if a <= b {
            LinkKey(a, b)
        } else {
            LinkKey(b, a)
        }
    }

    /// Lower address first.
    pub fn nodes(&self) -> (NodeAddr, NodeAddr) {
        (self.0, self.1)
    }
}

/// Registry of links and failed nodes.
///
/// A link is usable when it exists, is live, and neither endpoint is failed.
/// Usability is evaluated on every lookup, so fail and restart commands take
/// effect on the next send. Links are never removed; a restarted link or node
/// keeps its queue clocks.
///
/// In all-to-all mode a lookup for a pair with no configured link uses an
/// implicit link with the default profile. Implicit links only respond to
/// node failures.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: BTreeMap<LinkKey, Link>,
    implicit: BTreeMap<LinkKey, Link>,
    failed: BTreeSet<NodeAddr>,
    all_to_all: bool,
    default_profile: LinkProfile,
}

impl Topology {
    /// An empty topology with no links.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pair of nodes is connected unless configured otherwise.
    pub fn all_to_all() -> Self {
        Topology {
            all_to_all: true,
            ..Self::default()
        }
    }

    /// Profile for implicit all-to-all links.
    pub fn with_default_profile(mut self, profile: LinkProfile) -> Self {
        self.default_profile = profile;
        self
    }

    pub fn is_all_to_all(&self) -> bool {
        self.all_to_all
    }

    pub fn default_profile(&self) -> &LinkProfile {
        &self.default_profile
    }

    /// Create the link between `a` and `b`, or update its profile if it
    /// already exists. An existing link keeps its queue clocks and liveness.
    pub fn upsert_link(
        &mut self,
        a: NodeAddr,
        b: NodeAddr,
        profile: LinkProfile,
    ) -> Result<&mut Link, LinkError> {
        profile.validate()?;
        let key = LinkKey::new(a, b);
        let link = match self.links.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                // Promote a link that was used implicitly so its clocks carry over
                let link = match self.implicit.remove(&key) {
                    Some(link) => link,
                    None => Link::new(a, b, profile)?,
                };
                entry.insert(link)
            }
        };
        link.set_profile(profile)?;
        Ok(link)
    }

    /// Set the liveness flag of a configured link. Returns `false` if there
    /// is no such link.
    pub fn set_link_live(&mut self, a: NodeAddr, b: NodeAddr, live: bool) -> bool {
        match self.links.get_mut(&LinkKey::new(a, b)) {
            Some(link) => {
                link.set_live(live);
                true
            }
            None => false,
        }
    }

    /// Mark a node failed or restarted. Its links are left untouched.
    pub fn set_node_failed(&mut self, addr: NodeAddr, failed: bool) {
        if failed {
            self.failed.insert(addr);
        } else {
            self.failed.remove(&addr);
        }
    }

    pub fn is_node_failed(&self, addr: NodeAddr) -> bool {
        self.failed.contains(&addr)
    }

    /// The configured link between `a` and `b`, regardless of liveness.
    pub fn link(&self, a: NodeAddr, b: NodeAddr) -> Option<&Link> {
        self.links.get(&LinkKey::new(a, b))
    }

    /// All configured links, ordered by key.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    fn usable(&self, a: NodeAddr, b: NodeAddr) -> bool {
        a != b
            && !a.is_broadcast()
            && !b.is_broadcast()
            && !self.failed.contains(&a)
            && !self.failed.contains(&b)
    }

    /// The usable link between `a` and `b`, if any.
    pub fn get_live_link(&mut self, a: NodeAddr, b: NodeAddr) -> Option<&mut Link> {
        if !self.usable(a, b) {
            return None;
        }
        let key = LinkKey::new(a, b);
        if self.links.contains_key(&key) {
            return self.links.get_mut(&key).filter(|link| link.is_live());
        }
        if !self.all_to_all {
            return None;
        }
        let profile = self.default_profile;
        let link = match self.implicit.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(Link::new(a, b, profile).ok()?)
            }
        };
        Some(link)
    }

    /// Profile of the usable link between `a` and `b`, without creating
    /// implicit links.
    pub fn live_profile(&self, a: NodeAddr, b: NodeAddr) -> Option<LinkProfile> {
        if !self.usable(a, b) {
            return None;
        }
        match self.links.get(&LinkKey::new(a, b)) {
            Some(link) if link.is_live() => Some(*link.profile()),
            Some(_) => None,
            None if self.all_to_all => Some(self.default_profile),
            None => None,
        }
    }

    /// Nodes joined to `addr` by a configured link that is currently usable.
    ///
    /// Implicit all-to-all neighbors are not listed since they are unbounded.
    pub fn neighbors(&self, addr: NodeAddr) -> Vec<NodeAddr> {
        self.links
            .values()
            .filter_map(|link| link.other(addr))
            .filter(|&other| self.live_profile(addr, other).is_some())
            .collect()
    }
}
