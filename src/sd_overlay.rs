//! Ring Overlay Mock
//!
//! Every simulated node gets a position on a Chord-style identifier ring and a
//! finger table built once from the globally sorted member list. The ring is
//! immutable after construction (no churn), so lookups need no locking and can
//! run from any worker.
//!
//! `lookup` performs exactly one routing hop. `route` is the caller-side loop
//! that keeps hopping until the final owner is reached.

use hashbrown::{HashMap, HashSet};
use log::{debug, warn};
use rand::Rng;

use crate::sd_error::{Result, SimError};
use crate::sd_interface::{Guid, IdSpace, NodeAddress, NodeIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerEntry {
    /// `(node + 2^i) mod 2^B`
    pub target: Guid,
    /// Ring index of the first member at or after `target`
    pub owner: NodeIndex,
}

#[derive(Debug, Clone)]
pub struct RingNode {
    pub guid: Guid,
    pub address: NodeAddress,
    pub fingers: Vec<FingerEntry>,
}

impl RingNode {
    /// Immediate successor on the ring
    pub fn successor(&self) -> NodeIndex {
        self.fingers[0].owner
    }
}

/// Input to ring construction: an identifier and the address it is reachable at
#[derive(Debug, Clone)]
pub struct RingMember {
    pub guid: Guid,
    pub address: NodeAddress,
}

pub struct RingOverlay {
    space: IdSpace,

    /// Sorted by guid ascending; index == ring position
    nodes: Vec<RingNode>,

    by_address: HashMap<NodeAddress, NodeIndex>,
    by_guid: HashMap<Guid, NodeIndex>,
    by_guid_str: HashMap<String, NodeIndex>,
}

/// Ring positions that get distinct mock addresses (the 24 host bits of 10/8)
pub const MAX_MOCK_ADDRESSES: usize = 1 << 24;

/// Mock IPv4 address for a ring position below `MAX_MOCK_ADDRESSES`
pub fn mock_address(index: NodeIndex) -> NodeAddress {
    let i = index as u32;
    format!("10.{}.{}.{}", (i >> 16) & 0xFF, (i >> 8) & 0xFF, i & 0xFF)
}

impl RingOverlay {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Build a ring from supplied members. Order of `members` is irrelevant.
    pub fn from_members(space: IdSpace, mut members: Vec<RingMember>) -> Result<Self> {
        if members.is_empty() {
            return Err(SimError::Config("ring needs at least one member".into()));
        }

        let mut seen = HashSet::with_capacity(members.len());
        for member in &members {
            if !space.contains(member.guid) {
                return Err(SimError::Config(format!(
                    "identifier {} outside {}-bit space",
                    member.guid,
                    space.bits()
                )));
            }
            if !seen.insert(member.guid) {
                return Err(SimError::Config(format!("duplicate identifier {}", member.guid)));
            }
        }

        members.sort_unstable_by_key(|m| m.guid);

        let mut overlay = Self {
            space,
            nodes: members
                .into_iter()
                .map(|m| RingNode {
                    guid: m.guid,
                    address: m.address,
                    fingers: Vec::new(),
                })
                .collect(),
            by_address: HashMap::new(),
            by_guid: HashMap::new(),
            by_guid_str: HashMap::new(),
        };

        overlay.build_fingers();
        overlay.build_indexes()?;

        debug!(
            "ring built: {} members, {} bits, {} finger entries",
            overlay.nodes.len(),
            space.bits(),
            overlay.nodes.len() * space.bits() as usize
        );

        Ok(overlay)
    }

    /// Build a ring of `n` distinct random identifiers. Every identifier in
    /// `reserved` is guaranteed a place on the ring. Addresses are assigned by
    /// ring position.
    pub fn random<R: Rng>(space: IdSpace, n: usize, reserved: &[Guid], rng: &mut R) -> Result<Self> {
        if n == 0 {
            return Err(SimError::Config("node count must be positive".into()));
        }
        if n > MAX_MOCK_ADDRESSES {
            return Err(SimError::Config(format!(
                "{} nodes exceed the {} mock addresses of 10.0.0.0/8",
                n, MAX_MOCK_ADDRESSES
            )));
        }
        if (n as u128) > space.modulus() {
            return Err(SimError::Config(format!(
                "{} nodes do not fit a {}-bit identifier space",
                n,
                space.bits()
            )));
        }

        let mut guids: HashSet<Guid> = HashSet::with_capacity(n);
        for &guid in reserved.iter().take(n) {
            guids.insert(space.wrap(guid));
        }
        while guids.len() < n {
            guids.insert(space.random_guid(rng));
        }

        let mut sorted: Vec<Guid> = guids.into_iter().collect();
        sorted.sort_unstable();

        let members = sorted
            .into_iter()
            .enumerate()
            .map(|(index, guid)| RingMember {
                guid,
                address: mock_address(index),
            })
            .collect();

        Self::from_members(space, members)
    }

    fn build_fingers(&mut self) {
        let bits = self.space.bits();
        let fingers: Vec<Vec<FingerEntry>> = self
            .nodes
            .iter()
            .map(|node| {
                (0..bits)
                    .map(|i| {
                        let target = self.space.finger_target(node.guid, i);
                        FingerEntry {
                            target,
                            owner: self.successor_index(target),
                        }
                    })
                    .collect()
            })
            .collect();

        for (node, table) in self.nodes.iter_mut().zip(fingers) {
            node.fingers = table;
        }
    }

    fn build_indexes(&mut self) -> Result<()> {
        for (index, node) in self.nodes.iter().enumerate() {
            if self.by_address.insert(node.address.clone(), index).is_some() {
                return Err(SimError::Config(format!("duplicate address {}", node.address)));
            }
            self.by_guid.insert(node.guid, index);
            self.by_guid_str.insert(node.guid.to_string(), index);
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Index of the first member whose identifier is >= `key`, wrapping to 0
    pub fn successor_index(&self, key: Guid) -> NodeIndex {
        let idx = self.nodes.partition_point(|n| n.guid < key);
        idx % self.nodes.len()
    }

    /// One routing hop from `from` towards the owner of `key`.
    ///
    /// Returns `(owner, true)` when `key` lies in `(self, successor]`. Otherwise
    /// returns the farthest finger strictly between self and `key` with
    /// `false`. `(from, false)` means no finger makes progress.
    pub fn lookup(&self, from: NodeIndex, key: Guid) -> (NodeIndex, bool) {
        let node = &self.nodes[from];
        let successor = node.successor();

        if self
            .space
            .in_open_closed(key, node.guid, self.nodes[successor].guid)
        {
            return (successor, true);
        }

        for finger in node.fingers.iter().rev() {
            let finger_guid = self.nodes[finger.owner].guid;
            if self.space.in_open(finger_guid, node.guid, key) {
                return (finger.owner, false);
            }
        }

        (from, false)
    }

    /// Hop from `from` until the owner of `key` is found. Returns the owner and
    /// the number of hops taken, or `None` if routing stalls or exceeds
    /// `max_hops`.
    pub fn route(&self, from: NodeIndex, key: Guid, max_hops: usize) -> Option<(NodeIndex, usize)> {
        let mut current = from;
        for hop in 1..=max_hops {
            let (next, is_final) = self.lookup(current, key);
            if is_final {
                return Some((next, hop));
            }
            if next == current {
                warn!(
                    "routing stalled at {} for key {}",
                    self.nodes[current].address, key
                );
                return None;
            }
            current = next;
        }
        warn!("routing for key {} exceeded {} hops", key, max_hops);
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn space(&self) -> IdSpace {
        self.space
    }

    pub fn node(&self, index: NodeIndex) -> Option<&RingNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    pub fn index_by_address(&self, address: &str) -> Option<NodeIndex> {
        self.by_address.get(address).copied()
    }

    pub fn index_by_guid(&self, guid: Guid) -> Option<NodeIndex> {
        self.by_guid.get(&guid).copied()
    }

    pub fn index_by_guid_str(&self, guid: &str) -> Option<NodeIndex> {
        self.by_guid_str.get(guid).copied()
    }
}
