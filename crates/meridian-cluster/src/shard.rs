//! Key ownership via consistent hashing
//!
//! Every live node places virtual points on a ring; the owner of a key is the
//! first node at or after the key's hash. Adding or removing a node only
//! moves the keys adjacent to its points.

use crate::NodeId;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

const VIRTUAL_NODE_COUNT: usize = 150;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Consistent hash ring over node ids
#[derive(Debug, Default, Clone)]
pub struct ConsistentHashRing {
    /// Virtual nodes on the ring (hash -> node_id)
    ring: BTreeMap<u64, NodeId>,
    /// Real nodes on the ring
    nodes: HashSet<NodeId>,
}

impl ConsistentHashRing {
    /// Create an empty ring
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ring holding `nodes`
    pub fn with_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let mut ring = Self::new();
        for node in nodes {
            ring.add_node(node.into());
        }
        ring
    }

    /// Add a node to the ring
    pub fn add_node(&mut self, node_id: NodeId) {
        if self.nodes.contains(&node_id) {
            return;
        }

        for i in 0..VIRTUAL_NODE_COUNT {
            let hash = Self::hash_key(&format!("{}:{}", node_id, i));
            self.ring.insert(hash, node_id.clone());
        }

        debug!("Added node {} to ownership ring", node_id);
        self.nodes.insert(node_id);
    }

    /// Remove a node from the ring
    pub fn remove_node(&mut self, node_id: &str) {
        if !self.nodes.remove(node_id) {
            return;
        }

        self.ring.retain(|_, v| v != node_id);
        debug!("Removed node {} from ownership ring", node_id);
    }

    /// Owner of a key, `None` when the ring is empty
    pub fn owner(&self, key: &str) -> Option<NodeId> {
        self.owners(key, 1).into_iter().next()
    }

    /// The first `count` distinct nodes for a key, in ring order
    pub fn owners(&self, key: &str, count: usize) -> Vec<NodeId> {
        let mut owners = Vec::new();
        if self.ring.is_empty() || count == 0 {
            return owners;
        }

        let hash = Self::hash_key(key);
        let mut seen = HashSet::new();

        // Walk from the key's position, wrapping around once
        for (_, node_id) in self.ring.range(hash..).chain(self.ring.range(..hash)) {
            if seen.insert(node_id) {
                owners.push(node_id.clone());
                if owners.len() >= count {
                    break;
                }
            }
        }

        owners
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    /// Number of real nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ring position of a key. Every node must compute the same position for
    /// the same key, so this is FNV-1a over the key bytes followed by the
    /// 64-bit murmur3 finalizer, never a hasher whose output may change
    /// between builds.
    fn hash_key(key: &str) -> u64 {
        let mut hash = key.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        });

        // FNV alone leaves the high bits of near-identical keys together
        hash ^= hash >> 33;
        hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
        hash ^= hash >> 33;
        hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        hash ^ (hash >> 33)
    }
}
