//! Consistent-hash ring with virtual nodes.
//!
//! Each physical node occupies `V` positions on a 32-bit ring, derived by
//! hashing `"{node_id}:{i}"`. A key is owned by the node at the first ring
//! position at or after `hash(key)`, wrapping around past the top. Membership
//! changes therefore remap only the keys adjacent to the added or removed
//! positions.
//!
//! The hash must be stable across restarts and platforms, which is why this
//! uses FNV-1a directly instead of `DefaultHasher`.

use crate::error::{DocError, Result};
use std::collections::BTreeSet;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Stable 32-bit FNV-1a.
pub fn fnv1a32(data: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in data.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    /// Ring positions sorted by (position, node) for deterministic lookups
    /// even when two virtual nodes collide on a position.
    positions: Vec<(u32, String)>,
    nodes: BTreeSet<String>,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            positions: Vec::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Adds a node and its virtual positions. Adding a present node is a no-op.
    pub fn add(&mut self, node_id: &str) {
        if !self.nodes.insert(node_id.to_string()) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let position = fnv1a32(&format!("{node_id}:{i}"));
            self.positions.push((position, node_id.to_string()));
        }
        self.positions.sort();
    }

    /// Removes a node and all of its virtual positions. Unknown nodes are a no-op.
    pub fn remove(&mut self, node_id: &str) {
        if !self.nodes.remove(node_id) {
            return;
        }
        self.positions.retain(|(_, node)| node != node_id);
    }

    /// Owner of `key`: the first ring position at or after `hash(key)`,
    /// wrapping to the lowest position.
    pub fn get(&self, key: &str) -> Result<&str> {
        if self.positions.is_empty() {
            return Err(DocError::EmptyRing);
        }
        let hash = fnv1a32(key);
        let idx = self.positions.partition_point(|(position, _)| *position < hash);
        let (_, node) = if idx == self.positions.len() {
            &self.positions[0]
        } else {
            &self.positions[idx]
        };
        Ok(node)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
