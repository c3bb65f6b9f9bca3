//! Versioned routing table.
//!
//! A snapshot of cluster placement: which nodes exist (with location, health
//! metrics and status) and which explicit shard ranges own slices of each
//! collection. Snapshots are immutable; the router swaps whole `Arc`s so
//! readers never observe a partially applied update. A snapshot is adopted
//! only when its version is strictly newer than the current one.

use super::locality::NodeMetrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Inactive,
    Recovering,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub location: String,
    pub metrics: NodeMetrics,
    pub status: NodeStatus,
}

/// One contiguous slice of a collection's id space, inclusive on both ends.
/// Several ranges may carry the same `shard_id` on different nodes; those are
/// replicas of the same shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRange {
    pub shard_id: String,
    pub key_range: (String, String),
    pub node_id: String,
}

impl ShardRange {
    pub fn contains(&self, id: &str) -> bool {
        let (lo, hi) = (&self.key_range.0, &self.key_range.1);
        id >= lo.as_str() && id <= hi.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTable {
    pub version: u64,
    pub nodes: HashMap<String, NodeInfo>,
    pub collections: HashMap<String, Vec<ShardRange>>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self {
            version: 0,
            nodes: HashMap::new(),
            collections: HashMap::new(),
        }
    }

    pub fn node_active(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .map(|info| info.status == NodeStatus::Active)
            .unwrap_or(false)
    }

    pub fn active_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, info)| info.status == NodeStatus::Active)
            .map(|(id, _)| id.clone())
            .collect();
        nodes.sort();
        nodes
    }
}
