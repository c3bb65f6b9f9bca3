//! Shard-manager records.
//!
//! Nodes and shards as the manager tracks them, persisted under `node:{id}`
//! and `shard:{id}` respectively.

use crate::routing::locality::NodeMetrics;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardStatus {
    Active,
    /// Ownership is being transferred; traffic still goes to the old owner
    /// until the flip completes.
    Migrating,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRecord {
    pub id: String,
    /// Set when the shard owns an explicit slice of one collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_range: Option<(String, String)>,
    pub node_id: String,
    pub status: ShardStatus,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    /// Base URL other nodes use to reach this node's HTTP API.
    pub url: String,
    pub region: String,
    pub capacity: u32,
    pub status: NodeHealth,
    pub last_heartbeat_at: u64,
    pub metrics: NodeMetrics,
    pub registered_at: u64,
    /// Registration order, used to break assignment ties deterministically.
    pub seq: u64,
}
