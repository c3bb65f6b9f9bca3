//! Shard-manager HTTP contract.

use crate::routing::locality::NodeMetrics;
use serde::{Deserialize, Serialize};

use super::types::NodeHealth;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterNodeRequest {
    /// Caller-chosen id; peers registering themselves keep their identity
    /// stable across restarts this way.
    pub id: Option<String>,
    pub url: String,
    pub region: String,
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub status: Option<NodeHealth>,
    pub metrics: Option<NodeMetrics>,
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    #[serde(rename = "shardId")]
    pub shard_id: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
}
