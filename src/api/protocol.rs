//! Internal node-to-node API.
//!
//! Endpoints and DTOs for forwarded single-document operations, remote shard
//! query execution, participant phase calls, and routing-table propagation.
//! These are serialized as JSON over HTTP between nodes; the shapes here are
//! the wire contract.

use crate::query::executor::QueryOutcome;
use crate::query::aggregate::AggregationResult;
use crate::query::planner::ShardTarget;
use crate::txn::types::Operation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// --- Internal endpoints ---

/// Forwarded single-document read against a specific local shard.
pub const ENDPOINT_INTERNAL_GET: &str = "/internal/data/get";
/// Forwarded write; idempotent per `op_id`.
pub const ENDPOINT_INTERNAL_PUT: &str = "/internal/data/put";
/// Forwarded delete; idempotent per `op_id`.
pub const ENDPOINT_INTERNAL_DELETE: &str = "/internal/data/delete";
/// One shard target's slice of a scatter-gather query.
pub const ENDPOINT_INTERNAL_QUERY: &str = "/internal/query";
/// Participant phase calls from a remote coordinator.
pub const ENDPOINT_INTERNAL_TXN_PREPARE: &str = "/internal/txn/prepare";
pub const ENDPOINT_INTERNAL_TXN_COMMIT: &str = "/internal/txn/commit";
pub const ENDPOINT_INTERNAL_TXN_ABORT: &str = "/internal/txn/abort";
/// Routing-table propagation between nodes.
pub const ENDPOINT_INTERNAL_ROUTING_TABLE: &str = "/internal/routing/table";

// --- Data-plane DTOs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalGetRequest {
    pub shard_id: String,
    pub collection: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalPutRequest {
    pub shard_id: String,
    pub collection: String,
    pub id: String,
    /// Operation id for cross-hop deduplication.
    pub op_id: String,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalPutResponse {
    pub document: Value,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalDeleteRequest {
    pub shard_id: String,
    pub collection: String,
    pub id: String,
    pub op_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalQueryRequest {
    pub collection: String,
    pub target: ShardTarget,
}

// --- Transaction participant DTOs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnPrepareRequest {
    pub tx_id: String,
    pub shard_id: String,
    pub ops: Vec<Operation>,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnPhaseRequest {
    pub tx_id: String,
    pub shard_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableAdoption {
    pub adopted: bool,
    pub version: u64,
}

// --- Public query response ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<Value>,
    pub metadata: QueryMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Vec<AggregationResult>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_shards: Vec<String>,
}

impl QueryResponse {
    pub fn from_outcome(outcome: QueryOutcome, aggregations: Option<Vec<AggregationResult>>) -> Self {
        Self {
            results: outcome.results,
            metadata: QueryMetadata {
                total: outcome.total,
                limit: outcome.limit,
                offset: outcome.offset,
                failed_shards: outcome.failed_shards,
            },
            aggregations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
    pub id: String,
    pub collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub features: Vec<String>,
}
