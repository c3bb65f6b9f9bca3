//! Transaction state and wire types.
//!
//! The status graph is a DAG: `PENDING → PREPARING → PREPARED → COMMITTING →
//! COMMITTED`, with `ABORTING → ABORTED` reachable from every non-terminal
//! state except `COMMITTING`. `COMMITTED` and `ABORTED` are terminal; there is
//! no path out of either. Durable records marshal every set as a sorted array
//! so the on-disk format stays stable.

use crate::document::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::Aborted)
    }

    /// Edge check for the status DAG.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Pending, Preparing)
                | (Preparing, Prepared)
                | (Prepared, Committing)
                | (Committing, Committed)
                | (Pending, Aborting)
                | (Preparing, Aborting)
                | (Prepared, Aborting)
                | (Aborting, Aborted)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Read,
    Write,
    Delete,
}

/// One operation inside a transaction. `WRITE` carries the full replacement
/// payload; the target is the `(collection, document_id)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub collection: String,
    #[serde(rename = "documentId")]
    pub document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Operation {
    pub fn doc_key(&self) -> String {
        format!("{}:{}", self.collection, self.document_id)
    }
}

/// Durable per-transaction record. This is both the coordinator's working
/// state and exactly what gets persisted under `tx:{tx_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnRecord {
    pub tx_id: String,
    pub status: TxStatus,
    pub operations: Vec<Operation>,
    /// Participant shard ids, sorted, one entry per shard.
    pub participants: Vec<String>,
    /// Shard id → indices into `operations` routed to that shard.
    pub shard_ops: BTreeMap<String, Vec<usize>>,
    /// Shard id → owning node at the time the transaction began.
    pub shard_nodes: BTreeMap<String, String>,
    pub prepared: BTreeSet<String>,
    pub committed: BTreeSet<String>,
    pub aborted: BTreeSet<String>,
    pub started_at: u64,
    pub expires_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepared_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TxnRecord {
    pub fn node_for_shard(&self, shard_id: &str) -> String {
        self.shard_nodes
            .get(shard_id)
            .cloned()
            .unwrap_or_else(|| shard_id.to_string())
    }

    pub fn ops_for_shard(&self, shard_id: &str) -> Vec<Operation> {
        self.shard_ops
            .get(shard_id)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&i| self.operations.get(i).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at
    }

    pub fn all_prepared(&self) -> bool {
        self.prepared.len() == self.participants.len()
    }

    pub fn all_committed(&self) -> bool {
        self.committed.len() == self.participants.len()
    }

    pub fn all_aborted(&self) -> bool {
        self.aborted.len() == self.participants.len()
    }
}
