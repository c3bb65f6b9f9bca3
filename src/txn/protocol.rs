//! Transaction HTTP contract.
//!
//! Request/response DTOs for the coordinator surface and the participant
//! callback endpoints.

use super::types::{Operation, TxStatus, TxnRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct BeginTransactionRequest {
    pub operations: Vec<Operation>,
    #[serde(default, rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

/// The client-facing view of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSummary {
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    pub status: TxStatus,
    pub participants: Vec<String>,
    #[serde(rename = "expiresAt")]
    pub expires_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TxnRecord> for TransactionSummary {
    fn from(record: &TxnRecord) -> Self {
        Self {
            transaction_id: record.tx_id.clone(),
            status: record.status,
            participants: record.participants.clone(),
            expires_at: record.expires_at,
            error: record.error.clone(),
        }
    }
}

/// Body of a participant callback (`/transactions/{id}/prepared` etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantNotification {
    #[serde(rename = "shardId")]
    pub shard_id: String,
}
