//! Two-phase-commit coordinator.
//!
//! Drives a set of participant shards through prepare → commit/abort. Every
//! state transition is persisted to the transaction log *before* the next
//! round of participant I/O, so a crashed coordinator can reload its
//! in-flight transactions and finish them: PREPARING re-prepares, PREPARED
//! and COMMITTING re-commit, ABORTING re-aborts.
//!
//! Prepare-phase failures abort (safe). Commit-phase failures retry forever;
//! after a unanimous prepare there is no rolling back. Abort dispatch
//! failures are recorded and retried in the background without blocking.

use super::types::{OpType, Operation, TxStatus, TxnRecord};
use crate::document::{now_ms, validate_collection, validate_doc_id};
use crate::error::{DocError, Result};
use crate::routing::router::Router;
use crate::shard::kv::KvStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const TX_KEY_PREFIX: &str = "tx:";
/// Pause between re-drive attempts for stuck COMMITTING/ABORTING transactions.
const REDRIVE_DELAY_MS: u64 = 1000;

/// Transport to the participant side of a shard. Production speaks HTTP to
/// the owning node; tests plug in in-process fakes.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    async fn prepare(
        &self,
        node_id: &str,
        shard_id: &str,
        tx_id: &str,
        ops: &[Operation],
        expires_at: u64,
    ) -> Result<()>;
    async fn commit(&self, node_id: &str, shard_id: &str, tx_id: &str) -> Result<()>;
    async fn abort(&self, node_id: &str, shard_id: &str, tx_id: &str) -> Result<()>;
}

pub struct TxnCoordinator {
    txns: DashMap<String, TxnRecord>,
    log: Arc<dyn KvStore>,
    client: Arc<dyn ParticipantClient>,
    router: Arc<Router>,
    default_timeout_ms: u64,
}

impl TxnCoordinator {
    pub fn new(
        log: Arc<dyn KvStore>,
        client: Arc<dyn ParticipantClient>,
        router: Arc<Router>,
        default_timeout_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            txns: DashMap::new(),
            log,
            client,
            router,
            default_timeout_ms,
        })
    }

    /// Starts a transaction: validates the operations, derives the
    /// participant shards through the router, persists the PENDING record and
    /// arms its expiry timer.
    pub fn begin(
        self: &Arc<Self>,
        operations: Vec<Operation>,
        timeout_ms: Option<u64>,
    ) -> Result<TxnRecord> {
        if operations.is_empty() {
            return Err(DocError::InvalidRequest(
                "transaction has no operations".into(),
            ));
        }
        for op in &operations {
            validate_collection(&op.collection)?;
            validate_doc_id(&op.document_id)?;
            if op.op_type == OpType::Write && op.data.is_none() {
                return Err(DocError::InvalidDocument(format!(
                    "write to {} carries no payload",
                    op.doc_key()
                )));
            }
        }

        let mut shard_ops: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut shard_nodes: BTreeMap<String, String> = BTreeMap::new();
        for (i, op) in operations.iter().enumerate() {
            let decision = self.router.route(&op.collection, &op.document_id, None)?;
            shard_ops
                .entry(decision.shard_id.clone())
                .or_default()
                .push(i);
            shard_nodes.insert(decision.shard_id, decision.node_id);
        }
        let participants: Vec<String> = shard_ops.keys().cloned().collect();

        let tx_id = format!("tx-{}", Uuid::new_v4());
        let started_at = now_ms();
        let timeout = timeout_ms.unwrap_or(self.default_timeout_ms);
        let record = TxnRecord {
            tx_id: tx_id.clone(),
            status: TxStatus::Pending,
            operations,
            participants,
            shard_ops,
            shard_nodes,
            prepared: BTreeSet::new(),
            committed: BTreeSet::new(),
            aborted: BTreeSet::new(),
            started_at,
            expires_at: started_at + timeout,
            prepared_at: None,
            committed_at: None,
            aborted_at: None,
            error: None,
        };

        self.persist(&record)?;
        self.txns.insert(tx_id.clone(), record.clone());
        self.arm_timer(&tx_id, record.expires_at);
        tracing::info!(
            "Transaction {} started with {} participant(s)",
            tx_id,
            record.participants.len()
        );
        Ok(record)
    }

    pub fn get(&self, tx_id: &str) -> Result<TxnRecord> {
        self.txns
            .get(tx_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| DocError::TransactionNotFound(tx_id.to_string()))
    }

    /// Phase one: dispatch prepare to every participant. Any failure or abort
    /// vote flips the transaction to ABORTING and drives the abort.
    pub async fn prepare(self: &Arc<Self>, tx_id: &str) -> Result<TxnRecord> {
        {
            let record = self.get(tx_id)?;
            if record.status == TxStatus::Pending && record.is_expired() {
                self.set_error(tx_id, "transaction timed out".to_string())?;
                self.transition(tx_id, TxStatus::Aborting)?;
                self.drive_abort(tx_id).await?;
                return Err(DocError::TransactionTimeout(tx_id.to_string()));
            }
        }
        self.transition(tx_id, TxStatus::Preparing)?;
        self.drive_prepare(tx_id).await
    }

    async fn drive_prepare(self: &Arc<Self>, tx_id: &str) -> Result<TxnRecord> {
        let record = self.get(tx_id)?;
        if record.status != TxStatus::Preparing {
            return Ok(record);
        }

        for shard_id in &record.participants {
            if record.prepared.contains(shard_id) {
                continue;
            }
            let ops = record.ops_for_shard(shard_id);
            let node_id = record.node_for_shard(shard_id);
            match self
                .client
                .prepare(&node_id, shard_id, tx_id, &ops, record.expires_at)
                .await
            {
                Ok(()) => {
                    self.note_prepared(tx_id, shard_id)?;
                }
                Err(e) => {
                    tracing::warn!(
                        "Transaction {}: participant {} voted abort: {}",
                        tx_id,
                        shard_id,
                        e
                    );
                    self.set_error(tx_id, format!("prepare failed on {shard_id}: {e}"))?;
                    self.transition(tx_id, TxStatus::Aborting)?;
                    return self.drive_abort(tx_id).await;
                }
            }
        }

        self.get(tx_id)
    }

    /// Phase two: only valid from PREPARED. Failures leave the transaction in
    /// COMMITTING and re-drive until every participant acknowledges.
    pub async fn commit(self: &Arc<Self>, tx_id: &str) -> Result<TxnRecord> {
        {
            let record = self.get(tx_id)?;
            match record.status {
                TxStatus::Prepared => {
                    self.transition(tx_id, TxStatus::Committing)?;
                }
                TxStatus::Committing | TxStatus::Committed => {}
                other => {
                    return Err(DocError::TransactionConflict(format!(
                        "cannot commit transaction {tx_id} in state {other:?}"
                    )));
                }
            }
        }
        self.drive_commit(tx_id).await
    }

    async fn drive_commit(self: &Arc<Self>, tx_id: &str) -> Result<TxnRecord> {
        let record = self.get(tx_id)?;
        if record.status != TxStatus::Committing {
            return Ok(record);
        }

        for shard_id in &record.participants {
            if record.committed.contains(shard_id) {
                continue;
            }
            let node_id = record.node_for_shard(shard_id);
            match self.client.commit(&node_id, shard_id, tx_id).await {
                Ok(()) => {
                    self.note_committed(tx_id, shard_id)?;
                }
                Err(e) => {
                    // Cannot abort after a unanimous prepare; keep retrying.
                    tracing::warn!(
                        "Transaction {}: commit dispatch to {} failed, will retry: {}",
                        tx_id,
                        shard_id,
                        e
                    );
                }
            }
        }

        let record = self.get(tx_id)?;
        if record.status == TxStatus::Committing {
            self.schedule_redrive(tx_id);
        }
        Ok(record)
    }

    /// Aborts a transaction. Valid from any non-terminal state except
    /// COMMITTING.
    pub async fn abort(self: &Arc<Self>, tx_id: &str) -> Result<TxnRecord> {
        {
            let record = self.get(tx_id)?;
            match record.status {
                TxStatus::Pending | TxStatus::Preparing | TxStatus::Prepared => {
                    self.transition(tx_id, TxStatus::Aborting)?;
                }
                TxStatus::Aborting => {}
                other => {
                    return Err(DocError::TransactionConflict(format!(
                        "cannot abort transaction {tx_id} in state {other:?}"
                    )));
                }
            }
        }
        self.drive_abort(tx_id).await
    }

    async fn drive_abort(self: &Arc<Self>, tx_id: &str) -> Result<TxnRecord> {
        let record = self.get(tx_id)?;
        if record.status != TxStatus::Aborting {
            return Ok(record);
        }

        for shard_id in &record.participants {
            if record.aborted.contains(shard_id) {
                continue;
            }
            let node_id = record.node_for_shard(shard_id);
            match self.client.abort(&node_id, shard_id, tx_id).await {
                Ok(()) => {
                    self.note_aborted(tx_id, shard_id)?;
                }
                Err(e) => {
                    // Unreachable participants must not block the abort;
                    // their locks expire on their own.
                    tracing::warn!(
                        "Transaction {}: abort dispatch to {} failed, will retry: {}",
                        tx_id,
                        shard_id,
                        e
                    );
                }
            }
        }

        let record = self.get(tx_id)?;
        if record.status == TxStatus::Aborting {
            self.schedule_redrive(tx_id);
        }
        Ok(record)
    }

    // ------------------------------------------------------------
    // Participant notifications. These are the single convergence point for
    // both synchronous dispatch results and the async HTTP callbacks, and
    // they are idempotent: duplicates and out-of-phase arrivals are ignored.
    // ------------------------------------------------------------

    pub fn note_prepared(self: &Arc<Self>, tx_id: &str, shard_id: &str) -> Result<TxnRecord> {
        let complete = {
            let mut entry = self
                .txns
                .get_mut(tx_id)
                .ok_or_else(|| DocError::TransactionNotFound(tx_id.to_string()))?;
            if entry.status != TxStatus::Preparing {
                return Ok(entry.clone());
            }
            if !entry.participants.iter().any(|p| p == shard_id) {
                tracing::warn!(
                    "Transaction {}: prepared ack from non-participant {}",
                    tx_id,
                    shard_id
                );
                return Ok(entry.clone());
            }
            entry.prepared.insert(shard_id.to_string());
            entry.all_prepared()
        };

        if complete {
            self.transition(tx_id, TxStatus::Prepared)
        } else {
            let record = self.get(tx_id)?;
            self.persist(&record)?;
            Ok(record)
        }
    }

    pub fn note_committed(self: &Arc<Self>, tx_id: &str, shard_id: &str) -> Result<TxnRecord> {
        let complete = {
            let mut entry = self
                .txns
                .get_mut(tx_id)
                .ok_or_else(|| DocError::TransactionNotFound(tx_id.to_string()))?;
            if entry.status != TxStatus::Committing {
                return Ok(entry.clone());
            }
            if !entry.participants.iter().any(|p| p == shard_id) {
                return Ok(entry.clone());
            }
            entry.committed.insert(shard_id.to_string());
            entry.all_committed()
        };

        if complete {
            let record = self.transition(tx_id, TxStatus::Committed)?;
            tracing::info!("Transaction {} committed", tx_id);
            Ok(record)
        } else {
            let record = self.get(tx_id)?;
            self.persist(&record)?;
            Ok(record)
        }
    }

    pub fn note_aborted(self: &Arc<Self>, tx_id: &str, shard_id: &str) -> Result<TxnRecord> {
        let complete = {
            let mut entry = self
                .txns
                .get_mut(tx_id)
                .ok_or_else(|| DocError::TransactionNotFound(tx_id.to_string()))?;
            if entry.status != TxStatus::Aborting {
                return Ok(entry.clone());
            }
            if !entry.participants.iter().any(|p| p == shard_id) {
                return Ok(entry.clone());
            }
            entry.aborted.insert(shard_id.to_string());
            entry.all_aborted()
        };

        if complete {
            let record = self.transition(tx_id, TxStatus::Aborted)?;
            tracing::info!("Transaction {} aborted", tx_id);
            Ok(record)
        } else {
            let record = self.get(tx_id)?;
            self.persist(&record)?;
            Ok(record)
        }
    }

    // ------------------------------------------------------------
    // Recovery and timers
    // ------------------------------------------------------------

    /// Reloads the transaction log after a restart, re-arms timers and
    /// re-drives everything non-terminal. Returns how many transactions were
    /// resumed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let mut resumed = 0;
        for (key, raw) in self.log.list_prefix(TX_KEY_PREFIX) {
            let record: TxnRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!("Skipping unreadable transaction record {}: {}", key, e);
                    continue;
                }
            };
            let tx_id = record.tx_id.clone();
            let status = record.status;
            let expires_at = record.expires_at;
            self.txns.insert(tx_id.clone(), record);

            if status.is_terminal() {
                continue;
            }
            resumed += 1;
            self.arm_timer(&tx_id, expires_at);

            let coordinator = self.clone();
            tokio::spawn(async move {
                let outcome = match status {
                    TxStatus::Pending => Ok(()),
                    TxStatus::Preparing => coordinator.drive_prepare(&tx_id).await.map(|_| ()),
                    TxStatus::Prepared => {
                        if now_ms() >= expires_at {
                            coordinator.abort(&tx_id).await.map(|_| ())
                        } else {
                            coordinator.commit(&tx_id).await.map(|_| ())
                        }
                    }
                    TxStatus::Committing => coordinator.drive_commit(&tx_id).await.map(|_| ()),
                    TxStatus::Aborting => coordinator.drive_abort(&tx_id).await.map(|_| ()),
                    TxStatus::Committed | TxStatus::Aborted => Ok(()),
                };
                if let Err(e) = outcome {
                    tracing::error!("Recovery re-drive of {} failed: {}", tx_id, e);
                }
            });
        }
        if resumed > 0 {
            tracing::info!("Recovered {} in-flight transaction(s)", resumed);
        }
        Ok(resumed)
    }

    /// Re-drives every stuck COMMITTING/ABORTING transaction once; called
    /// from the periodic retry loop.
    pub async fn drive_stuck(self: &Arc<Self>) {
        let stuck: Vec<(String, TxStatus)> = self
            .txns
            .iter()
            .filter(|entry| {
                matches!(entry.status, TxStatus::Committing | TxStatus::Aborting)
            })
            .map(|entry| (entry.tx_id.clone(), entry.status))
            .collect();

        for (tx_id, status) in stuck {
            let result = match status {
                TxStatus::Committing => self.drive_commit(&tx_id).await,
                _ => self.drive_abort(&tx_id).await,
            };
            if let Err(e) = result {
                tracing::warn!("Re-drive of {} failed: {}", tx_id, e);
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, tx_id: &str, expires_at: u64) {
        let coordinator = self.clone();
        let tx_id = tx_id.to_string();
        tokio::spawn(async move {
            let now = now_ms();
            if expires_at > now {
                tokio::time::sleep(Duration::from_millis(expires_at - now)).await;
            }
            coordinator.handle_timeout(&tx_id).await;
        });
    }

    async fn handle_timeout(self: &Arc<Self>, tx_id: &str) {
        let Ok(record) = self.get(tx_id) else {
            return;
        };
        if !matches!(
            record.status,
            TxStatus::Pending | TxStatus::Preparing | TxStatus::Prepared
        ) {
            return;
        }

        tracing::warn!(
            "Transaction {} expired in state {:?}, aborting",
            tx_id,
            record.status
        );
        if let Err(e) = self.set_error(tx_id, "transaction timed out".to_string()) {
            tracing::error!("Failed to record timeout on {}: {}", tx_id, e);
        }
        if let Err(e) = self.abort(tx_id).await {
            tracing::error!("Timeout abort of {} failed: {}", tx_id, e);
        }
    }

    fn schedule_redrive(self: &Arc<Self>, tx_id: &str) {
        let coordinator = self.clone();
        let tx_id = tx_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(REDRIVE_DELAY_MS)).await;
            let status = coordinator.get(&tx_id).map(|record| record.status);
            let result = match status {
                Ok(TxStatus::Committing) => coordinator.drive_commit(&tx_id).await.map(|_| ()),
                Ok(TxStatus::Aborting) => coordinator.drive_abort(&tx_id).await.map(|_| ()),
                _ => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!("Scheduled re-drive of {} failed: {}", tx_id, e);
            }
        });
    }

    // ------------------------------------------------------------
    // State plumbing
    // ------------------------------------------------------------

    fn transition(&self, tx_id: &str, next: TxStatus) -> Result<TxnRecord> {
        let snapshot = {
            let mut entry = self
                .txns
                .get_mut(tx_id)
                .ok_or_else(|| DocError::TransactionNotFound(tx_id.to_string()))?;
            if !entry.status.can_transition_to(next) {
                return Err(DocError::TransactionConflict(format!(
                    "transaction {tx_id} cannot move from {:?} to {next:?}",
                    entry.status
                )));
            }
            entry.status = next;
            let now = now_ms();
            match next {
                TxStatus::Prepared => entry.prepared_at = Some(now),
                TxStatus::Committed => entry.committed_at = Some(now),
                TxStatus::Aborted => entry.aborted_at = Some(now),
                _ => {}
            }
            entry.clone()
        };
        self.persist(&snapshot)?;
        tracing::debug!("Transaction {} -> {:?}", tx_id, next);
        Ok(snapshot)
    }

    fn set_error(&self, tx_id: &str, message: String) -> Result<()> {
        let snapshot = {
            let mut entry = self
                .txns
                .get_mut(tx_id)
                .ok_or_else(|| DocError::TransactionNotFound(tx_id.to_string()))?;
            entry.error = Some(message);
            entry.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, record: &TxnRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.log.put(&format!("{TX_KEY_PREFIX}{}", record.tx_id), raw);
        Ok(())
    }
}
