//! Per-shard document store.
//!
//! Owns CRUD with version metadata, the collection index, local query
//! evaluation, and the participant half of two-phase commit. All state lives
//! in the shard's key-value store: documents under `{collection}:{id}` and
//! the index under `__collections`. Index updates ride in the same batch as
//! the document write, so the two can never diverge.
//!
//! Mutations are serialized by a shard-wide writer lock (single-writer per
//! shard); reads go straight to the KV store.

use super::kv::{BatchOp, KvStore};
use crate::document::{
    check_payload_size, now_ms, strip_reserved, validate_collection, validate_doc_id, Document,
};
use crate::error::{DocError, Result};
use crate::query::filter::{compare_by_sort_keys, matches_all, Filter, QueryOptions};
use crate::txn::types::{OpType, Operation};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// KV key of the persisted collection index.
const COLLECTIONS_KEY: &str = "__collections";

type CollectionIndex = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone)]
pub struct QueryPage {
    pub results: Vec<Document>,
    /// Post-filter, pre-pagination match count.
    pub total: u64,
}

#[derive(Debug, Clone)]
struct StagedTxn {
    ops: Vec<Operation>,
    expires_at: u64,
    keys: Vec<String>,
}

pub struct ShardStore {
    shard_id: String,
    kv: Arc<dyn KvStore>,
    /// Document key → holding transaction id.
    locks: DashMap<String, String>,
    staged: DashMap<String, StagedTxn>,
    write_lock: Mutex<()>,
    max_doc_bytes: usize,
    max_query_results: usize,
    max_batch: usize,
}

impl ShardStore {
    pub fn new(
        shard_id: impl Into<String>,
        kv: Arc<dyn KvStore>,
        max_doc_bytes: usize,
        max_query_results: usize,
        max_batch: usize,
    ) -> Self {
        Self {
            shard_id: shard_id.into(),
            kv,
            locks: DashMap::new(),
            staged: DashMap::new(),
            write_lock: Mutex::new(()),
            max_doc_bytes,
            max_query_results,
            max_batch: max_batch.max(1),
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    fn doc_key(collection: &str, id: &str) -> String {
        format!("{collection}:{id}")
    }

    pub fn get(&self, collection: &str, id: &str) -> Result<Document> {
        validate_collection(collection)?;
        validate_doc_id(id)?;

        let raw = self
            .kv
            .get(&Self::doc_key(collection, id))
            .ok_or_else(|| DocError::DocumentNotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        parse_document(&raw)
    }

    /// Creates or replaces a document. Returns the stored document and
    /// whether it was created.
    pub fn put(
        &self,
        collection: &str,
        id: &str,
        mut payload: serde_json::Map<String, Value>,
    ) -> Result<(Document, bool)> {
        validate_collection(collection)?;
        validate_doc_id(id)?;
        strip_reserved(&mut payload);
        check_payload_size(&payload, self.max_doc_bytes)?;

        let key = Self::doc_key(collection, id);
        if let Some(holder) = self.locks.get(&key) {
            return Err(DocError::TransactionConflict(format!(
                "document {key} is locked by transaction {}",
                holder.value()
            )));
        }

        let _guard = self.write_lock.lock();
        let existing = self.kv.get(&key).map(|raw| parse_document(&raw)).transpose()?;
        let now = now_ms();

        let doc = match &existing {
            Some(previous) => Document {
                id: id.to_string(),
                collection: collection.to_string(),
                version: previous.version + 1,
                created_at: previous.created_at,
                // Never goes backwards, even under clock skew.
                updated_at: now.max(previous.updated_at),
                payload,
            },
            None => Document {
                id: id.to_string(),
                collection: collection.to_string(),
                version: 1,
                created_at: now,
                updated_at: now,
                payload,
            },
        };

        let mut batch = vec![BatchOp::Put {
            key,
            value: serde_json::to_string(&doc.to_value())?,
        }];
        if existing.is_none() {
            let mut index = self.load_index()?;
            index
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string());
            batch.push(self.index_batch_op(&index)?);
        }
        self.kv.write_batch(batch);

        Ok((doc, existing.is_none()))
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<()> {
        validate_collection(collection)?;
        validate_doc_id(id)?;

        let key = Self::doc_key(collection, id);
        if let Some(holder) = self.locks.get(&key) {
            return Err(DocError::TransactionConflict(format!(
                "document {key} is locked by transaction {}",
                holder.value()
            )));
        }

        let _guard = self.write_lock.lock();
        if self.kv.get(&key).is_none() {
            return Err(DocError::DocumentNotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        let mut index = self.load_index()?;
        if let Some(ids) = index.get_mut(collection) {
            ids.remove(id);
            if ids.is_empty() {
                index.remove(collection);
            }
        }

        self.kv.write_batch(vec![
            BatchOp::Delete { key },
            self.index_batch_op(&index)?,
        ]);
        Ok(())
    }

    /// Evaluates a query against this shard only: AND of `filters`, optional
    /// multi-key sort, then offset/limit. `total` counts all matches before
    /// pagination.
    pub fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        options: &QueryOptions,
    ) -> Result<QueryPage> {
        validate_collection(collection)?;

        let index = self.load_index()?;
        let ids: Vec<String> = index
            .get(collection)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut rows: Vec<(Document, Value)> = Vec::new();
        for chunk in ids.chunks(self.max_batch) {
            for id in chunk {
                let Some(raw) = self.kv.get(&Self::doc_key(collection, id)) else {
                    continue;
                };
                let doc = parse_document(&raw)?;
                let value = doc.to_value();
                if matches_all(filters, &value) {
                    rows.push((doc, value));
                }
            }
        }

        let total = rows.len() as u64;

        if !options.sort.is_empty() {
            rows.sort_by(|a, b| compare_by_sort_keys(&a.1, &b.1, &options.sort));
        }

        let offset = options.offset.unwrap_or(0);
        let limit = options
            .limit
            .map(|limit| limit.min(self.max_query_results));

        let iter = rows.into_iter().skip(offset);
        let results: Vec<Document> = match limit {
            Some(limit) => iter.take(limit).map(|(doc, _)| doc).collect(),
            None => iter.map(|(doc, _)| doc).collect(),
        };

        Ok(QueryPage { results, total })
    }

    /// Document ids currently indexed per collection.
    pub fn collections(&self) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self
            .load_index()?
            .into_iter()
            .map(|(name, ids)| (name, ids.into_iter().collect()))
            .collect())
    }

    // ------------------------------------------------------------
    // 2PC participant
    // ------------------------------------------------------------

    /// Validates and stages a transaction's operations, acquiring one lock
    /// per touched document. A conflicting live lock votes abort; locks held
    /// by expired transactions are stolen after aborting their holder.
    pub fn prepare(&self, tx_id: &str, ops: &[Operation], expires_at: u64) -> Result<()> {
        if self.staged.contains_key(tx_id) {
            return Ok(());
        }

        for op in ops {
            validate_collection(&op.collection)?;
            validate_doc_id(&op.document_id)?;
            if op.op_type == OpType::Write {
                let Some(data) = &op.data else {
                    return Err(DocError::InvalidDocument(format!(
                        "write to {} carries no payload",
                        op.doc_key()
                    )));
                };
                let mut payload = data.clone();
                strip_reserved(&mut payload);
                check_payload_size(&payload, self.max_doc_bytes)?;
            }
        }

        let keys: Vec<String> = ops
            .iter()
            .filter(|op| op.op_type != OpType::Read)
            .map(Operation::doc_key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut acquired: Vec<String> = Vec::new();
        for key in &keys {
            loop {
                let holder = self.locks.get(key).map(|entry| entry.value().clone());
                match holder {
                    Some(other) if other == tx_id => break,
                    Some(other) => {
                        let now = now_ms();
                        let holder_expired = self
                            .staged
                            .get(&other)
                            .map(|staged| now >= staged.expires_at)
                            .unwrap_or(true);
                        if holder_expired {
                            tracing::warn!(
                                "Shard {}: stealing expired lock on {} from transaction {}",
                                self.shard_id,
                                key,
                                other
                            );
                            self.abort(&other)?;
                            continue;
                        }
                        self.release_locks(tx_id, &acquired);
                        return Err(DocError::TransactionConflict(format!(
                            "document {key} is locked by transaction {other}"
                        )));
                    }
                    None => {
                        use dashmap::mapref::entry::Entry;
                        match self.locks.entry(key.clone()) {
                            Entry::Vacant(slot) => {
                                slot.insert(tx_id.to_string());
                                acquired.push(key.clone());
                                break;
                            }
                            // Raced with another prepare; re-check the holder.
                            Entry::Occupied(_) => continue,
                        }
                    }
                }
            }
        }

        self.staged.insert(
            tx_id.to_string(),
            StagedTxn {
                ops: ops.to_vec(),
                expires_at,
                keys,
            },
        );
        tracing::debug!(
            "Shard {}: prepared transaction {} ({} ops)",
            self.shard_id,
            tx_id,
            ops.len()
        );
        Ok(())
    }

    /// Applies the staged operations in one batch and releases the locks.
    /// Committing an unknown transaction succeeds, which makes coordinator
    /// replays harmless.
    pub fn commit(&self, tx_id: &str) -> Result<()> {
        let Some((_, staged)) = self.staged.remove(tx_id) else {
            return Ok(());
        };

        let _guard = self.write_lock.lock();
        let mut index = self.load_index()?;
        // Working overlay so a transaction writing the same document twice
        // observes its own earlier write.
        let mut working: BTreeMap<String, Option<Document>> = BTreeMap::new();
        let now = now_ms();

        for op in &staged.ops {
            let key = op.doc_key();
            match op.op_type {
                OpType::Read => {}
                OpType::Write => {
                    let mut payload = op.data.clone().unwrap_or_default();
                    strip_reserved(&mut payload);
                    let previous = match working.get(&key) {
                        Some(state) => state.clone(),
                        None => self.kv.get(&key).map(|raw| parse_document(&raw)).transpose()?,
                    };
                    let doc = match previous {
                        Some(prev) => Document {
                            id: op.document_id.clone(),
                            collection: op.collection.clone(),
                            version: prev.version + 1,
                            created_at: prev.created_at,
                            updated_at: now.max(prev.updated_at),
                            payload,
                        },
                        None => Document {
                            id: op.document_id.clone(),
                            collection: op.collection.clone(),
                            version: 1,
                            created_at: now,
                            updated_at: now,
                            payload,
                        },
                    };
                    index
                        .entry(op.collection.clone())
                        .or_default()
                        .insert(op.document_id.clone());
                    working.insert(key, Some(doc));
                }
                OpType::Delete => {
                    if let Some(ids) = index.get_mut(&op.collection) {
                        ids.remove(&op.document_id);
                        if ids.is_empty() {
                            index.remove(&op.collection);
                        }
                    }
                    working.insert(key, None);
                }
            }
        }

        let mut batch: Vec<BatchOp> = Vec::new();
        for (key, state) in working {
            match state {
                Some(doc) => batch.push(BatchOp::Put {
                    key,
                    value: serde_json::to_string(&doc.to_value())?,
                }),
                None => batch.push(BatchOp::Delete { key }),
            }
        }
        batch.push(self.index_batch_op(&index)?);
        self.kv.write_batch(batch);

        self.release_locks(tx_id, &staged.keys);
        tracing::info!("Shard {}: committed transaction {}", self.shard_id, tx_id);
        Ok(())
    }

    /// Discards staged operations and releases locks. Unknown transactions
    /// succeed for the same replay-tolerance reason as `commit`.
    pub fn abort(&self, tx_id: &str) -> Result<()> {
        if let Some((_, staged)) = self.staged.remove(tx_id) {
            self.release_locks(tx_id, &staged.keys);
            tracing::debug!("Shard {}: aborted transaction {}", self.shard_id, tx_id);
        }
        Ok(())
    }

    /// Aborts every staged transaction whose `expires_at` has passed.
    /// Returns how many were swept.
    pub fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let expired: Vec<String> = self
            .staged
            .iter()
            .filter(|entry| now >= entry.value().expires_at)
            .map(|entry| entry.key().clone())
            .collect();

        for tx_id in &expired {
            tracing::warn!(
                "Shard {}: transaction {} expired before commit, auto-aborting",
                self.shard_id,
                tx_id
            );
            let _ = self.abort(tx_id);
        }
        expired.len()
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn release_locks(&self, tx_id: &str, keys: &[String]) {
        for key in keys {
            self.locks.remove_if(key, |_, holder| holder == tx_id);
        }
    }

    fn load_index(&self) -> Result<CollectionIndex> {
        match self.kv.get(COLLECTIONS_KEY) {
            Some(raw) => {
                let index: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw)?;
                Ok(index
                    .into_iter()
                    .map(|(name, ids)| (name, ids.into_iter().collect()))
                    .collect())
            }
            None => Ok(BTreeMap::new()),
        }
    }

    fn index_batch_op(&self, index: &CollectionIndex) -> Result<BatchOp> {
        let serializable: BTreeMap<&String, Vec<&String>> = index
            .iter()
            .map(|(name, ids)| (name, ids.iter().collect()))
            .collect();
        Ok(BatchOp::Put {
            key: COLLECTIONS_KEY.to_string(),
            value: serde_json::to_string(&serializable)?,
        })
    }
}

fn parse_document(raw: &str) -> Result<Document> {
    let value: Value = serde_json::from_str(raw)?;
    Document::from_value(value)
}
