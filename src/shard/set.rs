//! The set of shards hosted by this node.
//!
//! Shards are created lazily the first time traffic routes to them; each gets
//! its own key-value namespace.

use super::kv::MemoryKv;
use super::store::ShardStore;
use crate::config::Config;
use dashmap::DashMap;
use std::sync::Arc;

pub struct ShardSet {
    shards: DashMap<String, Arc<ShardStore>>,
    config: Arc<Config>,
}

impl ShardSet {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            shards: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, shard_id: &str) -> Arc<ShardStore> {
        self.shards
            .entry(shard_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("Opening local shard {}", shard_id);
                Arc::new(ShardStore::new(
                    shard_id,
                    Arc::new(MemoryKv::new()),
                    self.config.max_doc_bytes,
                    self.config.max_query_results,
                    self.config.max_batch,
                ))
            })
            .clone()
    }

    pub fn get(&self, shard_id: &str) -> Option<Arc<ShardStore>> {
        self.shards.get(shard_id).map(|entry| entry.clone())
    }

    pub fn shard_ids(&self) -> Vec<String> {
        self.shards.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Runs the lock-expiry sweep across every hosted shard.
    pub fn sweep_expired(&self) -> usize {
        self.shards
            .iter()
            .map(|entry| entry.value().sweep_expired())
            .sum()
    }
}
