//! Shard manager.
//!
//! Tracks node membership through heartbeats, assigns shards to nodes, and
//! publishes a fresh routing table to the router whenever placement changes.
//! Nodes that miss the heartbeat window go offline, their shards get new
//! owners, and the rebalancer keeps the per-node shard count near the ideal.

use super::types::{NodeHealth, NodeRecord, ShardRecord, ShardStatus};
use crate::document::now_ms;
use crate::error::{DocError, Result};
use crate::routing::locality::NodeMetrics;
use crate::routing::router::{RouteDecision, Router};
use crate::routing::table::{NodeInfo, NodeStatus, RoutingTable, ShardRange};
use crate::shard::kv::KvStore;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const NODE_KEY_PREFIX: &str = "node:";
const SHARD_KEY_PREFIX: &str = "shard:";
/// A node missing heartbeats for this long is declared offline.
pub const HEARTBEAT_TTL_MS: u64 = 15_000;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CreateShardRequest {
    pub primary_node_id: Option<String>,
    pub collection: Option<String>,
    pub key_range: Option<(String, String)>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UpdateShardRequest {
    pub node_id: Option<String>,
    pub status: Option<ShardStatus>,
}

pub struct ShardManager {
    nodes: DashMap<String, NodeRecord>,
    shards: DashMap<String, ShardRecord>,
    kv: Arc<dyn KvStore>,
    router: Arc<Router>,
    next_seq: AtomicU64,
    table_version: AtomicU64,
}

impl ShardManager {
    pub fn new(kv: Arc<dyn KvStore>, router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            shards: DashMap::new(),
            kv,
            router,
            next_seq: AtomicU64::new(1),
            table_version: AtomicU64::new(0),
        })
    }

    /// Reloads persisted node and shard records, e.g. after a restart.
    pub fn recover(&self) -> Result<usize> {
        let mut loaded = 0;
        for (key, raw) in self.kv.list_prefix(NODE_KEY_PREFIX) {
            match serde_json::from_str::<NodeRecord>(&raw) {
                Ok(record) => {
                    self.next_seq
                        .fetch_max(record.seq + 1, Ordering::SeqCst);
                    self.nodes.insert(record.id.clone(), record);
                    loaded += 1;
                }
                Err(e) => tracing::error!("Skipping unreadable node record {}: {}", key, e),
            }
        }
        for (key, raw) in self.kv.list_prefix(SHARD_KEY_PREFIX) {
            match serde_json::from_str::<ShardRecord>(&raw) {
                Ok(record) => {
                    self.shards.insert(record.id.clone(), record);
                    loaded += 1;
                }
                Err(e) => tracing::error!("Skipping unreadable shard record {}: {}", key, e),
            }
        }
        if loaded > 0 {
            self.publish_table();
        }
        Ok(loaded)
    }

    // ------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------

    pub fn register_node(&self, url: &str, region: &str, capacity: u32) -> Result<NodeRecord> {
        let id = format!("node-{}", short_id());
        self.register_node_with_id(&id, url, region, capacity)
    }

    /// Registration with a caller-chosen id; used by a node registering
    /// itself at startup so its identity is stable across restarts.
    pub fn register_node_with_id(
        &self,
        id: &str,
        url: &str,
        region: &str,
        capacity: u32,
    ) -> Result<NodeRecord> {
        let now = now_ms();
        let record = NodeRecord {
            id: id.to_string(),
            url: url.trim_end_matches('/').to_string(),
            region: region.to_string(),
            capacity,
            status: NodeHealth::Online,
            last_heartbeat_at: now,
            metrics: NodeMetrics::default(),
            registered_at: now,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        self.persist_node(&record)?;
        self.nodes.insert(record.id.clone(), record.clone());

        self.router.add_node(&record.id);
        self.router.scorer().register_node(&record.id, region);

        tracing::info!("Registered node {} ({}) in {}", record.id, url, region);
        self.rebalance();
        self.publish_table();
        Ok(record)
    }

    pub fn heartbeat(
        &self,
        node_id: &str,
        status: Option<NodeHealth>,
        metrics: Option<NodeMetrics>,
        capacity: Option<u32>,
    ) -> Result<NodeRecord> {
        let record = {
            let mut entry = self
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| DocError::NodeNotFound(node_id.to_string()))?;
            entry.last_heartbeat_at = now_ms();
            entry.status = status.unwrap_or(NodeHealth::Online);
            if let Some(capacity) = capacity {
                entry.capacity = capacity;
            }
            if let Some(metrics) = &metrics {
                entry.metrics = metrics.clone();
            }
            entry.clone()
        };
        self.persist_node(&record)?;

        if let Some(metrics) = metrics {
            self.router.scorer().update_metrics(node_id, metrics);
        }
        Ok(record)
    }

    pub fn get_node(&self, node_id: &str) -> Result<NodeRecord> {
        self.nodes
            .get(node_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| DocError::NodeNotFound(node_id.to_string()))
    }

    pub fn list_nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.nodes.iter().map(|entry| entry.clone()).collect();
        nodes.sort_by_key(|node| node.seq);
        nodes
    }

    pub fn node_url(&self, node_id: &str) -> Result<String> {
        Ok(self.get_node(node_id)?.url)
    }

    /// Marks nodes that missed the heartbeat window offline and reassigns
    /// their shards. Returns the ids of newly offline nodes.
    pub fn check_heartbeats(&self) -> Vec<String> {
        let now = now_ms();
        let mut expired = Vec::new();
        for mut entry in self.nodes.iter_mut() {
            if entry.status == NodeHealth::Online
                && now.saturating_sub(entry.last_heartbeat_at) > HEARTBEAT_TTL_MS
            {
                tracing::warn!(
                    "Node {} missed heartbeats for {} ms, marking offline",
                    entry.id,
                    now.saturating_sub(entry.last_heartbeat_at)
                );
                entry.status = NodeHealth::Offline;
                expired.push(entry.id.clone());
            }
        }

        for node_id in &expired {
            if let Ok(record) = self.get_node(node_id) {
                let _ = self.persist_node(&record);
            }
            self.router.remove_node(node_id);
        }
        if !expired.is_empty() {
            self.rebalance();
            self.publish_table();
        }
        expired
    }

    // ------------------------------------------------------------
    // Shards
    // ------------------------------------------------------------

    pub fn create_shard(&self, request: &CreateShardRequest) -> Result<ShardRecord> {
        let node_id = match &request.primary_node_id {
            Some(node_id) => {
                let node = self.get_node(node_id)?;
                if node.status != NodeHealth::Online {
                    return Err(DocError::InvalidRequest(format!(
                        "node {node_id} is offline"
                    )));
                }
                node.id
            }
            None => self.least_loaded_node()?,
        };

        let record = ShardRecord {
            id: format!("shard-{}", short_id()),
            collection: request.collection.clone(),
            key_range: request.key_range.clone(),
            node_id,
            status: ShardStatus::Active,
            created_at: now_ms(),
        };
        self.persist_shard(&record)?;
        self.shards.insert(record.id.clone(), record.clone());

        tracing::info!("Created shard {} on node {}", record.id, record.node_id);
        self.publish_table();
        Ok(record)
    }

    pub fn update_shard(&self, shard_id: &str, request: &UpdateShardRequest) -> Result<ShardRecord> {
        let record = {
            let mut entry = self
                .shards
                .get_mut(shard_id)
                .ok_or_else(|| DocError::ShardNotFound(shard_id.to_string()))?;
            if let Some(node_id) = &request.node_id {
                entry.node_id = node_id.clone();
            }
            if let Some(status) = request.status {
                entry.status = status;
            }
            entry.clone()
        };
        self.persist_shard(&record)?;
        self.publish_table();
        Ok(record)
    }

    pub fn get_shard(&self, shard_id: &str) -> Result<ShardRecord> {
        self.shards
            .get(shard_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| DocError::ShardNotFound(shard_id.to_string()))
    }

    pub fn list_shards(&self) -> Vec<ShardRecord> {
        let mut shards: Vec<ShardRecord> = self.shards.iter().map(|entry| entry.clone()).collect();
        shards.sort_by(|a, b| a.id.cmp(&b.id));
        shards
    }

    pub fn lookup_shard(&self, collection: &str, document_id: &str) -> Result<RouteDecision> {
        self.router.route(collection, document_id, None)
    }

    /// Picks the online node hosting the fewest shards; registration order
    /// breaks ties.
    fn least_loaded_node(&self) -> Result<String> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for shard in self.shards.iter() {
            *counts.entry(shard.node_id.clone()).or_insert(0) += 1;
        }

        self.list_nodes()
            .into_iter()
            .filter(|node| node.status == NodeHealth::Online)
            .min_by_key(|node| (counts.get(&node.id).copied().unwrap_or(0), node.seq))
            .map(|node| node.id)
            .ok_or(DocError::NoShardsAvailable)
    }

    // ------------------------------------------------------------
    // Rebalancing + table publication
    // ------------------------------------------------------------

    /// Moves shards from overloaded (or offline) nodes toward underloaded
    /// ones, flipping each through `MIGRATING`. Returns the migration count.
    pub fn rebalance(&self) -> usize {
        let online: Vec<String> = self
            .list_nodes()
            .into_iter()
            .filter(|node| node.status == NodeHealth::Online)
            .map(|node| node.id)
            .collect();
        if online.is_empty() {
            return 0;
        }

        let shards = self.list_shards();
        if shards.is_empty() {
            return 0;
        }
        let ideal = shards.len().div_ceil(online.len());

        let mut counts: HashMap<String, usize> = online.iter().map(|id| (id.clone(), 0)).collect();
        let mut to_move: Vec<String> = Vec::new();
        for shard in &shards {
            match counts.get_mut(&shard.node_id) {
                // Shards above the ideal count on their current owner move.
                Some(count) if *count >= ideal => to_move.push(shard.id.clone()),
                Some(count) => *count += 1,
                // Owner is offline or gone.
                None => to_move.push(shard.id.clone()),
            }
        }

        let mut migrations = 0;
        for shard_id in to_move {
            let Some(target) = online
                .iter()
                .min_by_key(|id| counts.get(*id).copied().unwrap_or(0))
                .cloned()
            else {
                break;
            };

            let migrating = self.update_shard_internal(&shard_id, |shard| {
                shard.status = ShardStatus::Migrating;
            });
            if migrating.is_err() {
                continue;
            }
            let flipped = self.update_shard_internal(&shard_id, |shard| {
                shard.node_id = target.clone();
                shard.status = ShardStatus::Active;
            });
            if flipped.is_ok() {
                tracing::info!("Migrated shard {} to node {}", shard_id, target);
                *counts.entry(target).or_insert(0) += 1;
                migrations += 1;
            }
        }

        migrations
    }

    fn update_shard_internal(
        &self,
        shard_id: &str,
        mutate: impl FnOnce(&mut ShardRecord),
    ) -> Result<ShardRecord> {
        let record = {
            let mut entry = self
                .shards
                .get_mut(shard_id)
                .ok_or_else(|| DocError::ShardNotFound(shard_id.to_string()))?;
            mutate(&mut entry);
            entry.clone()
        };
        self.persist_shard(&record)?;
        Ok(record)
    }

    /// Builds and adopts a routing table one version past the current one.
    pub fn publish_table(&self) {
        let version = self.table_version.fetch_add(1, Ordering::SeqCst) + 1;

        let nodes = self
            .nodes
            .iter()
            .map(|entry| {
                let status = match entry.status {
                    NodeHealth::Online => NodeStatus::Active,
                    NodeHealth::Offline => NodeStatus::Inactive,
                };
                (
                    entry.id.clone(),
                    NodeInfo {
                        location: entry.region.clone(),
                        metrics: entry.metrics.clone(),
                        status,
                    },
                )
            })
            .collect();

        let mut collections: HashMap<String, Vec<ShardRange>> = HashMap::new();
        for shard in self.list_shards() {
            let (Some(collection), Some(key_range)) = (shard.collection, shard.key_range) else {
                continue;
            };
            if shard.status == ShardStatus::Inactive {
                continue;
            }
            collections.entry(collection).or_default().push(ShardRange {
                shard_id: shard.id,
                key_range,
                node_id: shard.node_id,
            });
        }

        let table = RoutingTable {
            version,
            nodes,
            collections,
        };
        self.router.update_table(table);
    }

    // ------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------

    /// Test hook: rewinds a node's heartbeat clock.
    #[cfg(test)]
    pub(crate) fn age_heartbeat(&self, node_id: &str, by_ms: u64) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.last_heartbeat_at = entry.last_heartbeat_at.saturating_sub(by_ms);
        }
    }

    fn persist_node(&self, record: &NodeRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.kv.put(&format!("{NODE_KEY_PREFIX}{}", record.id), raw);
        Ok(())
    }

    fn persist_shard(&self, record: &ShardRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.kv.put(&format!("{SHARD_KEY_PREFIX}{}", record.id), raw);
        Ok(())
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
