//! Request router.
//!
//! Composes the hash ring, the locality scorer and the routing-table snapshot
//! into the two placement questions the rest of the system asks: which shard
//! (and node) owns a single document, and which shards a query must touch.
//!
//! Explicit shard ranges from the routing table win when they cover the
//! collection; otherwise placement falls back to consistent hashing of
//! `"{collection}:{id}"`, which is deterministic across every node holding
//! the same ring membership.

use super::locality::LocalityScorer;
use super::ring::{fnv1a32, HashRing};
use super::table::{RoutingTable, ShardRange};
use crate::error::Result;
use crate::query::filter::{Filter, FilterOp};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub shard_id: String,
    pub node_id: String,
}

pub struct Router {
    ring: RwLock<HashRing>,
    scorer: Arc<LocalityScorer>,
    table: RwLock<Arc<RoutingTable>>,
}

impl Router {
    pub fn new(virtual_nodes: usize, scorer: Arc<LocalityScorer>) -> Self {
        Self {
            ring: RwLock::new(HashRing::new(virtual_nodes)),
            scorer,
            table: RwLock::new(Arc::new(RoutingTable::empty())),
        }
    }

    pub fn scorer(&self) -> &Arc<LocalityScorer> {
        &self.scorer
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.read().clone()
    }

    /// Ring membership maintenance for nodes discovered outside a routing
    /// table update (startup, direct registration).
    pub fn add_node(&self, node_id: &str) {
        self.ring.write().add(node_id);
    }

    pub fn remove_node(&self, node_id: &str) {
        self.ring.write().remove(node_id);
        self.scorer.remove_node(node_id);
    }

    pub fn ring_nodes(&self) -> Vec<String> {
        self.ring.read().nodes()
    }

    /// Adopts a routing table iff it is strictly newer, then reconciles the
    /// ring and scorer with its node set. Returns whether it was adopted.
    pub fn update_table(&self, incoming: RoutingTable) -> bool {
        let mut table_guard = self.table.write();
        if incoming.version <= table_guard.version {
            tracing::debug!(
                "Ignoring routing table v{} (current v{})",
                incoming.version,
                table_guard.version
            );
            return false;
        }

        {
            let mut ring = self.ring.write();
            for (node_id, info) in &incoming.nodes {
                if incoming.node_active(node_id) {
                    ring.add(node_id);
                    self.scorer.register_node(node_id, &info.location);
                    self.scorer.update_metrics(node_id, info.metrics.clone());
                } else {
                    ring.remove(node_id);
                    self.scorer.remove_node(node_id);
                }
            }
            for node_id in ring.nodes() {
                if !incoming.nodes.contains_key(&node_id) {
                    ring.remove(&node_id);
                    self.scorer.remove_node(&node_id);
                }
            }
        }

        tracing::info!(
            "Adopted routing table v{} ({} nodes, {} collections)",
            incoming.version,
            incoming.nodes.len(),
            incoming.collections.len()
        );
        *table_guard = Arc::new(incoming);
        true
    }

    /// Single-owner placement for `(collection, id)`.
    pub fn route(
        &self,
        collection: &str,
        id: &str,
        client_id: Option<&str>,
    ) -> Result<RouteDecision> {
        let table = self.table();

        if let Some(ranges) = table.collections.get(collection) {
            if let Some(range) = ranges.iter().find(|range| range.contains(id)) {
                let owners: Vec<String> = ranges
                    .iter()
                    .filter(|candidate| candidate.shard_id == range.shard_id)
                    .filter(|candidate| table.node_active(&candidate.node_id))
                    .map(|candidate| candidate.node_id.clone())
                    .collect();

                let node_id = match owners.len() {
                    // The table names no active owner; keep the recorded one
                    // so a recovering node still receives its traffic.
                    0 => range.node_id.clone(),
                    1 => owners[0].clone(),
                    _ => self.scorer.optimal_node(client_id, &owners)?,
                };

                return Ok(RouteDecision {
                    shard_id: range.shard_id.clone(),
                    node_id,
                });
            }
        }

        self.route_by_hash(collection, id)
    }

    fn route_by_hash(&self, collection: &str, id: &str) -> Result<RouteDecision> {
        let key = format!("{collection}:{id}");
        let ring = self.ring.read();
        let node_id = ring.get(&key)?.to_string();
        Ok(RouteDecision {
            shard_id: format!("shard-{:08x}", fnv1a32(&key)),
            node_id,
        })
    }

    /// Fan-out set for a query over `collection`.
    ///
    /// With explicit ranges, filters on `_id` prune the range set before it
    /// is deduplicated per shard. Without ranges, an id-equality filter
    /// collapses the fan-out to the single hash-routed owner, and anything
    /// else targets every active node (one implicit shard per node).
    pub fn shards_for_query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<RouteDecision>> {
        let table = self.table();

        if let Some(ranges) = table.collections.get(collection) {
            if !ranges.is_empty() {
                let id_filters: Vec<&Filter> = filters
                    .iter()
                    .filter(|filter| filter.field == "_id" && filter.op != FilterOp::Ne)
                    .collect();
                let mut decisions: Vec<RouteDecision> = Vec::new();
                for range in ranges {
                    if !id_filters
                        .iter()
                        .all(|filter| range_may_match(range, filter))
                    {
                        continue;
                    }
                    if decisions.iter().any(|d| d.shard_id == range.shard_id) {
                        continue;
                    }
                    decisions.push(RouteDecision {
                        shard_id: range.shard_id.clone(),
                        node_id: range.node_id.clone(),
                    });
                }
                return Ok(decisions);
            }
        }

        if let Some(id) = equality_id(filters) {
            return Ok(vec![self.route(collection, &id, None)?]);
        }

        let mut nodes = table.active_nodes();
        if nodes.is_empty() {
            nodes = self.ring.read().nodes();
        }
        Ok(nodes
            .into_iter()
            .map(|node_id| RouteDecision {
                shard_id: node_id.clone(),
                node_id,
            })
            .collect())
    }
}

fn equality_id(filters: &[Filter]) -> Option<String> {
    filters
        .iter()
        .find(|filter| filter.field == "_id" && filter.op == FilterOp::Eq)
        .and_then(|filter| filter.value.as_str().map(str::to_string))
}

/// Whether an `_id` constraint can select anything inside the range.
fn range_may_match(range: &ShardRange, filter: &Filter) -> bool {
    let Some(value) = filter.value.as_str() else {
        // Non-string id constraints cannot match any document id.
        return false;
    };
    let (lo, hi) = (range.key_range.0.as_str(), range.key_range.1.as_str());
    match filter.op {
        FilterOp::Eq => value >= lo && value <= hi,
        FilterOp::Gte => hi >= value,
        FilterOp::Gt => hi > value,
        FilterOp::Lte => lo <= value,
        FilterOp::Lt => lo < value,
        FilterOp::Ne => true,
    }
}
