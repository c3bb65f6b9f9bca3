//! Data-plane service.
//!
//! The node-local entry point for document traffic. Every operation routes
//! first; if the owning node is this one the local shard serves it, otherwise
//! the call forwards to the owner's internal endpoint. Forwarded writes carry
//! an operation id so a retried hop cannot apply twice.
//!
//! Queries run the full pipeline here: parse, plan against the router's
//! fan-out set, scatter-gather (local shards in-process, remote shards over
//! HTTP), then aggregate.

use super::client::HttpClient;
use super::protocol::{
    Ack, InternalDeleteRequest, InternalGetRequest, InternalPutRequest, InternalPutResponse,
    InternalQueryRequest, QueryResponse, TxnPhaseRequest, TxnPrepareRequest,
    ENDPOINT_INTERNAL_DELETE, ENDPOINT_INTERNAL_GET, ENDPOINT_INTERNAL_PUT,
    ENDPOINT_INTERNAL_QUERY, ENDPOINT_INTERNAL_TXN_ABORT, ENDPOINT_INTERNAL_TXN_COMMIT,
    ENDPOINT_INTERNAL_TXN_PREPARE,
};
use crate::config::Config;
use crate::document::{now_ms, Document};
use crate::error::Result;
use crate::manager::service::ShardManager;
use crate::query::aggregate::{aggregate, parse_aggregations};
use crate::query::executor::{execute, ExecutorConfig, ShardFetch, ShardPage};
use crate::query::parser::{parse, QueryRequest};
use crate::query::planner::{plan, ShardTarget};
use crate::routing::router::Router;
use crate::shard::set::ShardSet;
use crate::txn::coordinator::ParticipantClient;
use crate::txn::types::Operation;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct DataService {
    node_id: String,
    router: Arc<Router>,
    shards: Arc<ShardSet>,
    manager: Arc<ShardManager>,
    http: HttpClient,
    config: Arc<Config>,
    processed_ops: DashMap<String, u64>,
}

impl DataService {
    pub fn new(
        node_id: impl Into<String>,
        router: Arc<Router>,
        shards: Arc<ShardSet>,
        manager: Arc<ShardManager>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            router,
            shards,
            manager,
            http: HttpClient::new(&config),
            config,
            processed_ops: DashMap::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn shards(&self) -> &Arc<ShardSet> {
        &self.shards
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    fn is_local(&self, node_id: &str) -> bool {
        node_id == self.node_id
    }

    /// Idempotency gate for forwarded writes.
    pub fn should_process(&self, op_id: &str) -> bool {
        if self.processed_ops.contains_key(op_id) {
            return false;
        }
        if self.processed_ops.len() > 10_000 {
            self.processed_ops.clear();
        }
        self.processed_ops.insert(op_id.to_string(), now_ms());
        true
    }

    /// Ties a client id to a region for locality-biased routing.
    pub fn register_client(&self, client_id: &str, location: &str) {
        self.router.scorer().register_client(client_id, location);
    }

    // ------------------------------------------------------------
    // Single-document operations
    // ------------------------------------------------------------

    pub async fn get_document(
        &self,
        collection: &str,
        id: &str,
        client_id: Option<&str>,
    ) -> Result<Document> {
        let decision = self.router.route(collection, id, client_id)?;
        if self.is_local(&decision.node_id) {
            return self
                .shards
                .get_or_create(&decision.shard_id)
                .get(collection, id);
        }

        tracing::debug!(
            "Forwarding GET {}/{} to node {}",
            collection,
            id,
            decision.node_id
        );
        let url = self.manager.node_url(&decision.node_id)?;
        let request = InternalGetRequest {
            shard_id: decision.shard_id,
            collection: collection.to_string(),
            id: id.to_string(),
        };
        let value: Value = self
            .http
            .post_json(&format!("{url}{ENDPOINT_INTERNAL_GET}"), &request)
            .await?;
        Document::from_value(value)
    }

    pub async fn put_document(
        &self,
        collection: &str,
        id: &str,
        payload: Map<String, Value>,
        client_id: Option<&str>,
    ) -> Result<(Document, bool)> {
        let decision = self.router.route(collection, id, client_id)?;
        if self.is_local(&decision.node_id) {
            return self
                .shards
                .get_or_create(&decision.shard_id)
                .put(collection, id, payload);
        }

        tracing::debug!(
            "Forwarding PUT {}/{} to node {}",
            collection,
            id,
            decision.node_id
        );
        let url = self.manager.node_url(&decision.node_id)?;
        let request = InternalPutRequest {
            shard_id: decision.shard_id,
            collection: collection.to_string(),
            id: id.to_string(),
            op_id: Uuid::new_v4().to_string(),
            payload,
        };
        let response: InternalPutResponse = self
            .http
            .post_json(&format!("{url}{ENDPOINT_INTERNAL_PUT}"), &request)
            .await?;
        Ok((Document::from_value(response.document)?, response.created))
    }

    pub async fn delete_document(
        &self,
        collection: &str,
        id: &str,
        client_id: Option<&str>,
    ) -> Result<()> {
        let decision = self.router.route(collection, id, client_id)?;
        if self.is_local(&decision.node_id) {
            return self
                .shards
                .get_or_create(&decision.shard_id)
                .delete(collection, id);
        }

        let url = self.manager.node_url(&decision.node_id)?;
        let request = InternalDeleteRequest {
            shard_id: decision.shard_id,
            collection: collection.to_string(),
            id: id.to_string(),
            op_id: Uuid::new_v4().to_string(),
        };
        let _: Ack = self
            .http
            .post_json(&format!("{url}{ENDPOINT_INTERNAL_DELETE}"), &request)
            .await?;
        Ok(())
    }

    /// Local halves of forwarded writes, deduplicated per op id.
    pub fn apply_forwarded_put(
        &self,
        request: &InternalPutRequest,
    ) -> Result<(Document, bool)> {
        if !self.should_process(&request.op_id) {
            let doc = self
                .shards
                .get_or_create(&request.shard_id)
                .get(&request.collection, &request.id)?;
            return Ok((doc, false));
        }
        self.shards.get_or_create(&request.shard_id).put(
            &request.collection,
            &request.id,
            request.payload.clone(),
        )
    }

    pub fn apply_forwarded_delete(&self, request: &InternalDeleteRequest) -> Result<()> {
        if !self.should_process(&request.op_id) {
            return Ok(());
        }
        self.shards
            .get_or_create(&request.shard_id)
            .delete(&request.collection, &request.id)
    }

    // ------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------

    pub async fn query(&self, collection: &str, request: &QueryRequest) -> Result<QueryResponse> {
        let mut parsed = parse(collection, request)?;
        // The result-set ceiling applies whether or not the client asked for
        // a limit.
        let cap = self.config.max_query_results;
        parsed.options.limit = Some(parsed.options.limit.map_or(cap, |limit| limit.min(cap)));
        let specs = parse_aggregations(&request.aggregations)?;

        let decisions = self
            .router
            .shards_for_query(collection, &parsed.expression.conditions)?;
        if decisions.is_empty() {
            let aggregations = if specs.is_empty() {
                None
            } else {
                Some(aggregate(&[], &specs))
            };
            return Ok(QueryResponse {
                results: Vec::new(),
                metadata: super::protocol::QueryMetadata {
                    total: 0,
                    limit: parsed.options.limit,
                    offset: parsed.options.offset.unwrap_or(0),
                    failed_shards: Vec::new(),
                },
                aggregations,
            });
        }

        let shard_ids: Vec<String> = decisions.iter().map(|d| d.shard_id.clone()).collect();
        let query_plan = plan(&parsed, &shard_ids, self.config.max_plan_cost)?;

        let fetcher = Arc::new(RoutedFetch {
            local_node: self.node_id.clone(),
            shards: self.shards.clone(),
            manager: self.manager.clone(),
            http: self.http.clone(),
            nodes: decisions
                .into_iter()
                .map(|d| (d.shard_id, d.node_id))
                .collect(),
        });

        let executor_config = ExecutorConfig {
            timeout_ms: self.config.request_timeout_ms,
            max_retries: self.config.max_retries,
            retry_backoff_ms: self.config.retry_backoff_ms,
            continue_on_error: true,
        };
        let outcome = execute(&query_plan, fetcher, &executor_config).await?;

        let aggregations = if specs.is_empty() {
            None
        } else {
            Some(aggregate(&outcome.results, &specs))
        };
        Ok(QueryResponse::from_outcome(outcome, aggregations))
    }

    /// Executes one shard target locally; the remote side of
    /// `/internal/query`.
    pub fn fetch_local(&self, collection: &str, target: &ShardTarget) -> Result<ShardPage> {
        query_local_target(&self.shards, &self.node_id, collection, target)
    }
}

/// Serves one shard target from this node's shards. A target whose shard id
/// is the node id itself is the rangeless fan-out case and spans every local
/// shard; anything else addresses one specific shard.
fn query_local_target(
    shards: &ShardSet,
    local_node: &str,
    collection: &str,
    target: &ShardTarget,
) -> Result<ShardPage> {
    if target.shard_id == local_node {
        let mut results = Vec::new();
        let mut total = 0u64;
        for shard_id in shards.shard_ids() {
            let Some(store) = shards.get(&shard_id) else {
                continue;
            };
            let page = store.query(collection, &target.filters, &target.options)?;
            total += page.total;
            results.extend(page.results.iter().map(Document::to_value));
        }
        return Ok(ShardPage {
            shard_id: target.shard_id.clone(),
            results,
            total,
            error: None,
        });
    }

    let page = shards
        .get_or_create(&target.shard_id)
        .query(collection, &target.filters, &target.options)?;
    Ok(ShardPage {
        shard_id: target.shard_id.clone(),
        results: page.results.iter().map(Document::to_value).collect(),
        total: page.total,
        error: None,
    })
}

/// Fetch transport for the executor: local shards in-process, remote shards
/// through their node's internal query endpoint.
struct RoutedFetch {
    local_node: String,
    shards: Arc<ShardSet>,
    manager: Arc<ShardManager>,
    http: HttpClient,
    nodes: HashMap<String, String>,
}

#[async_trait]
impl ShardFetch for RoutedFetch {
    async fn fetch(&self, collection: &str, target: &ShardTarget) -> Result<ShardPage> {
        let node_id = self
            .nodes
            .get(&target.shard_id)
            .cloned()
            .unwrap_or_else(|| target.shard_id.clone());

        if node_id == self.local_node {
            return query_local_target(&self.shards, &self.local_node, collection, target);
        }

        let url = self.manager.node_url(&node_id)?;
        let request = InternalQueryRequest {
            collection: collection.to_string(),
            target: target.clone(),
        };
        self.http
            .post_json(&format!("{url}{ENDPOINT_INTERNAL_QUERY}"), &request)
            .await
    }
}

/// Participant transport for the coordinator: local shards prepare/commit/
/// abort in-process, remote shards through their node's internal endpoints.
pub struct RoutedParticipants {
    local_node: String,
    shards: Arc<ShardSet>,
    manager: Arc<ShardManager>,
    http: HttpClient,
}

impl RoutedParticipants {
    pub fn new(
        local_node: impl Into<String>,
        shards: Arc<ShardSet>,
        manager: Arc<ShardManager>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node: local_node.into(),
            shards,
            manager,
            http: HttpClient::new(config),
        })
    }
}

#[async_trait]
impl ParticipantClient for RoutedParticipants {
    async fn prepare(
        &self,
        node_id: &str,
        shard_id: &str,
        tx_id: &str,
        ops: &[Operation],
        expires_at: u64,
    ) -> Result<()> {
        if node_id == self.local_node {
            return self
                .shards
                .get_or_create(shard_id)
                .prepare(tx_id, ops, expires_at);
        }
        let url = self.manager.node_url(node_id)?;
        let request = TxnPrepareRequest {
            tx_id: tx_id.to_string(),
            shard_id: shard_id.to_string(),
            ops: ops.to_vec(),
            expires_at,
        };
        let _: Ack = self
            .http
            .post_json(&format!("{url}{ENDPOINT_INTERNAL_TXN_PREPARE}"), &request)
            .await?;
        Ok(())
    }

    async fn commit(&self, node_id: &str, shard_id: &str, tx_id: &str) -> Result<()> {
        if node_id == self.local_node {
            return self.shards.get_or_create(shard_id).commit(tx_id);
        }
        let url = self.manager.node_url(node_id)?;
        let request = TxnPhaseRequest {
            tx_id: tx_id.to_string(),
            shard_id: shard_id.to_string(),
        };
        let _: Ack = self
            .http
            .post_json(&format!("{url}{ENDPOINT_INTERNAL_TXN_COMMIT}"), &request)
            .await?;
        Ok(())
    }

    async fn abort(&self, node_id: &str, shard_id: &str, tx_id: &str) -> Result<()> {
        if node_id == self.local_node {
            return self.shards.get_or_create(shard_id).abort(tx_id);
        }
        let url = self.manager.node_url(node_id)?;
        let request = TxnPhaseRequest {
            tx_id: tx_id.to_string(),
            shard_id: shard_id.to_string(),
        };
        let _: Ack = self
            .http
            .post_json(&format!("{url}{ENDPOINT_INTERNAL_TXN_ABORT}"), &request)
            .await?;
        Ok(())
    }
}
