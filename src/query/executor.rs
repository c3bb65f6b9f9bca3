//! Scatter-gather execution.
//!
//! Dispatches one fetch per shard target, all in parallel, raced against a
//! global deadline. Individual shards get retried with exponential backoff on
//! transient failures; a shard that stays down either fails the whole query
//! or, under `continue_on_error`, contributes an empty page and is reported
//! in the outcome.
//!
//! Merge order is fixed: concatenate, sum totals, sort, project, offset,
//! limit. Sort ties break by shard id and then document id so merged output
//! is deterministic.

use super::filter::compare_by_sort_keys;
use super::planner::{QueryPlan, ShardTarget};
use crate::document::FIELD_ID;
use crate::error::{DocError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// One shard's slice of a query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardPage {
    pub shard_id: String,
    pub results: Vec<Value>,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Transport seam: production fetches over HTTP or serves local shards,
/// tests plug in fakes.
#[async_trait]
pub trait ShardFetch: Send + Sync {
    async fn fetch(&self, collection: &str, target: &ShardTarget) -> Result<ShardPage>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
    pub continue_on_error: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            retry_backoff_ms: 100,
            continue_on_error: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub results: Vec<Value>,
    /// Sum of per-shard post-filter totals; failed shards contribute zero.
    pub total: u64,
    pub limit: Option<usize>,
    pub offset: usize,
    pub failed_shards: Vec<String>,
}

pub async fn execute(
    plan: &QueryPlan,
    fetcher: Arc<dyn ShardFetch>,
    config: &ExecutorConfig,
) -> Result<QueryOutcome> {
    let deadline = Duration::from_millis(config.timeout_ms);
    let pages = tokio::time::timeout(deadline, gather(plan, fetcher, config))
        .await
        .map_err(|_| DocError::QueryTimeout(config.timeout_ms))??;
    Ok(merge(plan, pages))
}

async fn gather(
    plan: &QueryPlan,
    fetcher: Arc<dyn ShardFetch>,
    config: &ExecutorConfig,
) -> Result<Vec<ShardPage>> {
    let mut tasks: JoinSet<ShardPage> = JoinSet::new();
    for target in &plan.targets {
        let fetcher = fetcher.clone();
        let collection = plan.collection.clone();
        let target = target.clone();
        let max_retries = config.max_retries;
        let backoff_ms = config.retry_backoff_ms;
        tasks.spawn(async move {
            match fetch_with_retry(&*fetcher, &collection, &target, max_retries, backoff_ms).await
            {
                Ok(page) => page,
                Err(e) => ShardPage {
                    shard_id: target.shard_id.clone(),
                    results: Vec::new(),
                    total: 0,
                    error: Some(e.to_string()),
                },
            }
        });
    }

    let mut pages = Vec::with_capacity(plan.targets.len());
    while let Some(joined) = tasks.join_next().await {
        let page = joined.map_err(|e| DocError::Internal(format!("shard fetch task died: {e}")))?;
        if let Some(error) = &page.error {
            tracing::warn!("Shard {} failed during query: {}", page.shard_id, error);
            if !config.continue_on_error {
                return Err(DocError::Network(format!(
                    "shard {} failed: {error}",
                    page.shard_id
                )));
            }
        }
        pages.push(page);
    }
    Ok(pages)
}

async fn fetch_with_retry(
    fetcher: &dyn ShardFetch,
    collection: &str,
    target: &ShardTarget,
    max_retries: usize,
    backoff_ms: u64,
) -> Result<ShardPage> {
    let mut attempt = 0;
    loop {
        match fetcher.fetch(collection, target).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = backoff_ms.saturating_mul(1 << attempt);
                tracing::debug!(
                    "Retrying shard {} after {} ms (attempt {}): {}",
                    target.shard_id,
                    delay,
                    attempt + 1,
                    e
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn merge(plan: &QueryPlan, pages: Vec<ShardPage>) -> QueryOutcome {
    let mut failed_shards = Vec::new();
    let mut total = 0u64;
    let mut rows: Vec<(String, Value)> = Vec::new();

    for page in pages {
        if page.error.is_some() {
            failed_shards.push(page.shard_id.clone());
        }
        total += page.total;
        for row in page.results {
            rows.push((page.shard_id.clone(), row));
        }
    }

    if !plan.options.sort.is_empty() {
        rows.sort_by(|a, b| {
            compare_by_sort_keys(&a.1, &b.1, &plan.options.sort)
                .then_with(|| a.0.cmp(&b.0))
                .then_with(|| doc_id_of(&a.1).cmp(&doc_id_of(&b.1)))
        });
    }

    let mut results: Vec<Value> = rows.into_iter().map(|(_, row)| row).collect();

    if let Some(projection) = &plan.projection {
        results = results
            .iter()
            .map(|row| apply_projection(row, projection))
            .collect();
    }

    let offset = plan.options.offset.unwrap_or(0);
    let limit = plan.options.limit;
    let iter = results.into_iter().skip(offset);
    let results: Vec<Value> = match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    };

    QueryOutcome {
        results,
        total,
        limit,
        offset,
        failed_shards,
    }
}

fn doc_id_of(row: &Value) -> &str {
    row.get(FIELD_ID).and_then(Value::as_str).unwrap_or("")
}

/// Keeps the reserved metadata fields and materializes each projected dotted
/// path as a nested object; undefined paths are elided.
pub fn apply_projection(row: &Value, paths: &[String]) -> Value {
    let mut out = Map::new();

    if let Some(source) = row.as_object() {
        for (key, value) in source {
            if crate::document::RESERVED_FIELDS.contains(&key.as_str()) {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    for path in paths {
        let Some(value) = super::filter::lookup_path(row, path) else {
            continue;
        };
        insert_nested(&mut out, path, value.clone());
    }

    Value::Object(out)
}

fn insert_nested(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Some(next) = slot.as_object_mut() {
                insert_nested(next, rest, value);
            }
        }
    }
}
