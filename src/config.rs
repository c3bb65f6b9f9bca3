//! Runtime configuration.
//!
//! All tunables come from environment variables with fixed defaults and are
//! collected once at startup into a `Config` that gets passed to the
//! components that need it. Nothing reads the environment after boot.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum serialized payload size for a single document.
    pub max_doc_bytes: usize,
    /// Hard cap on the number of results a query may return.
    pub max_query_results: usize,
    /// Batch size for bulk key-value reads during a collection scan.
    pub max_batch: usize,
    /// Global deadline for a scatter-gather query.
    pub request_timeout_ms: u64,
    /// Lifetime of a transaction from `begin` to forced abort.
    pub transaction_timeout_ms: u64,
    /// Retry attempts for transient inter-node failures.
    pub max_retries: usize,
    /// Base backoff, doubled per attempt.
    pub retry_backoff_ms: u64,
    /// Virtual nodes per physical node on the hash ring.
    pub virtual_nodes_per_physical: usize,
    /// Latency above this marks a node as slow in heartbeat metrics.
    pub latency_threshold_ms: f64,
    /// Load factor above this marks a node as overloaded.
    pub load_factor_threshold: f64,
    /// Query plans costing more than this are rejected.
    pub max_plan_cost: f64,
    /// Deployment environment label reported by `/health`.
    pub environment: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_doc_bytes: 1_048_576,
            max_query_results: 1000,
            max_batch: 100,
            request_timeout_ms: 30_000,
            transaction_timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_ms: 100,
            virtual_nodes_per_physical: 100,
            latency_threshold_ms: 100.0,
            load_factor_threshold: 0.8,
            max_plan_cost: 100.0,
            environment: "development".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            max_doc_bytes: env_parse("MAX_DOC_BYTES", defaults.max_doc_bytes),
            max_query_results: env_parse("MAX_QUERY_RESULTS", defaults.max_query_results),
            max_batch: env_parse("MAX_BATCH", defaults.max_batch),
            request_timeout_ms: env_parse("REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            transaction_timeout_ms: env_parse(
                "TRANSACTION_TIMEOUT_MS",
                defaults.transaction_timeout_ms,
            ),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            retry_backoff_ms: env_parse("RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
            virtual_nodes_per_physical: env_parse(
                "VIRTUAL_NODES_PER_PHYSICAL",
                defaults.virtual_nodes_per_physical,
            ),
            latency_threshold_ms: env_parse("LATENCY_THRESHOLD_MS", defaults.latency_threshold_ms),
            load_factor_threshold: env_parse(
                "LOAD_FACTOR_THRESHOLD",
                defaults.load_factor_threshold,
            ),
            max_plan_cost: env_parse("MAX_PLAN_COST", defaults.max_plan_cost),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_doc_bytes, 1_048_576);
        assert_eq!(config.max_query_results, 1000);
        assert_eq!(config.transaction_timeout_ms, 10_000);
        assert_eq!(config.virtual_nodes_per_physical, 100);
    }
}
