//! Locality-aware node scoring.
//!
//! Tracks where nodes and clients live and how nodes are performing, and picks
//! the best candidate node for a given client. Lower score is better:
//! `0.6 * latency_ms + 30 * load_factor + 100 * (1 - availability)`.
//!
//! Metrics older than five minutes fall back to defaults so a node that went
//! quiet is judged by a neutral profile rather than its last good report.
//! Client registrations expire after 24 hours; expired entries are swept
//! lazily whenever a client registers.

use crate::document::now_ms;
use crate::error::{DocError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const METRICS_STALE_MS: u64 = 5 * 60 * 1000;
const CLIENT_TTL_MS: u64 = 24 * 60 * 60 * 1000;
/// Assumed round trip between regions absent from the latency matrix.
const UNKNOWN_PAIR_LATENCY_MS: f64 = 300.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub latency_ms: f64,
    pub load_factor: f64,
    pub availability: f64,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            latency_ms: 100.0,
            load_factor: 0.5,
            availability: 1.0,
        }
    }
}

impl NodeMetrics {
    pub fn score(&self) -> f64 {
        0.6 * self.latency_ms + 30.0 * self.load_factor + 100.0 * (1.0 - self.availability)
    }
}

#[derive(Debug, Clone)]
struct NodeProfile {
    location: String,
    metrics: NodeMetrics,
    metrics_updated_at: u64,
}

#[derive(Debug, Clone)]
struct ClientEntry {
    location: String,
    last_seen: u64,
}

pub struct LocalityScorer {
    nodes: DashMap<String, NodeProfile>,
    clients: DashMap<String, ClientEntry>,
    latency_matrix: HashMap<(String, String), f64>,
}

impl LocalityScorer {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            clients: DashMap::new(),
            latency_matrix: default_latency_matrix(),
        }
    }

    pub fn register_node(&self, node_id: &str, location: &str) {
        let now = now_ms();
        self.nodes
            .entry(node_id.to_string())
            .and_modify(|profile| profile.location = location.to_string())
            .or_insert_with(|| NodeProfile {
                location: location.to_string(),
                metrics: NodeMetrics::default(),
                metrics_updated_at: now,
            });
    }

    pub fn remove_node(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Updates a tracked node's metrics. Reports for unknown nodes are dropped.
    pub fn update_metrics(&self, node_id: &str, metrics: NodeMetrics) {
        match self.nodes.get_mut(node_id) {
            Some(mut profile) => {
                profile.metrics = metrics;
                profile.metrics_updated_at = now_ms();
            }
            None => {
                tracing::warn!("Dropping metrics update for unknown node {}", node_id);
            }
        }
    }

    pub fn register_client(&self, client_id: &str, location: &str) {
        let now = now_ms();
        self.clients.retain(|_, entry| now.saturating_sub(entry.last_seen) < CLIENT_TTL_MS);
        self.clients.insert(
            client_id.to_string(),
            ClientEntry {
                location: location.to_string(),
                last_seen: now,
            },
        );
    }

    pub fn client_location(&self, client_id: &str) -> Option<String> {
        self.clients.get(client_id).and_then(|entry| {
            if now_ms().saturating_sub(entry.last_seen) < CLIENT_TTL_MS {
                Some(entry.location.clone())
            } else {
                None
            }
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Picks the best candidate for `client_id`.
    ///
    /// Policy: a single candidate wins outright; untracked candidates are
    /// filtered out (all untracked falls back to the first); a client with a
    /// known location prefers the same-location candidate with the lowest
    /// metric score, otherwise the lowest combined score of metrics plus the
    /// inter-region latency penalty.
    pub fn optimal_node(&self, client_id: Option<&str>, candidates: &[String]) -> Result<String> {
        if candidates.is_empty() {
            return Err(DocError::NoCandidates);
        }
        if candidates.len() == 1 {
            return Ok(candidates[0].clone());
        }

        let tracked: Vec<(String, NodeProfile)> = candidates
            .iter()
            .filter_map(|id| {
                self.nodes
                    .get(id)
                    .map(|profile| (id.clone(), profile.clone()))
            })
            .collect();

        if tracked.is_empty() {
            return Ok(candidates[0].clone());
        }

        let client_location = client_id.and_then(|id| self.client_location(id));

        if let Some(location) = &client_location {
            let local_best = tracked
                .iter()
                .filter(|(_, profile)| &profile.location == location)
                .min_by(|a, b| total_cmp(self.effective_score(&a.1), self.effective_score(&b.1)));
            if let Some((id, _)) = local_best {
                return Ok(id.clone());
            }
        }

        let best = tracked
            .iter()
            .min_by(|a, b| {
                let score_a = self.effective_score(&a.1) + self.penalty(&client_location, &a.1);
                let score_b = self.effective_score(&b.1) + self.penalty(&client_location, &b.1);
                total_cmp(score_a, score_b)
            })
            .map(|(id, _)| id.clone());

        // tracked is non-empty here
        best.ok_or(DocError::NoCandidates)
    }

    fn effective_score(&self, profile: &NodeProfile) -> f64 {
        if now_ms().saturating_sub(profile.metrics_updated_at) > METRICS_STALE_MS {
            NodeMetrics::default().score()
        } else {
            profile.metrics.score()
        }
    }

    fn penalty(&self, client_location: &Option<String>, profile: &NodeProfile) -> f64 {
        let Some(location) = client_location else {
            return 0.0;
        };
        self.location_distance(location, &profile.location)
    }

    /// One-way latency between two regions from the static matrix.
    pub fn location_distance(&self, from: &str, to: &str) -> f64 {
        if from == to {
            return 0.0;
        }
        let key = pair_key(from, to);
        self.latency_matrix
            .get(&key)
            .copied()
            .unwrap_or(UNKNOWN_PAIR_LATENCY_MS)
    }
}

impl Default for LocalityScorer {
    fn default() -> Self {
        Self::new()
    }
}

fn total_cmp(a: f64, b: f64) -> std::cmp::Ordering {
    a.total_cmp(&b)
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn default_latency_matrix() -> HashMap<(String, String), f64> {
    let pairs: &[(&str, &str, f64)] = &[
        ("us-east", "us-west", 70.0),
        ("us-east", "eu-west", 90.0),
        ("us-east", "ap-south", 210.0),
        ("us-west", "eu-west", 140.0),
        ("us-west", "ap-south", 160.0),
        ("eu-west", "ap-south", 120.0),
    ];
    pairs
        .iter()
        .map(|(a, b, latency)| (pair_key(a, b), *latency))
        .collect()
}
