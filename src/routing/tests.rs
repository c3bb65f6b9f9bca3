use super::locality::{LocalityScorer, NodeMetrics};
use super::ring::HashRing;
use super::router::Router;
use super::table::{NodeInfo, NodeStatus, RoutingTable, ShardRange};
use crate::error::DocError;
use crate::query::filter::{Filter, FilterOp};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn test_router() -> Router {
    Router::new(100, Arc::new(LocalityScorer::new()))
}

fn node_info(location: &str, status: NodeStatus) -> NodeInfo {
    NodeInfo {
        location: location.to_string(),
        metrics: NodeMetrics::default(),
        status,
    }
}

// ============================================================
// HASH RING
// ============================================================

#[test]
fn ring_lookup_is_deterministic() {
    let mut ring = HashRing::new(1000);
    ring.add("node-a");
    ring.add("node-b");
    ring.add("node-c");

    for i in 0..100 {
        let key = format!("key-{i}");
        let first = ring.get(&key).unwrap().to_string();
        let second = ring.get(&key).unwrap().to_string();
        assert_eq!(first, second);
    }
}

#[test]
fn ring_distributes_keys_evenly() {
    let mut ring = HashRing::new(1000);
    ring.add("node-a");
    ring.add("node-b");
    ring.add("node-c");

    let mut counts: HashMap<String, usize> = HashMap::new();
    for i in 0..10_000 {
        let owner = ring.get(&format!("key-{i}")).unwrap().to_string();
        *counts.entry(owner).or_insert(0) += 1;
    }

    assert_eq!(counts.len(), 3);
    for (node, count) in counts {
        assert!(
            (3000..=3667).contains(&count),
            "node {node} owns {count} keys, outside the +-10% band"
        );
    }
}

#[test]
fn adding_a_node_remaps_a_bounded_share() {
    let mut ring = HashRing::new(1000);
    ring.add("node-a");
    ring.add("node-b");
    ring.add("node-c");

    let before: Vec<String> = (0..10_000)
        .map(|i| ring.get(&format!("key-{i}")).unwrap().to_string())
        .collect();

    ring.add("node-d");

    let moved = (0..10_000)
        .filter(|i| ring.get(&format!("key-{i}")).unwrap() != before[*i as usize])
        .count();

    assert!(moved <= 3334, "{moved} keys moved, expected at most 3334");
    assert!(moved > 0, "adding a node should move some keys");
}

#[test]
fn removing_a_node_keeps_other_placements() {
    let mut ring = HashRing::new(200);
    ring.add("node-a");
    ring.add("node-b");
    ring.add("node-c");

    let owned_by_a: Vec<String> = (0..1000)
        .map(|i| format!("key-{i}"))
        .filter(|key| ring.get(key).unwrap() == "node-a")
        .collect();

    ring.remove("node-b");
    for key in &owned_by_a {
        assert_eq!(ring.get(key).unwrap(), "node-a");
    }
}

#[test]
fn ring_add_and_remove_are_idempotent() {
    let mut ring = HashRing::new(100);
    ring.add("node-a");
    ring.add("node-a");
    assert_eq!(ring.len(), 1);

    ring.remove("node-a");
    ring.remove("node-a");
    assert!(ring.is_empty());
    ring.remove("never-there");
}

#[test]
fn empty_ring_fails_lookup() {
    let ring = HashRing::new(100);
    assert!(matches!(ring.get("anything"), Err(DocError::EmptyRing)));
}

// ============================================================
// LOCALITY SCORER
// ============================================================

#[test]
fn empty_candidates_fail() {
    let scorer = LocalityScorer::new();
    assert!(matches!(
        scorer.optimal_node(None, &[]),
        Err(DocError::NoCandidates)
    ));
}

#[test]
fn single_candidate_wins_outright() {
    let scorer = LocalityScorer::new();
    let picked = scorer
        .optimal_node(None, &["node-a".to_string()])
        .unwrap();
    assert_eq!(picked, "node-a");
}

#[test]
fn untracked_candidates_fall_back_to_first() {
    let scorer = LocalityScorer::new();
    let candidates = vec!["ghost-1".to_string(), "ghost-2".to_string()];
    assert_eq!(scorer.optimal_node(None, &candidates).unwrap(), "ghost-1");
}

#[test]
fn client_prefers_same_location_node() {
    let scorer = LocalityScorer::new();
    scorer.register_node("node-east", "us-east");
    scorer.register_node("node-west", "us-west");
    // The remote node reports much better metrics, but locality wins.
    scorer.update_metrics(
        "node-west",
        NodeMetrics {
            latency_ms: 1.0,
            load_factor: 0.0,
            availability: 1.0,
        },
    );
    scorer.register_client("client-1", "us-east");

    let candidates = vec!["node-west".to_string(), "node-east".to_string()];
    let picked = scorer.optimal_node(Some("client-1"), &candidates).unwrap();
    assert_eq!(picked, "node-east");
}

#[test]
fn without_client_location_lowest_score_wins() {
    let scorer = LocalityScorer::new();
    scorer.register_node("node-slow", "us-east");
    scorer.register_node("node-fast", "us-west");
    scorer.update_metrics(
        "node-slow",
        NodeMetrics {
            latency_ms: 250.0,
            load_factor: 0.9,
            availability: 0.7,
        },
    );
    scorer.update_metrics(
        "node-fast",
        NodeMetrics {
            latency_ms: 5.0,
            load_factor: 0.1,
            availability: 1.0,
        },
    );

    let candidates = vec!["node-slow".to_string(), "node-fast".to_string()];
    assert_eq!(scorer.optimal_node(None, &candidates).unwrap(), "node-fast");
}

#[test]
fn metrics_update_for_unknown_node_is_dropped() {
    let scorer = LocalityScorer::new();
    scorer.update_metrics("ghost", NodeMetrics::default());
    assert_eq!(scorer.node_count(), 0);
}

#[test]
fn score_formula_weights() {
    let metrics = NodeMetrics {
        latency_ms: 50.0,
        load_factor: 0.5,
        availability: 0.9,
    };
    let expected = 0.6 * 50.0 + 30.0 * 0.5 + 100.0 * 0.1;
    assert!((metrics.score() - expected).abs() < 1e-9);
}

#[test]
fn location_distance_uses_matrix_and_sentinel() {
    let scorer = LocalityScorer::new();
    assert_eq!(scorer.location_distance("us-east", "us-east"), 0.0);
    assert_eq!(scorer.location_distance("us-east", "us-west"), 70.0);
    assert_eq!(scorer.location_distance("us-west", "us-east"), 70.0);
    assert_eq!(scorer.location_distance("us-east", "mars-1"), 300.0);
}

// ============================================================
// ROUTING TABLE + ROUTER
// ============================================================

fn table_with_ranges(version: u64) -> RoutingTable {
    let mut nodes = HashMap::new();
    nodes.insert("node-1".to_string(), node_info("us-east", NodeStatus::Active));
    nodes.insert("node-2".to_string(), node_info("us-west", NodeStatus::Active));

    let mut collections = HashMap::new();
    collections.insert(
        "users".to_string(),
        vec![
            ShardRange {
                shard_id: "users-0".to_string(),
                key_range: ("a".to_string(), "m".to_string()),
                node_id: "node-1".to_string(),
            },
            ShardRange {
                shard_id: "users-1".to_string(),
                key_range: ("n".to_string(), "zzzz".to_string()),
                node_id: "node-2".to_string(),
            },
        ],
    );

    RoutingTable {
        version,
        nodes,
        collections,
    }
}

#[test]
fn stale_table_versions_are_rejected() {
    let router = test_router();
    assert!(router.update_table(table_with_ranges(2)));
    assert!(!router.update_table(table_with_ranges(2)));
    assert!(!router.update_table(table_with_ranges(1)));
    assert_eq!(router.table().version, 2);
    assert!(router.update_table(table_with_ranges(3)));
}

#[test]
fn table_adoption_reconciles_the_ring() {
    let router = test_router();
    router.add_node("node-old");
    assert!(router.update_table(table_with_ranges(1)));

    let nodes = router.ring_nodes();
    assert!(nodes.contains(&"node-1".to_string()));
    assert!(nodes.contains(&"node-2".to_string()));
    assert!(!nodes.contains(&"node-old".to_string()));
}

#[test]
fn route_uses_explicit_ranges() {
    let router = test_router();
    router.update_table(table_with_ranges(1));

    let low = router.route("users", "alice", None).unwrap();
    assert_eq!(low.shard_id, "users-0");
    assert_eq!(low.node_id, "node-1");

    let high = router.route("users", "zoe", None).unwrap();
    assert_eq!(high.shard_id, "users-1");
    assert_eq!(high.node_id, "node-2");
}

#[test]
fn route_falls_back_to_hashing() {
    let router = test_router();
    router.add_node("node-a");
    router.add_node("node-b");

    let first = router.route("orders", "o-17", None).unwrap();
    let second = router.route("orders", "o-17", None).unwrap();
    assert_eq!(first, second);
    assert!(first.shard_id.starts_with("shard-"));
}

#[test]
fn route_with_no_nodes_fails() {
    let router = test_router();
    assert!(matches!(
        router.route("orders", "o-1", None),
        Err(DocError::EmptyRing)
    ));
}

#[test]
fn replicated_range_picks_by_locality() {
    let mut table = table_with_ranges(1);
    // Replicate users-0 onto node-2 as well.
    table
        .collections
        .get_mut("users")
        .unwrap()
        .push(ShardRange {
            shard_id: "users-0".to_string(),
            key_range: ("a".to_string(), "m".to_string()),
            node_id: "node-2".to_string(),
        });

    let scorer = Arc::new(LocalityScorer::new());
    scorer.register_client("client-west", "us-west");
    let router = Router::new(100, scorer);
    router.update_table(table);

    let decision = router
        .route("users", "alice", Some("client-west"))
        .unwrap();
    assert_eq!(decision.shard_id, "users-0");
    assert_eq!(decision.node_id, "node-2");
}

#[test]
fn query_fanout_covers_all_ranges() {
    let router = test_router();
    router.update_table(table_with_ranges(1));

    let decisions = router.shards_for_query("users", &[]).unwrap();
    let shard_ids: Vec<&str> = decisions.iter().map(|d| d.shard_id.as_str()).collect();
    assert_eq!(shard_ids, vec!["users-0", "users-1"]);
}

#[test]
fn query_fanout_prunes_on_id_equality() {
    let router = test_router();
    router.update_table(table_with_ranges(1));

    let filter = Filter {
        field: "_id".to_string(),
        op: FilterOp::Eq,
        value: json!("alice"),
    };
    let decisions = router.shards_for_query("users", &[filter]).unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].shard_id, "users-0");
}

#[test]
fn query_fanout_prunes_on_id_range() {
    let router = test_router();
    router.update_table(table_with_ranges(1));

    let filter = Filter {
        field: "_id".to_string(),
        op: FilterOp::Gte,
        value: json!("p"),
    };
    let decisions = router.shards_for_query("users", &[filter]).unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].shard_id, "users-1");
}

#[test]
fn unknown_collection_fans_out_to_active_nodes() {
    let router = test_router();
    router.update_table(table_with_ranges(1));

    let decisions = router.shards_for_query("unknown", &[]).unwrap();
    let nodes: Vec<&str> = decisions.iter().map(|d| d.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["node-1", "node-2"]);
}

#[test]
fn rangeless_id_equality_collapses_to_hash_owner() {
    let router = test_router();
    router.add_node("node-a");
    router.add_node("node-b");

    let filter = Filter {
        field: "_id".to_string(),
        op: FilterOp::Eq,
        value: json!("o-17"),
    };
    let decisions = router.shards_for_query("orders", &[filter]).unwrap();
    assert_eq!(decisions.len(), 1);

    let direct = router.route("orders", "o-17", None).unwrap();
    assert_eq!(decisions[0], direct);
}
