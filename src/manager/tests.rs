use super::service::{CreateShardRequest, ShardManager, UpdateShardRequest, HEARTBEAT_TTL_MS};
use super::types::{NodeHealth, ShardStatus};
use crate::error::DocError;
use crate::routing::locality::{LocalityScorer, NodeMetrics};
use crate::routing::router::Router;
use crate::shard::kv::MemoryKv;
use std::sync::Arc;

fn test_manager() -> (Arc<ShardManager>, Arc<Router>, Arc<MemoryKv>) {
    let router = Arc::new(Router::new(100, Arc::new(LocalityScorer::new())));
    let kv = Arc::new(MemoryKv::new());
    let manager = ShardManager::new(kv.clone(), router.clone());
    (manager, router, kv)
}

#[test]
fn register_and_heartbeat_nodes() {
    let (manager, router, _) = test_manager();
    let node = manager
        .register_node("http://127.0.0.1:8101", "us-east", 100)
        .unwrap();
    assert_eq!(node.status, NodeHealth::Online);
    assert!(router.ring_nodes().contains(&node.id));

    let before = node.last_heartbeat_at;
    let updated = manager
        .heartbeat(
            &node.id,
            None,
            Some(NodeMetrics {
                latency_ms: 12.0,
                load_factor: 0.2,
                availability: 1.0,
            }),
            Some(80),
        )
        .unwrap();
    assert!(updated.last_heartbeat_at >= before);
    assert_eq!(updated.capacity, 80);
    assert_eq!(updated.metrics.latency_ms, 12.0);

    assert!(matches!(
        manager.heartbeat("node-ghost", None, None, None),
        Err(DocError::NodeNotFound(_))
    ));
}

#[test]
fn create_shard_picks_least_loaded_node() {
    let (manager, _, _) = test_manager();
    let first = manager
        .register_node("http://127.0.0.1:8101", "us-east", 100)
        .unwrap();
    let second = manager
        .register_node("http://127.0.0.1:8102", "us-east", 100)
        .unwrap();

    // Alternates between the two nodes, first-registered wins ties.
    let s1 = manager.create_shard(&CreateShardRequest::default()).unwrap();
    assert_eq!(s1.node_id, first.id);
    let s2 = manager.create_shard(&CreateShardRequest::default()).unwrap();
    assert_eq!(s2.node_id, second.id);
    let s3 = manager.create_shard(&CreateShardRequest::default()).unwrap();
    assert_eq!(s3.node_id, first.id);
}

#[test]
fn create_shard_honors_explicit_node() {
    let (manager, _, _) = test_manager();
    manager
        .register_node("http://127.0.0.1:8101", "us-east", 100)
        .unwrap();
    let target = manager
        .register_node("http://127.0.0.1:8102", "us-west", 100)
        .unwrap();

    let shard = manager
        .create_shard(&CreateShardRequest {
            primary_node_id: Some(target.id.clone()),
            ..CreateShardRequest::default()
        })
        .unwrap();
    assert_eq!(shard.node_id, target.id);
    assert_eq!(shard.status, ShardStatus::Active);

    assert!(manager
        .create_shard(&CreateShardRequest {
            primary_node_id: Some("node-ghost".into()),
            ..CreateShardRequest::default()
        })
        .is_err());
}

#[test]
fn create_shard_without_nodes_fails() {
    let (manager, _, _) = test_manager();
    assert!(matches!(
        manager.create_shard(&CreateShardRequest::default()),
        Err(DocError::NoShardsAvailable)
    ));
}

#[test]
fn missed_heartbeats_take_a_node_offline_and_move_its_shards() {
    let (manager, router, _) = test_manager();
    let dying = manager
        .register_node("http://127.0.0.1:8101", "us-east", 100)
        .unwrap();
    let surviving = manager
        .register_node("http://127.0.0.1:8102", "us-east", 100)
        .unwrap();

    let shard = manager
        .create_shard(&CreateShardRequest {
            primary_node_id: Some(dying.id.clone()),
            ..CreateShardRequest::default()
        })
        .unwrap();

    manager.age_heartbeat(&dying.id, HEARTBEAT_TTL_MS + 1000);
    let expired = manager.check_heartbeats();
    assert_eq!(expired, vec![dying.id.clone()]);

    assert_eq!(
        manager.get_node(&dying.id).unwrap().status,
        NodeHealth::Offline
    );
    assert!(!router.ring_nodes().contains(&dying.id));
    assert_eq!(
        manager.get_shard(&shard.id).unwrap().node_id,
        surviving.id
    );
}

#[test]
fn rebalance_levels_shard_counts() {
    let (manager, _, _) = test_manager();
    let first = manager
        .register_node("http://127.0.0.1:8101", "us-east", 100)
        .unwrap();
    for _ in 0..4 {
        manager
            .create_shard(&CreateShardRequest {
                primary_node_id: Some(first.id.clone()),
                ..CreateShardRequest::default()
            })
            .unwrap();
    }

    // Registration triggers a rebalance toward the new node.
    let second = manager
        .register_node("http://127.0.0.1:8102", "us-east", 100)
        .unwrap();

    let shards = manager.list_shards();
    let on_first = shards.iter().filter(|s| s.node_id == first.id).count();
    let on_second = shards.iter().filter(|s| s.node_id == second.id).count();
    assert_eq!(on_first, 2);
    assert_eq!(on_second, 2);
    assert!(shards.iter().all(|s| s.status == ShardStatus::Active));
}

#[test]
fn published_table_routes_explicit_ranges() {
    let (manager, router, _) = test_manager();
    let node = manager
        .register_node("http://127.0.0.1:8101", "us-east", 100)
        .unwrap();
    let shard = manager
        .create_shard(&CreateShardRequest {
            primary_node_id: Some(node.id.clone()),
            collection: Some("users".into()),
            key_range: Some(("a".into(), "zzzz".into())),
        })
        .unwrap();

    let table = router.table();
    assert!(table.version >= 2);
    assert_eq!(table.collections["users"].len(), 1);

    let decision = manager.lookup_shard("users", "alice").unwrap();
    assert_eq!(decision.shard_id, shard.id);
    assert_eq!(decision.node_id, node.id);
}

#[test]
fn update_shard_moves_ownership() {
    let (manager, _, _) = test_manager();
    let node = manager
        .register_node("http://127.0.0.1:8101", "us-east", 100)
        .unwrap();
    let other = manager
        .register_node("http://127.0.0.1:8102", "us-east", 100)
        .unwrap();
    let shard = manager
        .create_shard(&CreateShardRequest {
            primary_node_id: Some(node.id.clone()),
            ..CreateShardRequest::default()
        })
        .unwrap();

    let updated = manager
        .update_shard(
            &shard.id,
            &UpdateShardRequest {
                node_id: Some(other.id.clone()),
                status: Some(ShardStatus::Migrating),
            },
        )
        .unwrap();
    assert_eq!(updated.node_id, other.id);
    assert_eq!(updated.status, ShardStatus::Migrating);

    assert!(matches!(
        manager.update_shard("shard-ghost", &UpdateShardRequest::default()),
        Err(DocError::ShardNotFound(_))
    ));
}

#[test]
fn recover_reloads_persisted_records() {
    let (manager, _, kv) = test_manager();
    let node = manager
        .register_node("http://127.0.0.1:8101", "us-east", 100)
        .unwrap();
    let shard = manager
        .create_shard(&CreateShardRequest::default())
        .unwrap();

    // A fresh manager over the same KV sees both records.
    let router = Arc::new(Router::new(100, Arc::new(LocalityScorer::new())));
    let reloaded = ShardManager::new(kv, router);
    let loaded = reloaded.recover().unwrap();
    assert_eq!(loaded, 2);
    assert_eq!(reloaded.get_node(&node.id).unwrap().url, node.url);
    assert_eq!(reloaded.get_shard(&shard.id).unwrap().node_id, node.id);
}
