use super::protocol::InternalPutRequest;
use super::service::DataService;
use crate::config::Config;
use crate::error::DocError;
use crate::manager::service::ShardManager;
use crate::query::parser::{QueryRequest, RawAggregation, RawFilter, RawOptions, RawSort};
use crate::routing::locality::LocalityScorer;
use crate::routing::router::Router;
use crate::shard::kv::MemoryKv;
use crate::shard::set::ShardSet;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn test_service() -> Arc<DataService> {
    let config = Arc::new(Config::default());
    let router = Arc::new(Router::new(100, Arc::new(LocalityScorer::new())));
    let manager = ShardManager::new(Arc::new(MemoryKv::new()), router.clone());
    manager
        .register_node_with_id("node-local", "http://127.0.0.1:8100", "us-east", 100)
        .unwrap();
    let shards = Arc::new(ShardSet::new(config.clone()));
    DataService::new("node-local", router, shards, manager, config)
}

fn empty_service() -> Arc<DataService> {
    let config = Arc::new(Config::default());
    let router = Arc::new(Router::new(100, Arc::new(LocalityScorer::new())));
    let manager = ShardManager::new(Arc::new(MemoryKv::new()), router.clone());
    let shards = Arc::new(ShardSet::new(config.clone()));
    DataService::new("node-local", router, shards, manager, config)
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn filter(field: &str, operator: &str, value: Value) -> RawFilter {
    RawFilter {
        field: Some(field.to_string()),
        operator: Some(operator.to_string()),
        value: Some(value),
    }
}

// ============================================================
// DOCUMENT LIFECYCLE THROUGH THE ROUTED SERVICE
// ============================================================

#[tokio::test]
async fn create_update_delete_lifecycle() {
    let service = test_service();

    let (doc, created) = service
        .put_document("users", "u1", payload(json!({"name": "Alice"})), None)
        .await
        .unwrap();
    assert!(created);
    assert_eq!(doc.version, 1);
    let t0 = doc.created_at;

    let (doc, created) = service
        .put_document("users", "u1", payload(json!({"name": "Alice2"})), None)
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(doc.version, 2);
    assert_eq!(doc.created_at, t0);
    assert!(doc.updated_at >= t0);

    let fetched = service.get_document("users", "u1", None).await.unwrap();
    assert_eq!(fetched.payload["name"], "Alice2");

    service.delete_document("users", "u1", None).await.unwrap();
    assert!(matches!(
        service.get_document("users", "u1", None).await,
        Err(DocError::DocumentNotFound { .. })
    ));
}

#[tokio::test]
async fn routing_is_stable_across_operations() {
    let service = test_service();
    // Write through the service, then read back through it; the same shard
    // must serve both sides.
    for i in 0..20 {
        let id = format!("doc-{i}");
        service
            .put_document("items", &id, payload(json!({"i": i})), None)
            .await
            .unwrap();
    }
    for i in 0..20 {
        let id = format!("doc-{i}");
        let doc = service.get_document("items", &id, None).await.unwrap();
        assert_eq!(doc.payload["i"], json!(i));
    }
}

#[tokio::test]
async fn writes_with_no_nodes_fail() {
    let service = empty_service();
    assert!(matches!(
        service
            .put_document("users", "u1", Map::new(), None)
            .await,
        Err(DocError::EmptyRing)
    ));
}

// ============================================================
// QUERIES THROUGH THE FULL PIPELINE
// ============================================================

async fn seed_people(service: &Arc<DataService>) {
    for (id, age, dept) in [
        ("p1", 25, "Eng"),
        ("p2", 30, "Eng"),
        ("p3", 35, "Eng"),
        ("p4", 40, "Mkt"),
        ("p5", 45, "Mkt"),
    ] {
        service
            .put_document(
                "people",
                id,
                payload(json!({"age": age, "department": dept})),
                None,
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn filtered_sorted_query_merges_across_shards() {
    let service = test_service();
    seed_people(&service).await;

    let request = QueryRequest {
        filters: vec![filter("age", ">", json!(21))],
        projection: None,
        options: Some(RawOptions {
            limit: Some(10),
            offset: Some(0),
            sort: vec![RawSort {
                field: Some("age".into()),
                direction: Some("desc".into()),
            }],
        }),
        aggregations: vec![],
    };
    let response = service.query("people", &request).await.unwrap();

    assert_eq!(response.metadata.total, 5);
    assert_eq!(response.metadata.limit, Some(10));
    assert_eq!(response.metadata.offset, 0);
    let ages: Vec<i64> = response
        .results
        .iter()
        .map(|row| row["age"].as_i64().unwrap())
        .collect();
    assert_eq!(ages, vec![45, 40, 35, 30, 25]);
}

#[tokio::test]
async fn limit_zero_keeps_total() {
    let service = test_service();
    seed_people(&service).await;

    let request = QueryRequest {
        filters: vec![],
        projection: None,
        options: Some(RawOptions {
            limit: Some(0),
            offset: None,
            sort: vec![],
        }),
        aggregations: vec![],
    };
    let response = service.query("people", &request).await.unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.metadata.total, 5);
}

#[tokio::test]
async fn query_with_no_shards_is_empty() {
    let service = empty_service();
    let response = service
        .query("people", &QueryRequest::default())
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.metadata.total, 0);
}

#[tokio::test]
async fn aggregations_ride_along_with_queries() {
    let service = test_service();
    seed_people(&service).await;

    let request = QueryRequest {
        filters: vec![],
        projection: None,
        options: None,
        aggregations: vec![
            RawAggregation {
                agg_type: Some("COUNT".into()),
                field: None,
                fields: vec![],
            },
            RawAggregation {
                agg_type: Some("AVG".into()),
                field: Some("age".into()),
                fields: vec![],
            },
            RawAggregation {
                agg_type: Some("GROUP_BY".into()),
                field: None,
                fields: vec!["department".into()],
            },
        ],
    };
    let response = service.query("people", &request).await.unwrap();
    let aggregations = response.aggregations.unwrap();

    assert_eq!(aggregations[0].value, json!(5));
    assert_eq!(aggregations[1].value, json!(35.0));
    assert_eq!(aggregations[2].value, json!(2));
    let groups = aggregations[2].groups.as_ref().unwrap();
    assert_eq!(groups["Eng"]["count"], json!(3));
    assert_eq!(groups["Mkt"]["count"], json!(2));
}

#[tokio::test]
async fn projection_narrows_query_rows() {
    let service = test_service();
    service
        .put_document(
            "people",
            "n1",
            payload(json!({"name": "Ada", "profile": {"city": "London", "age": 36}})),
            None,
        )
        .await
        .unwrap();

    let request = QueryRequest {
        filters: vec![],
        projection: Some(vec!["profile.city".into()]),
        options: None,
        aggregations: vec![],
    };
    let response = service.query("people", &request).await.unwrap();
    let row = &response.results[0];
    assert_eq!(row["_id"], "n1");
    assert_eq!(row["profile"]["city"], "London");
    assert!(row.get("name").is_none());
    assert!(row["profile"].get("age").is_none());
}

// ============================================================
// FORWARDED-WRITE IDEMPOTENCY
// ============================================================

#[tokio::test]
async fn forwarded_put_replays_do_not_double_apply() {
    let service = test_service();
    let decision = service.router().route("users", "u1", None).unwrap();

    let request = InternalPutRequest {
        shard_id: decision.shard_id,
        collection: "users".into(),
        id: "u1".into(),
        op_id: "op-1".into(),
        payload: payload(json!({"name": "Alice"})),
    };

    let (doc, created) = service.apply_forwarded_put(&request).unwrap();
    assert!(created);
    assert_eq!(doc.version, 1);

    // Same op id again: no new version.
    let (doc, created) = service.apply_forwarded_put(&request).unwrap();
    assert!(!created);
    assert_eq!(doc.version, 1);

    // A fresh op id is a genuine second write.
    let mut second = request.clone();
    second.op_id = "op-2".into();
    let (doc, _) = service.apply_forwarded_put(&second).unwrap();
    assert_eq!(doc.version, 2);
}
