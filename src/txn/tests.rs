use super::coordinator::{ParticipantClient, TxnCoordinator};
use super::types::{OpType, Operation, TxStatus};
use crate::config::Config;
use crate::error::{DocError, Result};
use crate::routing::locality::LocalityScorer;
use crate::routing::router::Router;
use crate::shard::kv::MemoryKv;
use crate::shard::set::ShardSet;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn write_op(collection: &str, id: &str, data: Value) -> Operation {
    let Value::Object(map) = data else {
        panic!("expected object");
    };
    Operation {
        op_type: OpType::Write,
        collection: collection.to_string(),
        document_id: id.to_string(),
        data: Some(map),
    }
}

fn test_router() -> Arc<Router> {
    let router = Arc::new(Router::new(100, Arc::new(LocalityScorer::new())));
    router.add_node("node-local");
    router
}

/// Participant transport backed by real local shard stores, with optional
/// failure injection.
struct LocalParticipants {
    shards: ShardSet,
    veto_collection: Option<String>,
    fail_commits: AtomicBool,
}

impl LocalParticipants {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            shards: ShardSet::new(Arc::new(Config::default())),
            veto_collection: None,
            fail_commits: AtomicBool::new(false),
        })
    }

    fn vetoing(collection: &str) -> Arc<Self> {
        Arc::new(Self {
            shards: ShardSet::new(Arc::new(Config::default())),
            veto_collection: Some(collection.to_string()),
            fail_commits: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ParticipantClient for LocalParticipants {
    async fn prepare(
        &self,
        _node_id: &str,
        shard_id: &str,
        tx_id: &str,
        ops: &[Operation],
        expires_at: u64,
    ) -> Result<()> {
        if let Some(veto) = &self.veto_collection {
            if ops.iter().any(|op| &op.collection == veto) {
                return Err(DocError::TransactionConflict(format!(
                    "shard {shard_id} votes abort"
                )));
            }
        }
        self.shards
            .get_or_create(shard_id)
            .prepare(tx_id, ops, expires_at)
    }

    async fn commit(&self, _node_id: &str, shard_id: &str, tx_id: &str) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(DocError::Network("commit dropped".into()));
        }
        self.shards.get_or_create(shard_id).commit(tx_id)
    }

    async fn abort(&self, _node_id: &str, shard_id: &str, tx_id: &str) -> Result<()> {
        self.shards.get_or_create(shard_id).abort(tx_id)
    }
}

fn sample_ops() -> Vec<Operation> {
    vec![
        write_op("users", "u1", json!({"name": "Alice"})),
        write_op("orders", "o1", json!({"total": 9})),
    ]
}

async fn wait_for_status(
    coordinator: &Arc<TxnCoordinator>,
    tx_id: &str,
    expected: TxStatus,
) -> bool {
    for _ in 0..100 {
        if coordinator.get(tx_id).map(|r| r.status) == Ok(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn happy_path_prepares_and_commits() {
    let participants = LocalParticipants::new();
    let coordinator = TxnCoordinator::new(
        Arc::new(MemoryKv::new()),
        participants.clone(),
        test_router(),
        10_000,
    );

    let record = coordinator.begin(sample_ops(), None).unwrap();
    assert_eq!(record.status, TxStatus::Pending);
    assert_eq!(record.participants.len(), 2);
    assert!(record.expires_at > record.started_at);

    let record = coordinator.prepare(&record.tx_id).await.unwrap();
    assert_eq!(record.status, TxStatus::Prepared);
    assert!(record.prepared_at.is_some());

    let record = coordinator.commit(&record.tx_id).await.unwrap();
    assert_eq!(record.status, TxStatus::Committed);

    // The participants applied the writes.
    let users_shard = test_router()
        .route("users", "u1", None)
        .unwrap()
        .shard_id;
    let doc = participants
        .shards
        .get(&users_shard)
        .unwrap()
        .get("users", "u1")
        .unwrap();
    assert_eq!(doc.version, 1);
    assert_eq!(doc.payload["name"], "Alice");
}

#[tokio::test]
async fn prepare_veto_aborts_everywhere() {
    let participants = LocalParticipants::vetoing("orders");
    let coordinator = TxnCoordinator::new(
        Arc::new(MemoryKv::new()),
        participants.clone(),
        test_router(),
        10_000,
    );

    let record = coordinator.begin(sample_ops(), None).unwrap();
    let record = coordinator.prepare(&record.tx_id).await.unwrap();
    assert_eq!(record.status, TxStatus::Aborted);
    assert!(record.error.is_some());

    // Nothing was written on either participant.
    let users_shard = test_router()
        .route("users", "u1", None)
        .unwrap()
        .shard_id;
    if let Some(shard) = participants.shards.get(&users_shard) {
        assert!(matches!(
            shard.get("users", "u1"),
            Err(DocError::DocumentNotFound { .. })
        ));
        assert_eq!(shard.lock_count(), 0);
    }
}

#[tokio::test]
async fn commit_from_pending_is_rejected() {
    let coordinator = TxnCoordinator::new(
        Arc::new(MemoryKv::new()),
        LocalParticipants::new(),
        test_router(),
        10_000,
    );
    let record = coordinator.begin(sample_ops(), None).unwrap();
    assert!(matches!(
        coordinator.commit(&record.tx_id).await,
        Err(DocError::TransactionConflict(_))
    ));
}

#[tokio::test]
async fn no_transition_out_of_committed() {
    let coordinator = TxnCoordinator::new(
        Arc::new(MemoryKv::new()),
        LocalParticipants::new(),
        test_router(),
        10_000,
    );
    let record = coordinator.begin(sample_ops(), None).unwrap();
    coordinator.prepare(&record.tx_id).await.unwrap();
    coordinator.commit(&record.tx_id).await.unwrap();

    assert!(matches!(
        coordinator.abort(&record.tx_id).await,
        Err(DocError::TransactionConflict(_))
    ));
    // A repeated commit is a no-op on a terminal transaction.
    let record = coordinator.commit(&record.tx_id).await.unwrap();
    assert_eq!(record.status, TxStatus::Committed);
}

#[tokio::test]
async fn expired_transaction_aborts_itself() {
    let coordinator = TxnCoordinator::new(
        Arc::new(MemoryKv::new()),
        LocalParticipants::new(),
        test_router(),
        10_000,
    );
    let record = coordinator.begin(sample_ops(), Some(50)).unwrap();

    assert!(wait_for_status(&coordinator, &record.tx_id, TxStatus::Aborted).await);
    let record = coordinator.get(&record.tx_id).unwrap();
    assert_eq!(record.error.as_deref(), Some("transaction timed out"));
}

#[tokio::test]
async fn begin_rejects_invalid_operations() {
    let coordinator = TxnCoordinator::new(
        Arc::new(MemoryKv::new()),
        LocalParticipants::new(),
        test_router(),
        10_000,
    );

    assert!(matches!(
        coordinator.begin(vec![], None),
        Err(DocError::InvalidRequest(_))
    ));

    let mut op = write_op("users", "u1", json!({}));
    op.data = None;
    assert!(matches!(
        coordinator.begin(vec![op], None),
        Err(DocError::InvalidDocument(_))
    ));

    let bad = Operation {
        op_type: OpType::Write,
        collection: "__system".into(),
        document_id: "u1".into(),
        data: Some(Map::new()),
    };
    assert!(matches!(
        coordinator.begin(vec![bad], None),
        Err(DocError::InvalidDocument(_))
    ));
}

#[tokio::test]
async fn duplicate_notifications_are_idempotent() {
    let coordinator = TxnCoordinator::new(
        Arc::new(MemoryKv::new()),
        LocalParticipants::new(),
        test_router(),
        10_000,
    );
    let record = coordinator.begin(sample_ops(), None).unwrap();
    let record = coordinator.prepare(&record.tx_id).await.unwrap();
    assert_eq!(record.status, TxStatus::Prepared);

    // Late prepared acks after the phase completed change nothing.
    let shard = record.participants[0].clone();
    let after = coordinator.note_prepared(&record.tx_id, &shard).unwrap();
    assert_eq!(after.status, TxStatus::Prepared);

    // Acks from strangers are ignored.
    let after = coordinator
        .note_committed(&record.tx_id, "shard-bogus")
        .unwrap();
    assert_eq!(after.status, TxStatus::Prepared);
}

#[tokio::test]
async fn restart_during_committing_reaches_committed() {
    let log: Arc<MemoryKv> = Arc::new(MemoryKv::new());
    let participants = LocalParticipants::new();

    let tx_id = {
        let coordinator = TxnCoordinator::new(
            log.clone(),
            participants.clone(),
            test_router(),
            60_000,
        );
        let record = coordinator.begin(sample_ops(), None).unwrap();
        coordinator.prepare(&record.tx_id).await.unwrap();

        // Commit dispatch fails: the transaction sticks in COMMITTING.
        participants.fail_commits.store(true, Ordering::SeqCst);
        let record = coordinator.commit(&record.tx_id).await.unwrap();
        assert_eq!(record.status, TxStatus::Committing);
        record.tx_id
    };

    // "Restart": a fresh coordinator over the same durable log, with the
    // participant transport healthy again.
    participants.fail_commits.store(false, Ordering::SeqCst);
    let recovered = TxnCoordinator::new(log, participants.clone(), test_router(), 60_000);
    let resumed = recovered.recover().await.unwrap();
    assert_eq!(resumed, 1);

    assert!(wait_for_status(&recovered, &tx_id, TxStatus::Committed).await);

    let users_shard = test_router()
        .route("users", "u1", None)
        .unwrap()
        .shard_id;
    let doc = participants
        .shards
        .get(&users_shard)
        .unwrap()
        .get("users", "u1")
        .unwrap();
    assert_eq!(doc.payload["name"], "Alice");
}

#[tokio::test]
async fn restart_during_preparing_finishes_the_prepare() {
    let log: Arc<MemoryKv> = Arc::new(MemoryKv::new());
    let participants = LocalParticipants::new();

    // Simulate a coordinator that persisted PREPARING and crashed before any
    // dispatch: seed the log directly.
    let tx_id = {
        let coordinator = TxnCoordinator::new(
            log.clone(),
            participants.clone(),
            test_router(),
            60_000,
        );
        let record = coordinator.begin(sample_ops(), None).unwrap();
        record.tx_id
    };
    {
        use crate::shard::kv::KvStore;
        let raw = log.get(&format!("tx:{tx_id}")).unwrap();
        let patched = raw.replace("\"PENDING\"", "\"PREPARING\"");
        log.put(&format!("tx:{tx_id}"), patched);
    }

    let recovered = TxnCoordinator::new(log, participants.clone(), test_router(), 60_000);
    recovered.recover().await.unwrap();

    assert!(wait_for_status(&recovered, &tx_id, TxStatus::Prepared).await);
}
