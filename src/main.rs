use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{get, post};
use axum::Router;
use docshard::api::client::HttpClient;
use docshard::api::handlers::{
    handle_delete_document, handle_get_document, handle_health, handle_internal_delete,
    handle_internal_get, handle_internal_put, handle_internal_query, handle_internal_txn_abort,
    handle_internal_txn_commit, handle_internal_txn_prepare, handle_put_document, handle_query,
    handle_routing_table_update,
};
use docshard::api::protocol::{
    ENDPOINT_INTERNAL_DELETE, ENDPOINT_INTERNAL_GET, ENDPOINT_INTERNAL_PUT,
    ENDPOINT_INTERNAL_QUERY, ENDPOINT_INTERNAL_ROUTING_TABLE, ENDPOINT_INTERNAL_TXN_ABORT,
    ENDPOINT_INTERNAL_TXN_COMMIT, ENDPOINT_INTERNAL_TXN_PREPARE,
};
use docshard::api::service::{DataService, RoutedParticipants};
use docshard::config::Config;
use docshard::manager::handlers::{
    handle_create_shard, handle_get_node, handle_get_shard, handle_heartbeat, handle_list_nodes,
    handle_list_shards, handle_lookup, handle_register_node, handle_update_shard,
};
use docshard::manager::protocol::HeartbeatRequest;
use docshard::manager::service::ShardManager;
use docshard::routing::locality::{LocalityScorer, NodeMetrics};
use docshard::routing::router::Router as ShardRouter;
use docshard::shard::kv::MemoryKv;
use docshard::shard::set::ShardSet;
use docshard::txn::coordinator::TxnCoordinator;
use docshard::txn::handlers::{
    handle_abort_transaction, handle_begin_transaction, handle_commit_transaction,
    handle_get_transaction, handle_notify_aborted, handle_notify_committed,
    handle_notify_prepared, handle_prepare_transaction,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut bind_addr: SocketAddr = "127.0.0.1:8100".parse()?;
    let mut node_id: Option<String> = None;
    let mut region = "us-east".to_string();
    let mut public_url: Option<String> = None;
    let mut peers: Vec<String> = vec![];

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = args[i + 1].parse()?;
                i += 2;
            }
            "--node-id" => {
                node_id = Some(args[i + 1].clone());
                i += 2;
            }
            "--region" => {
                region = args[i + 1].clone();
                i += 2;
            }
            "--url" => {
                public_url = Some(args[i + 1].clone());
                i += 2;
            }
            "--peer" => {
                peers.push(args[i + 1].trim_end_matches('/').to_string());
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!(
                    "Usage: {} [--bind addr:port] [--node-id id] [--region name] \
                     [--url http://public-addr] [--peer http://other-node]...",
                    args[0]
                );
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    let node_id = node_id.unwrap_or_else(|| {
        format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
    });
    let public_url = public_url.unwrap_or_else(|| format!("http://{bind_addr}"));

    let config = Arc::new(Config::from_env());
    tracing::info!("Starting node {} on {} ({})", node_id, bind_addr, region);

    // 1. Routing: locality scorer + hash ring + routing table.
    let scorer = Arc::new(LocalityScorer::new());
    let router = Arc::new(ShardRouter::new(config.virtual_nodes_per_physical, scorer));

    // 2. Control plane: shard manager with its durable registry.
    let manager = ShardManager::new(Arc::new(MemoryKv::new()), router.clone());
    manager.recover()?;
    manager.register_node_with_id(&node_id, &public_url, &region, 100)?;

    // 3. Data plane: local shards + routed document service.
    let shards = Arc::new(ShardSet::new(config.clone()));
    let data = DataService::new(
        node_id.clone(),
        router.clone(),
        shards.clone(),
        manager.clone(),
        config.clone(),
    );

    // 4. Transactions: coordinator over a durable log, participants routed
    //    the same way documents are.
    let participants =
        RoutedParticipants::new(node_id.clone(), shards.clone(), manager.clone(), &config);
    let coordinator = TxnCoordinator::new(
        Arc::new(MemoryKv::new()),
        participants,
        router.clone(),
        config.transaction_timeout_ms,
    );
    coordinator.recover().await?;

    // 5. HTTP surface.
    let app = Router::new()
        .route("/health", get(handle_health))
        // Document data plane
        .route("/api/data/:collection", post(handle_query))
        .route(
            "/api/data/:collection/:id",
            get(handle_get_document)
                .put(handle_put_document)
                .delete(handle_delete_document),
        )
        // Transactions
        .route("/transactions", post(handle_begin_transaction))
        .route("/transactions/:id", get(handle_get_transaction))
        .route("/transactions/:id/prepare", post(handle_prepare_transaction))
        .route("/transactions/:id/commit", post(handle_commit_transaction))
        .route("/transactions/:id/abort", post(handle_abort_transaction))
        .route("/transactions/:id/prepared", post(handle_notify_prepared))
        .route("/transactions/:id/committed", post(handle_notify_committed))
        .route("/transactions/:id/aborted", post(handle_notify_aborted))
        // Shard manager
        .route("/shards", get(handle_list_shards).post(handle_create_shard))
        .route("/shards/:id", get(handle_get_shard).put(handle_update_shard))
        .route("/nodes", get(handle_list_nodes).post(handle_register_node))
        .route("/nodes/:id", get(handle_get_node))
        .route("/nodes/:id/heartbeat", post(handle_heartbeat))
        .route("/lookup/:collection/:id", get(handle_lookup))
        // Internal node-to-node endpoints
        .route(ENDPOINT_INTERNAL_GET, post(handle_internal_get))
        .route(ENDPOINT_INTERNAL_PUT, post(handle_internal_put))
        .route(ENDPOINT_INTERNAL_DELETE, post(handle_internal_delete))
        .route(ENDPOINT_INTERNAL_QUERY, post(handle_internal_query))
        .route(ENDPOINT_INTERNAL_TXN_PREPARE, post(handle_internal_txn_prepare))
        .route(ENDPOINT_INTERNAL_TXN_COMMIT, post(handle_internal_txn_commit))
        .route(ENDPOINT_INTERNAL_TXN_ABORT, post(handle_internal_txn_abort))
        .route(
            ENDPOINT_INTERNAL_ROUTING_TABLE,
            post(handle_routing_table_update),
        )
        .layer(DefaultBodyLimit::max(config.max_doc_bytes * 4))
        .layer(Extension(config.clone()))
        .layer(Extension(data.clone()))
        .layer(Extension(coordinator.clone()))
        .layer(Extension(manager.clone()))
        .layer(Extension(router.clone()));

    // 6. Join peers: register this node with each and keep heartbeating.
    if !peers.is_empty() {
        let client = HttpClient::new(&config);
        let join_node = node_id.clone();
        let join_url = public_url.clone();
        let join_region = region.clone();
        let join_peers = peers.clone();
        let join_client = client.clone();
        tokio::spawn(async move {
            for peer in &join_peers {
                let body = serde_json::json!({
                    "id": join_node,
                    "url": join_url,
                    "region": join_region,
                    "capacity": 100,
                });
                match join_client
                    .post_json::<_, serde_json::Value>(&format!("{peer}/nodes"), &body)
                    .await
                {
                    Ok(_) => tracing::info!("Registered with peer {}", peer),
                    Err(e) => tracing::warn!("Failed to register with peer {}: {}", peer, e),
                }
            }
        });

        let beat_node = node_id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                for peer in &peers {
                    let url = format!("{peer}/nodes/{beat_node}/heartbeat");
                    if let Err(e) = client
                        .post_json::<_, serde_json::Value>(&url, &HeartbeatRequest::default())
                        .await
                    {
                        tracing::debug!("Heartbeat to {} failed: {}", peer, e);
                    }
                }
            }
        });
    }

    // 7. Background maintenance loops.
    let monitor = manager.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let expired = monitor.check_heartbeats();
            if !expired.is_empty() {
                tracing::warn!("Nodes went offline: {:?}", expired);
            }
        }
    });

    let self_beat = manager.clone();
    let beat_id = node_id.clone();
    tokio::spawn(async move {
        let mut sys = sysinfo::System::new();
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            sys.refresh_cpu_usage();
            let load_factor = f64::from(sys.global_cpu_usage() / 100.0).clamp(0.0, 1.0);
            let metrics = NodeMetrics {
                latency_ms: 0.0,
                load_factor,
                availability: 1.0,
            };
            if let Err(e) = self_beat.heartbeat(&beat_id, None, Some(metrics), None) {
                tracing::warn!("Self heartbeat failed: {}", e);
            }
        }
    });

    let sweeper = shards.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let swept = sweeper.sweep_expired();
            if swept > 0 {
                tracing::warn!("Auto-aborted {} expired staged transaction(s)", swept);
            }
        }
    });

    let redriver = coordinator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(2));
        loop {
            interval.tick().await;
            redriver.drive_stuck().await;
        }
    });

    let stats_manager = manager.clone();
    let stats_shards = shards.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            tracing::info!(
                "Cluster stats: {} node(s), {} managed shard(s), {} local shard(s)",
                stats_manager.list_nodes().len(),
                stats_manager.list_shards().len(),
                stats_shards.len()
            );
        }
    });

    // 8. Serve.
    tracing::info!("HTTP server listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
