//! Public and internal HTTP handlers for the data plane.
//!
//! Public: `/health` and the `/api/data/*` document surface. Internal: the
//! `/internal/*` endpoints other nodes call for forwarded operations, remote
//! shard queries, participant phase calls and routing-table propagation.
//! Handlers translate HTTP into `DataService`/`ShardSet` calls; `DocError`'s
//! `IntoResponse` renders the error envelope.

use super::protocol::*;
use super::service::DataService;
use crate::config::Config;
use crate::error::DocError;
use crate::routing::router::Router;
use crate::routing::table::RoutingTable;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::Value;
use std::sync::Arc;

const CLIENT_ID_HEADER: &str = "x-client-id";
const CLIENT_REGION_HEADER: &str = "x-client-region";

fn client_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// A client announcing its region gets registered for locality biasing.
fn register_client_if_announced(data: &DataService, headers: &HeaderMap) {
    if let (Some(client), Some(region)) = (
        client_id(headers),
        headers
            .get(CLIENT_REGION_HEADER)
            .and_then(|value| value.to_str().ok()),
    ) {
        data.register_client(&client, region);
    }
}

pub async fn handle_health(
    Extension(config): Extension<Arc<Config>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: config.environment.clone(),
        features: vec![
            "routing".to_string(),
            "queries".to_string(),
            "aggregations".to_string(),
            "transactions".to_string(),
        ],
    })
}

// ------------------------------------------------------------
// Public document surface
// ------------------------------------------------------------

pub async fn handle_get_document(
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    Extension(data): Extension<Arc<DataService>>,
) -> Result<Json<Value>, DocError> {
    register_client_if_announced(&data, &headers);
    let doc = data
        .get_document(&collection, &id, client_id(&headers).as_deref())
        .await?;
    Ok(Json(doc.to_value()))
}

pub async fn handle_put_document(
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    Extension(data): Extension<Arc<DataService>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), DocError> {
    register_client_if_announced(&data, &headers);
    let Value::Object(payload) = body else {
        return Err(DocError::InvalidDocument("payload must be an object".into()));
    };
    let (doc, created) = data
        .put_document(&collection, &id, payload, client_id(&headers).as_deref())
        .await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(doc.to_value())))
}

pub async fn handle_delete_document(
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    Extension(data): Extension<Arc<DataService>>,
) -> Result<Json<DeleteResponse>, DocError> {
    data.delete_document(&collection, &id, client_id(&headers).as_deref())
        .await?;
    Ok(Json(DeleteResponse {
        deleted: true,
        id,
        collection,
    }))
}

pub async fn handle_query(
    Path(collection): Path<String>,
    headers: HeaderMap,
    Extension(data): Extension<Arc<DataService>>,
    Json(request): Json<crate::query::parser::QueryRequest>,
) -> Result<Json<QueryResponse>, DocError> {
    register_client_if_announced(&data, &headers);
    let response = data.query(&collection, &request).await?;
    Ok(Json(response))
}

// ------------------------------------------------------------
// Internal node-to-node surface
// ------------------------------------------------------------

pub async fn handle_internal_get(
    Extension(data): Extension<Arc<DataService>>,
    Json(request): Json<InternalGetRequest>,
) -> Result<Json<Value>, DocError> {
    let doc = data
        .shards()
        .get_or_create(&request.shard_id)
        .get(&request.collection, &request.id)?;
    Ok(Json(doc.to_value()))
}

pub async fn handle_internal_put(
    Extension(data): Extension<Arc<DataService>>,
    Json(request): Json<InternalPutRequest>,
) -> Result<Json<InternalPutResponse>, DocError> {
    let (doc, created) = data.apply_forwarded_put(&request)?;
    Ok(Json(InternalPutResponse {
        document: doc.to_value(),
        created,
    }))
}

pub async fn handle_internal_delete(
    Extension(data): Extension<Arc<DataService>>,
    Json(request): Json<InternalDeleteRequest>,
) -> Result<Json<Ack>, DocError> {
    data.apply_forwarded_delete(&request)?;
    Ok(Json(Ack::ok()))
}

pub async fn handle_internal_query(
    Extension(data): Extension<Arc<DataService>>,
    Json(request): Json<InternalQueryRequest>,
) -> Result<Json<crate::query::executor::ShardPage>, DocError> {
    let page = data.fetch_local(&request.collection, &request.target)?;
    Ok(Json(page))
}

pub async fn handle_internal_txn_prepare(
    Extension(data): Extension<Arc<DataService>>,
    Json(request): Json<TxnPrepareRequest>,
) -> Result<Json<Ack>, DocError> {
    data.shards()
        .get_or_create(&request.shard_id)
        .prepare(&request.tx_id, &request.ops, request.expires_at)?;
    Ok(Json(Ack::ok()))
}

pub async fn handle_internal_txn_commit(
    Extension(data): Extension<Arc<DataService>>,
    Json(request): Json<TxnPhaseRequest>,
) -> Result<Json<Ack>, DocError> {
    data.shards()
        .get_or_create(&request.shard_id)
        .commit(&request.tx_id)?;
    Ok(Json(Ack::ok()))
}

pub async fn handle_internal_txn_abort(
    Extension(data): Extension<Arc<DataService>>,
    Json(request): Json<TxnPhaseRequest>,
) -> Result<Json<Ack>, DocError> {
    data.shards()
        .get_or_create(&request.shard_id)
        .abort(&request.tx_id)?;
    Ok(Json(Ack::ok()))
}

pub async fn handle_routing_table_update(
    Extension(router): Extension<Arc<Router>>,
    Json(table): Json<RoutingTable>,
) -> Json<TableAdoption> {
    let adopted = router.update_table(table);
    Json(TableAdoption {
        adopted,
        version: router.table().version,
    })
}
