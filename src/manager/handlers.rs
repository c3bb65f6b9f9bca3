//! HTTP handlers for the shard-manager surface (`/shards`, `/nodes`,
//! `/lookup`).

use super::protocol::{HeartbeatRequest, LookupResponse, RegisterNodeRequest};
use super::service::{CreateShardRequest, ShardManager, UpdateShardRequest};
use super::types::{NodeRecord, ShardRecord};
use crate::error::DocError;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

pub async fn handle_list_shards(
    Extension(manager): Extension<Arc<ShardManager>>,
) -> Json<Vec<ShardRecord>> {
    Json(manager.list_shards())
}

pub async fn handle_create_shard(
    Extension(manager): Extension<Arc<ShardManager>>,
    Json(request): Json<CreateShardRequest>,
) -> Result<(StatusCode, Json<ShardRecord>), DocError> {
    let record = manager.create_shard(&request)?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn handle_get_shard(
    Path(shard_id): Path<String>,
    Extension(manager): Extension<Arc<ShardManager>>,
) -> Result<Json<ShardRecord>, DocError> {
    Ok(Json(manager.get_shard(&shard_id)?))
}

pub async fn handle_update_shard(
    Path(shard_id): Path<String>,
    Extension(manager): Extension<Arc<ShardManager>>,
    Json(request): Json<UpdateShardRequest>,
) -> Result<Json<ShardRecord>, DocError> {
    Ok(Json(manager.update_shard(&shard_id, &request)?))
}

pub async fn handle_list_nodes(
    Extension(manager): Extension<Arc<ShardManager>>,
) -> Json<Vec<NodeRecord>> {
    Json(manager.list_nodes())
}

pub async fn handle_register_node(
    Extension(manager): Extension<Arc<ShardManager>>,
    Json(request): Json<RegisterNodeRequest>,
) -> Result<(StatusCode, Json<NodeRecord>), DocError> {
    let capacity = request.capacity.unwrap_or(100);
    let record = match &request.id {
        Some(id) => {
            manager.register_node_with_id(id, &request.url, &request.region, capacity)?
        }
        None => manager.register_node(&request.url, &request.region, capacity)?,
    };
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn handle_get_node(
    Path(node_id): Path<String>,
    Extension(manager): Extension<Arc<ShardManager>>,
) -> Result<Json<NodeRecord>, DocError> {
    Ok(Json(manager.get_node(&node_id)?))
}

pub async fn handle_heartbeat(
    Path(node_id): Path<String>,
    Extension(manager): Extension<Arc<ShardManager>>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<NodeRecord>, DocError> {
    let record = manager.heartbeat(&node_id, request.status, request.metrics, request.capacity)?;
    Ok(Json(record))
}

pub async fn handle_lookup(
    Path((collection, document_id)): Path<(String, String)>,
    Extension(manager): Extension<Arc<ShardManager>>,
) -> Result<Json<LookupResponse>, DocError> {
    let decision = manager.lookup_shard(&collection, &document_id)?;
    Ok(Json(LookupResponse {
        shard_id: decision.shard_id,
        node_id: decision.node_id,
    }))
}
