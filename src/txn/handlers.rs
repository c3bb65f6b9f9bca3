//! HTTP handlers for the transaction surface.
//!
//! Lifecycle endpoints drive the coordinator synchronously; the callback
//! endpoints are the async path participants use to report phase completion.
//! Both funnel into the same guarded state transitions, so duplicates and
//! replays are harmless.

use super::coordinator::TxnCoordinator;
use super::protocol::{BeginTransactionRequest, ParticipantNotification, TransactionSummary};
use crate::error::DocError;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

pub async fn handle_begin_transaction(
    Extension(coordinator): Extension<Arc<TxnCoordinator>>,
    Json(request): Json<BeginTransactionRequest>,
) -> Result<(StatusCode, Json<TransactionSummary>), DocError> {
    let record = coordinator.begin(request.operations, request.timeout_ms)?;
    Ok((StatusCode::CREATED, Json(TransactionSummary::from(&record))))
}

pub async fn handle_get_transaction(
    Path(tx_id): Path<String>,
    Extension(coordinator): Extension<Arc<TxnCoordinator>>,
) -> Result<Json<TransactionSummary>, DocError> {
    let record = coordinator.get(&tx_id)?;
    Ok(Json(TransactionSummary::from(&record)))
}

pub async fn handle_prepare_transaction(
    Path(tx_id): Path<String>,
    Extension(coordinator): Extension<Arc<TxnCoordinator>>,
) -> Result<Json<TransactionSummary>, DocError> {
    let record = coordinator.prepare(&tx_id).await?;
    Ok(Json(TransactionSummary::from(&record)))
}

pub async fn handle_commit_transaction(
    Path(tx_id): Path<String>,
    Extension(coordinator): Extension<Arc<TxnCoordinator>>,
) -> Result<Json<TransactionSummary>, DocError> {
    let record = coordinator.commit(&tx_id).await?;
    Ok(Json(TransactionSummary::from(&record)))
}

pub async fn handle_abort_transaction(
    Path(tx_id): Path<String>,
    Extension(coordinator): Extension<Arc<TxnCoordinator>>,
) -> Result<Json<TransactionSummary>, DocError> {
    let record = coordinator.abort(&tx_id).await?;
    Ok(Json(TransactionSummary::from(&record)))
}

pub async fn handle_notify_prepared(
    Path(tx_id): Path<String>,
    Extension(coordinator): Extension<Arc<TxnCoordinator>>,
    Json(notification): Json<ParticipantNotification>,
) -> Result<Json<TransactionSummary>, DocError> {
    let record = coordinator.note_prepared(&tx_id, &notification.shard_id)?;
    Ok(Json(TransactionSummary::from(&record)))
}

pub async fn handle_notify_committed(
    Path(tx_id): Path<String>,
    Extension(coordinator): Extension<Arc<TxnCoordinator>>,
    Json(notification): Json<ParticipantNotification>,
) -> Result<Json<TransactionSummary>, DocError> {
    let record = coordinator.note_committed(&tx_id, &notification.shard_id)?;
    Ok(Json(TransactionSummary::from(&record)))
}

pub async fn handle_notify_aborted(
    Path(tx_id): Path<String>,
    Extension(coordinator): Extension<Arc<TxnCoordinator>>,
    Json(notification): Json<ParticipantNotification>,
) -> Result<Json<TransactionSummary>, DocError> {
    let record = coordinator.note_aborted(&tx_id, &notification.shard_id)?;
    Ok(Json(TransactionSummary::from(&record)))
}
