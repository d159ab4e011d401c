//! Transaction start and lookup endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::TransactionId;
use saga::{DistributedTransaction, StartTransaction};
use serde::Serialize;
use state_store::StateStore;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStartedResponse {
    pub transaction_id: TransactionId,
}

/// POST /transactions: start a saga; returns as soon as the first step is dispatched.
#[tracing::instrument(skip(state, request), fields(process_type = %request.process_type))]
pub async fn start<S: StateStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(request): Json<StartTransaction>,
) -> Result<(StatusCode, Json<TransactionStartedResponse>), ApiError> {
    let transaction_id = state.coordinator.start_transaction(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TransactionStartedResponse { transaction_id }),
    ))
}

/// GET /transactions/{id}: current persisted state of a saga.
#[tracing::instrument(skip(state))]
pub async fn get<S: StateStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<DistributedTransaction>, ApiError> {
    let transaction_id: TransactionId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid transaction id: {e}")))?;

    state
        .coordinator
        .get_transaction_state(transaction_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Transaction {transaction_id} not found")))
}
