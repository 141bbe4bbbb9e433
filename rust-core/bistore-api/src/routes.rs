// SPDX-License-Identifier: PMPL-1.0-or-later
//! HTTP routes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use bistore_identity::{CanonicalId, EntityIdMapping, Resolution, StoreIds};
use bistore_registry::{AdminReceipt, ServiceInfo};
use bistore_txn::{
    CommitOutcome, Operation, RecoveryReport, StoreKind, TransactionSummary,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::error::ApiError;
use crate::health::{HealthReport, OutstandingTicket};
use crate::runtime::{pool_service, BiStore};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<BiStore>,
}

impl AppState {
    pub fn new(runtime: Arc<BiStore>) -> Self {
        Self { runtime }
    }
}

/// One write in a transaction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub key: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Supplied by clients that may resubmit the same write.
    pub idempotency_key: Option<String>,
    pub canonical_id: Option<Uuid>,
}

/// Writes for both stores, committed atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionRequest {
    #[serde(default)]
    pub graph: Vec<OperationRequest>,
    #[serde(default)]
    pub relational: Vec<OperationRequest>,
}

impl TransactionRequest {
    fn into_batches(self) -> Result<BTreeMap<StoreKind, Vec<Operation>>, ApiError> {
        if self.graph.is_empty() && self.relational.is_empty() {
            return Err(ApiError::BadRequest(
                "transaction has no operations".to_string(),
            ));
        }
        let mut batches = BTreeMap::new();
        batches.insert(StoreKind::Graph, to_operations(StoreKind::Graph, self.graph)?);
        batches.insert(
            StoreKind::Relational,
            to_operations(StoreKind::Relational, self.relational)?,
        );
        Ok(batches)
    }
}

fn to_operations(
    store: StoreKind,
    requests: Vec<OperationRequest>,
) -> Result<Vec<Operation>, ApiError> {
    requests
        .into_iter()
        .map(|request| {
            if request.key.is_empty() {
                return Err(ApiError::BadRequest(format!("empty key in {store} batch")));
            }
            let payload = serde_json::to_vec(&request.payload)
                .map_err(|e| ApiError::BadRequest(format!("payload: {e}")))?;
            let mut operation = Operation::new(store, request.key, payload);
            if let Some(key) = request.idempotency_key {
                operation = operation.with_idempotency_key(key);
            }
            if let Some(id) = request.canonical_id {
                operation = operation.for_entity(CanonicalId::from_uuid(id));
            }
            Ok(operation)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSizeRequest {
    pub min_size: usize,
    pub max_size: usize,
}

fn parse_store(raw: &str) -> Result<StoreKind, ApiError> {
    StoreKind::BOTH
        .into_iter()
        .find(|store| store.as_str() == raw)
        .ok_or_else(|| ApiError::NotFound(format!("Store {raw} not found")))
}

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/transactions", post(execute_handler))
        .route("/transactions/{id}", get(transaction_handler))
        .route("/recovery", get(recovery_list_handler))
        .route("/recovery/{ticket_id}/replay", post(replay_handler))
        .route("/identity/resolve", post(resolve_identity_handler))
        .route("/identity/{canonical_id}", get(identity_handler))
        .route("/pools/{store}/size", put(resize_pool_handler))
        .route("/services", get(services_handler))
        .with_state(state)
}

/// Health check handler
#[instrument(skip(state))]
async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.runtime.health_report().await)
}

/// Readiness check handler
#[instrument(skip(state))]
async fn ready_handler(State(state): State<AppState>) -> StatusCode {
    if state.runtime.ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[instrument(skip(state))]
async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let body = state.runtime.render_metrics()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

/// Run one transaction across both stores
#[instrument(skip(state, request))]
async fn execute_handler(
    State(state): State<AppState>,
    Json(request): Json<TransactionRequest>,
) -> Result<Json<CommitOutcome>, ApiError> {
    let batches = request.into_batches()?;
    let outcome = state.runtime.coordinator().execute(batches).await?;
    Ok(Json(outcome))
}

#[instrument(skip(state))]
async fn transaction_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransactionSummary>, ApiError> {
    state
        .runtime
        .coordinator()
        .summary(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Transaction {id} not found")))
}

#[instrument(skip(state))]
async fn recovery_list_handler(State(state): State<AppState>) -> Json<Vec<OutstandingTicket>> {
    let tickets = state.runtime.coordinator().open_tickets();
    Json(tickets.iter().map(OutstandingTicket::from).collect())
}

/// Replay the lagging half of a partially committed transaction
#[instrument(skip(state))]
async fn replay_handler(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
) -> Result<Json<RecoveryReport>, ApiError> {
    let report = state.runtime.coordinator().recover(ticket_id).await?;
    Ok(Json(report))
}

#[instrument(skip(state))]
async fn resolve_identity_handler(
    State(state): State<AppState>,
    Json(known): Json<StoreIds>,
) -> Result<Json<Resolution>, ApiError> {
    let resolution = state
        .runtime
        .coordinator()
        .identity()
        .resolve_or_create(&known)?;
    Ok(Json(resolution))
}

#[instrument(skip(state))]
async fn identity_handler(
    State(state): State<AppState>,
    Path(canonical_id): Path<Uuid>,
) -> Result<Json<EntityIdMapping>, ApiError> {
    state
        .runtime
        .coordinator()
        .identity()
        .mapping(CanonicalId::from_uuid(canonical_id))
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Entity {canonical_id} not found")))
}

/// Resize a pool through the service registry's serialized admin path
#[instrument(skip(state))]
async fn resize_pool_handler(
    State(state): State<AppState>,
    Path(store): Path<String>,
    Json(request): Json<PoolSizeRequest>,
) -> Result<Json<AdminReceipt>, ApiError> {
    let store = parse_store(&store)?;
    let config = serde_json::to_value(&request).map_err(|e| ApiError::Internal(e.to_string()))?;
    let receipt = state
        .runtime
        .services()
        .configure(&pool_service(store), config)
        .await?;
    Ok(Json(receipt))
}

#[instrument(skip(state))]
async fn services_handler(State(state): State<AppState>) -> Json<Vec<ServiceInfo>> {
    Json(state.runtime.services().services().await)
}
