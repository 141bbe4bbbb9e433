// SPDX-License-Identifier: PMPL-1.0-or-later
//! HTTP surface tests against a bootstrapped in-memory instance.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use bistore_api::{
    build_router, AppState, BiStore, BistoreConfig, HealthReport, HealthStatus,
    OutstandingTicket,
};
use bistore_identity::{EntityIdMapping, Resolution};
use bistore_pool::PoolConfig;
use bistore_registry::{AdminReceipt, ServiceInfo};
use bistore_txn::{CommitOutcome, CoordinatorConfig, RecoveryReport, StoreKind, TransactionSummary};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_config() -> BistoreConfig {
    BistoreConfig {
        graph_pool: PoolConfig::named("graph").with_size(1, 4),
        relational_pool: PoolConfig::named("relational").with_size(1, 4),
        coordinator: CoordinatorConfig {
            prepare_timeout_ms: 500,
            commit_timeout_ms: 500,
            rollback_timeout_ms: 500,
            ..CoordinatorConfig::default()
        },
        ..BistoreConfig::default()
    }
}

async fn setup() -> (Router, Arc<BiStore>) {
    let runtime = Arc::new(BiStore::bootstrap(test_config()).await.unwrap());
    (build_router(AppState::new(Arc::clone(&runtime))), runtime)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

fn entity_request(name: &str) -> Value {
    json!({
        "graph": [{"key": format!("node:{name}"), "payload": {"label": name}, "idempotency_key": format!("{name}-graph")}],
        "relational": [{"key": format!("row:{name}"), "payload": {"name": name}, "idempotency_key": format!("{name}-relational")}],
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _runtime) = setup().await;

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let report: HealthReport = decode(&body);
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.pools.len(), 2);
    assert!(report.pools.iter().all(|p| p.total >= p.min_size));
    assert!(report.outstanding_recovery.is_empty());
}

#[tokio::test]
async fn test_ready_endpoint() {
    let (app, runtime) = setup().await;

    let (status, _) = send(&app, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::OK);

    runtime.shutdown(std::time::Duration::from_secs(1)).await;
    let (status, _) = send(&app, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_transaction_commits_both_stores() {
    let (app, runtime) = setup().await;

    let (status, body) = send(&app, Method::POST, "/transactions", Some(entity_request("ada"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decode::<CommitOutcome>(&body), CommitOutcome::Committed);

    assert!(runtime.pool(StoreKind::Graph).store().contains("node:ada").await);
    assert!(runtime.pool(StoreKind::Relational).store().contains("row:ada").await);

    let history = runtime.coordinator().history();
    let id = history.last().unwrap().id;
    let (status, body) = send(&app, Method::GET, &format!("/transactions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let summary: TransactionSummary = decode(&body);
    assert_eq!(summary.id, id);
    assert_eq!(summary.operations.get(&StoreKind::Graph), Some(&1));
}

#[tokio::test]
async fn test_empty_transaction_is_rejected() {
    let (app, _runtime) = setup().await;

    let (status, body) = send(&app, Method::POST, "/transactions", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: Value = decode(&body);
    assert_eq!(error["category"], "validation_failure");
}

#[tokio::test]
async fn test_unknown_transaction_is_not_found() {
    let (app, _runtime) = setup().await;

    let uri = format!("/transactions/{}", uuid::Uuid::new_v4());
    let (status, _) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_partial_failure_is_reported_and_replayed() {
    let (app, runtime) = setup().await;
    let relational = Arc::clone(runtime.pool(StoreKind::Relational).store());
    relational.faults().set_fail_commit(true);

    let (status, body) = send(&app, Method::POST, "/transactions", Some(entity_request("grace"))).await;
    assert_eq!(status, StatusCode::OK);
    let ticket_id = match decode::<CommitOutcome>(&body) {
        CommitOutcome::PartialFailure { ticket_id } => ticket_id,
        other => panic!("expected partial failure, got {other:?}"),
    };

    let (_, body) = send(&app, Method::GET, "/health", None).await;
    let report: HealthReport = decode(&body);
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(report.transactions.partial_failures, 1);
    assert_eq!(report.outstanding_recovery[0].ticket_id, ticket_id);
    assert_eq!(report.outstanding_recovery[0].lagging, vec![StoreKind::Relational]);

    let (_, body) = send(&app, Method::GET, "/recovery", None).await;
    let open: Vec<OutstandingTicket> = decode(&body);
    assert_eq!(open.len(), 1);

    relational.faults().clear();
    let uri = format!("/recovery/{ticket_id}/replay");
    let (status, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let replay: RecoveryReport = decode(&body);
    assert!(replay.resolved);
    assert_eq!(replay.replayed, vec![StoreKind::Relational]);
    assert!(relational.contains("row:grace").await);

    let (_, body) = send(&app, Method::GET, "/health", None).await;
    let report: HealthReport = decode(&body);
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.transactions.recovered, 1);
}

#[tokio::test]
async fn test_replay_of_unknown_ticket_is_not_found() {
    let (app, _runtime) = setup().await;

    let uri = format!("/recovery/{}/replay", uuid::Uuid::new_v4());
    let (status, _) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_identity_resolution_round_trip() {
    let (app, _runtime) = setup().await;

    let known = json!({"graph": "node:7", "relational": "row:7"});
    let (status, body) = send(&app, Method::POST, "/identity/resolve", Some(known)).await;
    assert_eq!(status, StatusCode::OK);
    let resolution: Resolution = decode(&body);
    assert!(resolution.created);

    let uri = format!("/identity/{}", resolution.canonical_id);
    let (status, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let mapping: EntityIdMapping = decode(&body);
    assert_eq!(mapping.store_id(StoreKind::Graph), Some("node:7"));
    assert_eq!(mapping.store_id(StoreKind::Relational), Some("row:7"));

    let (status, _) = send(&app, Method::POST, "/identity/resolve", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pool_resize_goes_through_registry() {
    let (app, runtime) = setup().await;

    let size = json!({"min_size": 2, "max_size": 6});
    let (status, body) = send(&app, Method::PUT, "/pools/graph/size", Some(size)).await;
    assert_eq!(status, StatusCode::OK);
    let receipt: AdminReceipt = decode(&body);
    assert_eq!(receipt.service, "pool.graph");

    let stats = runtime.pool(StoreKind::Graph).pool().stats();
    assert_eq!((stats.min_size, stats.max_size), (2, 6));
    assert!(stats.total >= 2);

    let history = runtime.services().config_history("pool.graph").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sequence, receipt.sequence);
}

#[tokio::test]
async fn test_invalid_pool_resize_is_rejected() {
    let (app, runtime) = setup().await;

    let size = json!({"min_size": 5, "max_size": 1});
    let (status, _) = send(&app, Method::PUT, "/pools/relational/size", Some(size)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let stats = runtime.pool(StoreKind::Relational).pool().stats();
    assert_eq!((stats.min_size, stats.max_size), (1, 4));

    let size = json!({"min_size": 1, "max_size": 2});
    let (status, _) = send(&app, Method::PUT, "/pools/document/size", Some(size)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_services_are_registered() {
    let (app, _runtime) = setup().await;

    let (status, body) = send(&app, Method::GET, "/services", None).await;
    assert_eq!(status, StatusCode::OK);
    let services: Vec<ServiceInfo> = decode(&body);
    let mut names: Vec<_> = services.iter().map(|s| s.name.as_str()).collect();
    names.sort();
    assert_eq!(
        names,
        vec!["coordinator", "identity", "pool.graph", "pool.relational", "recovery"]
    );
    assert!(services
        .iter()
        .filter(|s| s.name.starts_with("pool."))
        .all(|s| s.configurable));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _runtime) = setup().await;
    send(&app, Method::POST, "/transactions", Some(entity_request("lin"))).await;

    let (status, body) = send(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("bistore_transactions_total"));
    assert!(text.contains("bistore_recovery_tickets_open"));
}
