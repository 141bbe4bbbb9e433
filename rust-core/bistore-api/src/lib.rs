// SPDX-License-Identifier: PMPL-1.0-or-later
//! BiStore API
//!
//! Bootstraps the consistency layer through the service registry and exposes
//! health, metrics, transactions and recovery over HTTP.

mod config;
mod error;
mod health;
mod routes;
mod runtime;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

pub use config::{ApiConfig, BistoreConfig, RecoveryMode};
pub use error::{ApiError, ErrorResponse};
pub use health::{HealthReport, HealthStatus, OutstandingTicket};
pub use routes::{build_router, AppState, OperationRequest, PoolSizeRequest, TransactionRequest};
pub use runtime::{
    pool_service, BiStore, PoolService, COORDINATOR_SERVICE, IDENTITY_SERVICE, RECOVERY_SERVICE,
};

/// How long shutdown waits for checked-out connections.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Start the API server and run until ctrl-c.
pub async fn serve(config: BistoreConfig) -> Result<(), ApiError> {
    let addr = format!("{}:{}", config.api.host, config.api.port);
    let runtime = Arc::new(BiStore::bootstrap(config).await?);
    let app = build_router(AppState::new(Arc::clone(&runtime)));

    info!("Starting BiStore API server on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for shutdown signal: {e}");
            }
        })
        .await?;

    let report = runtime.shutdown(SHUTDOWN_GRACE).await;
    info!(
        rolled_back = report.rolled_back,
        "BiStore API server stopped"
    );
    Ok(())
}
