// SPDX-License-Identifier: PMPL-1.0-or-later
//! The seam between a pool and a concrete store driver.

use std::time::Duration;

use async_trait::async_trait;
use bistore_errors::{Classify, ErrorCategory};
use thiserror::Error;

/// Failures reported by a store driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// The store did not answer in time.
    #[error("store did not respond within {0:?}")]
    Timeout(Duration),

    /// The store answered but refused or lost the operation.
    #[error("store rejected operation: {0}")]
    Rejected(String),

    /// Credentials were refused.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

impl Classify for StoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            StoreError::Unreachable(_) | StoreError::Timeout(_) => ErrorCategory::NetworkFailure,
            StoreError::Rejected(_) => ErrorCategory::DatabaseFailure,
            StoreError::AuthenticationFailed(_) => ErrorCategory::AuthenticationFailure,
            StoreError::Closed => ErrorCategory::ServiceUnavailable,
        }
    }
}

/// A live handle to one store.
#[async_trait]
pub trait StoreConnection: Send + Sync + 'static {
    /// Cheap liveness check, run every time the connection leaves the pool.
    async fn ping(&mut self) -> Result<(), StoreError>;

    /// Real round trip, run by the background health check.
    async fn health_probe(&mut self) -> Result<(), StoreError> {
        self.ping().await
    }

    /// Release server-side resources. Must tolerate repeated calls.
    async fn close(&mut self);
}

/// Opens new connections for a pool.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    type Connection: StoreConnection;

    async fn connect(&self) -> Result<Self::Connection, StoreError>;

    /// Store name used in logs and pool statistics.
    fn store_name(&self) -> &str;
}
