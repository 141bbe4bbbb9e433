// SPDX-License-Identifier: PMPL-1.0-or-later

use axum::{http::StatusCode, response::IntoResponse, Json};
use bistore_errors::{Classify, ErrorCategory};
use bistore_identity::IdentityError;
use bistore_pool::PoolError;
use bistore_registry::RegistryError;
use bistore_storage::StorageError;
use bistore_txn::TransactionError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for ApiError {
    fn category(&self) -> ErrorCategory {
        match self {
            ApiError::NotFound(_) | ApiError::BadRequest(_) => ErrorCategory::ValidationFailure,
            ApiError::Config(_) => ErrorCategory::ConfigurationError,
            ApiError::Startup(_) | ApiError::Internal(_) | ApiError::Io(_) => {
                ErrorCategory::SystemFailure
            }
            ApiError::Transaction(e) => e.category(),
            ApiError::Identity(e) => e.category(),
            ApiError::Registry(e) => e.category(),
            ApiError::Pool(e) => e.category(),
            ApiError::Storage(e) => e.category(),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_)
            | ApiError::Transaction(TransactionError::NotFound(_))
            | ApiError::Transaction(TransactionError::TicketNotFound(_))
            | ApiError::Registry(RegistryError::UnknownService(_)) => StatusCode::NOT_FOUND,
            ApiError::Transaction(TransactionError::RecoveryInProgress(_)) => StatusCode::CONFLICT,
            ApiError::Registry(RegistryError::ConfigRejected { .. }) => StatusCode::BAD_REQUEST,
            other => match other.category() {
                ErrorCategory::ValidationFailure => StatusCode::BAD_REQUEST,
                ErrorCategory::ResourceExhaustion
                | ErrorCategory::NetworkFailure
                | ErrorCategory::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
            category: self.category().as_str().to_string(),
        });

        (status, body).into_response()
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    pub category: String,
}
