// SPDX-License-Identifier: PMPL-1.0-or-later
//! Closed error taxonomy shared by every BiStore crate.
//!
//! Each crate's error enum implements [`Classify`], so the category and
//! severity of a failure are fixed by the variant that produced it rather
//! than inferred from a message at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What kind of failure occurred.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Stored bytes cannot be trusted (checksum, decode or shape mismatch).
    DataCorruption,
    /// A bounded resource is exhausted (pool at capacity, queue full).
    ResourceExhaustion,
    /// The transport to a store failed or timed out.
    NetworkFailure,
    /// Credentials were rejected by a store.
    AuthenticationFailure,
    /// Caller-supplied input is malformed or violates a precondition.
    ValidationFailure,
    /// Local process failure (poisoned lock, panicked task).
    SystemFailure,
    /// The store accepted the connection but rejected or lost the operation.
    DatabaseFailure,
    /// The service is shut down or not yet available.
    ServiceUnavailable,
    /// Static configuration is inconsistent.
    ConfigurationError,
    /// A cross-store invariant no longer holds.
    IntegrityViolation,
}

impl ErrorCategory {
    /// Every category, in declaration order.
    pub const ALL: [ErrorCategory; 10] = [
        ErrorCategory::DataCorruption,
        ErrorCategory::ResourceExhaustion,
        ErrorCategory::NetworkFailure,
        ErrorCategory::AuthenticationFailure,
        ErrorCategory::ValidationFailure,
        ErrorCategory::SystemFailure,
        ErrorCategory::DatabaseFailure,
        ErrorCategory::ServiceUnavailable,
        ErrorCategory::ConfigurationError,
        ErrorCategory::IntegrityViolation,
    ];

    /// Stable snake_case name, used for metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::DataCorruption => "data_corruption",
            ErrorCategory::ResourceExhaustion => "resource_exhaustion",
            ErrorCategory::NetworkFailure => "network_failure",
            ErrorCategory::AuthenticationFailure => "authentication_failure",
            ErrorCategory::ValidationFailure => "validation_failure",
            ErrorCategory::SystemFailure => "system_failure",
            ErrorCategory::DatabaseFailure => "database_failure",
            ErrorCategory::ServiceUnavailable => "service_unavailable",
            ErrorCategory::ConfigurationError => "configuration_error",
            ErrorCategory::IntegrityViolation => "integrity_violation",
        }
    }

    /// Failures that are expected to clear on their own and may be retried locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ResourceExhaustion
                | ErrorCategory::NetworkFailure
                | ErrorCategory::DatabaseFailure
                | ErrorCategory::ServiceUnavailable
        )
    }

    /// Failures caused by the caller or the deployment; surfaced immediately.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ValidationFailure
                | ErrorCategory::ConfigurationError
                | ErrorCategory::AuthenticationFailure
        )
    }

    /// Severity assigned when the error type does not pick a more specific one.
    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::ValidationFailure => ErrorSeverity::Low,
            ErrorCategory::NetworkFailure
            | ErrorCategory::ResourceExhaustion
            | ErrorCategory::ServiceUnavailable => ErrorSeverity::Medium,
            ErrorCategory::DatabaseFailure
            | ErrorCategory::AuthenticationFailure
            | ErrorCategory::ConfigurationError => ErrorSeverity::High,
            ErrorCategory::SystemFailure | ErrorCategory::IntegrityViolation => {
                ErrorSeverity::Critical
            }
            ErrorCategory::DataCorruption => ErrorSeverity::Catastrophic,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a failure is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
    Catastrophic,
}

impl ErrorSeverity {
    /// Stable lowercase name, used for metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
            ErrorSeverity::Catastrophic => "catastrophic",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error type that can flow into the recovery subsystem.
pub trait Classify: std::error::Error + Send + Sync {
    /// The category this error belongs to.
    fn category(&self) -> ErrorCategory;

    /// The severity of this particular error.
    fn severity(&self) -> ErrorSeverity {
        self.category().default_severity()
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorContext {
    /// Component that observed the failure (e.g. `"pool"`, `"coordinator"`).
    pub component: String,
    /// Operation in progress (e.g. `"prepare"`, `"acquire"`).
    pub operation: String,
    /// Transaction on whose behalf the operation ran, if any.
    pub transaction_id: Option<Uuid>,
    /// Store the operation targeted, if any.
    pub store: Option<String>,
    /// When the failure was observed.
    pub observed_at: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            transaction_id: None,
            store: None,
            observed_at: Utc::now(),
        }
    }

    pub fn with_transaction(mut self, transaction_id: Uuid) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn with_store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }
}
