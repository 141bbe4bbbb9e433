// SPDX-License-Identifier: PMPL-1.0-or-later

use std::time::Duration;

use bistore_errors::{Classify, ErrorCategory};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no service registered under '{0}'")]
    UnknownService(String),

    #[error("service '{name}' is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("factory for service '{name}' failed: {message}")]
    Factory {
        name: String,
        category: ErrorCategory,
        message: String,
    },

    #[error("service '{0}' does not accept configuration")]
    NotConfigurable(String),

    #[error("service '{name}' rejected configuration: {reason}")]
    ConfigRejected { name: String, reason: String },

    #[error("lock for service '{name}' not acquired within {waited:?}")]
    LockTimeout { name: String, waited: Duration },

    #[error("registry admin worker has stopped")]
    WorkerStopped,
}

impl Classify for RegistryError {
    fn category(&self) -> ErrorCategory {
        match self {
            RegistryError::UnknownService(_) => ErrorCategory::ValidationFailure,
            RegistryError::TypeMismatch { .. }
            | RegistryError::NotConfigurable(_)
            | RegistryError::ConfigRejected { .. } => ErrorCategory::ConfigurationError,
            RegistryError::Factory { category, .. } => *category,
            RegistryError::LockTimeout { .. } => ErrorCategory::ResourceExhaustion,
            RegistryError::WorkerStopped => ErrorCategory::ServiceUnavailable,
        }
    }
}
