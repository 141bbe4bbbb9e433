// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Storage error types for BiStore key-value backends.

use bistore_errors::{Classify, ErrorCategory, ErrorSeverity};
use thiserror::Error;

/// Errors raised by a [`crate::StorageBackend`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred in the underlying storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize a value.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The stored data is corrupted or in an unexpected format.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// The backend cannot be reached (file locked, handle lost).
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// An empty key was supplied.
    #[error("empty key")]
    EmptyKey,
}

impl Classify for StorageError {
    fn category(&self) -> ErrorCategory {
        match self {
            StorageError::Io(_) => ErrorCategory::SystemFailure,
            StorageError::Serialization(_) | StorageError::CorruptedData(_) => {
                ErrorCategory::DataCorruption
            }
            StorageError::BackendUnavailable(_) => ErrorCategory::ServiceUnavailable,
            StorageError::EmptyKey => ErrorCategory::ValidationFailure,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            // A value we wrote ourselves failing to encode is a bug, not rot.
            StorageError::Serialization(_) => ErrorSeverity::Critical,
            other => other.category().default_severity(),
        }
    }
}
