// SPDX-License-Identifier: PMPL-1.0-or-later

use bistore_errors::{Classify, ErrorCategory, ErrorSeverity};
use thiserror::Error;

use crate::types::{CanonicalId, StoreKind};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("at least one store id is required")]
    NoStoreIds,

    #[error("invalid {store} store id {id:?}")]
    InvalidStoreId { store: StoreKind, id: String },

    #[error("unknown canonical id {0}")]
    UnknownCanonical(CanonicalId),

    #[error("gave up resolving identity after {attempts} contended attempts")]
    Contention { attempts: u32 },

    #[error("identity bijection violated: {0}")]
    BijectionViolated(String),
}

impl Classify for IdentityError {
    fn category(&self) -> ErrorCategory {
        match self {
            IdentityError::NoStoreIds
            | IdentityError::InvalidStoreId { .. }
            | IdentityError::UnknownCanonical(_) => ErrorCategory::ValidationFailure,
            IdentityError::Contention { .. } => ErrorCategory::ResourceExhaustion,
            IdentityError::BijectionViolated(_) => ErrorCategory::IntegrityViolation,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            IdentityError::BijectionViolated(_) => ErrorSeverity::Critical,
            other => other.category().default_severity(),
        }
    }
}
