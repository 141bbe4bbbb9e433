// SPDX-License-Identifier: PMPL-1.0-or-later

use std::time::Duration;

use bistore_errors::{Classify, ErrorCategory};
use thiserror::Error;

use crate::connection::StoreError;

/// Errors raised by a [`crate::ConnectionPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool '{pool}' has no free connection after {waited:?}")]
    AcquireTimeout { pool: String, waited: Duration },

    #[error("pool '{pool}' could not open a connection: {source}")]
    Connect {
        pool: String,
        #[source]
        source: StoreError,
    },

    #[error("pool '{0}' is shut down")]
    Closed(String),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl Classify for PoolError {
    fn category(&self) -> ErrorCategory {
        match self {
            PoolError::AcquireTimeout { .. } => ErrorCategory::ResourceExhaustion,
            PoolError::Connect { source, .. } => source.category(),
            PoolError::Closed(_) => ErrorCategory::ServiceUnavailable,
            PoolError::InvalidConfig(_) => ErrorCategory::ConfigurationError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let timeout = PoolError::AcquireTimeout {
            pool: "graph".into(),
            waited: Duration::from_secs(1),
        };
        assert_eq!(timeout.category(), ErrorCategory::ResourceExhaustion);

        let refused = PoolError::Connect {
            pool: "graph".into(),
            source: StoreError::Unreachable("connection refused".into()),
        };
        assert_eq!(refused.category(), ErrorCategory::NetworkFailure);

        let auth = PoolError::Connect {
            pool: "graph".into(),
            source: StoreError::AuthenticationFailed("bad password".into()),
        };
        assert_eq!(auth.category(), ErrorCategory::AuthenticationFailure);
        assert!(auth.category().is_structural());
    }
}
