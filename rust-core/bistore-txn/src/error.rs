// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::time::Duration;

use bistore_errors::{Classify, ErrorCategory, ErrorSeverity};
use bistore_identity::{CanonicalId, IdentityError, StoreKind};
use bistore_pool::{PoolError, StoreError};
use bistore_storage::StorageError;
use uuid::Uuid;

use crate::types::TransactionStatus;

/// Errors from the two-phase coordinator and its participants.
#[derive(Debug)]
pub enum TransactionError {
    /// No active or archived transaction with this id.
    NotFound(Uuid),
    /// The operation is not valid in the transaction's current state.
    InvalidState {
        transaction_id: Uuid,
        current: TransactionStatus,
        operation: &'static str,
    },
    /// The store was already prepared (or is being prepared) in this transaction.
    AlreadyPrepared { transaction_id: Uuid, store: StoreKind },
    /// The transaction was rolled back while this call was in flight.
    Aborted(Uuid),
    /// An operation addressed to one store was submitted to the other.
    MisroutedOperation {
        store: StoreKind,
        operation_store: StoreKind,
        key: String,
    },
    /// An operation names a canonical id the identity registry does not map
    /// to the operation's key.
    IdentityMismatch {
        canonical_id: CanonicalId,
        store: StoreKind,
        key: String,
        mapped: Option<String>,
    },
    Identity(IdentityError),
    Pool { store: StoreKind, source: PoolError },
    Store { store: StoreKind, source: StoreError },
    /// Applying operations did not finish within the prepare timeout.
    PrepareTimeout { store: StoreKind, waited: Duration },
    /// The native commit was issued but never answered; it may have landed.
    CommitUnconfirmed { store: StoreKind, source: StoreError },
    /// The store acknowledged a commit but some written keys are not readable.
    NotVisible { store: StoreKind, missing: Vec<String> },
    Ticket(StorageError),
    TicketNotFound(Uuid),
    RecoveryInProgress(Uuid),
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionError::NotFound(id) => write!(f, "transaction {id} not found"),
            TransactionError::InvalidState {
                transaction_id,
                current,
                operation,
            } => write!(
                f,
                "cannot {operation} transaction {transaction_id} in state {current}"
            ),
            TransactionError::AlreadyPrepared {
                transaction_id,
                store,
            } => write!(f, "{store} already prepared in transaction {transaction_id}"),
            TransactionError::Aborted(id) => write!(f, "transaction {id} was rolled back"),
            TransactionError::MisroutedOperation {
                store,
                operation_store,
                key,
            } => write!(
                f,
                "operation on {operation_store} key '{key}' submitted to the {store} participant"
            ),
            TransactionError::IdentityMismatch {
                canonical_id,
                store,
                key,
                mapped,
            } => match mapped {
                Some(mapped) => write!(
                    f,
                    "{canonical_id} maps to {store} id '{mapped}', operation targets '{key}'"
                ),
                None => write!(f, "{canonical_id} has no {store} mapping for '{key}'"),
            },
            TransactionError::Identity(e) => write!(f, "identity error: {e}"),
            TransactionError::Pool { store, source } => write!(f, "{store} pool: {source}"),
            TransactionError::Store { store, source } => write!(f, "{store} store: {source}"),
            TransactionError::PrepareTimeout { store, waited } => {
                write!(f, "{store} prepare did not finish within {waited:?}")
            }
            TransactionError::CommitUnconfirmed { store, source } => {
                write!(f, "{store} commit outcome unknown: {source}")
            }
            TransactionError::NotVisible { store, missing } => write!(
                f,
                "{store} acknowledged commit but {} key(s) are not readable: {}",
                missing.len(),
                missing.join(", ")
            ),
            TransactionError::Ticket(e) => write!(f, "recovery ticket storage: {e}"),
            TransactionError::TicketNotFound(id) => write!(f, "recovery ticket {id} not found"),
            TransactionError::RecoveryInProgress(id) => {
                write!(f, "recovery ticket {id} is already being replayed")
            }
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransactionError::Identity(e) => Some(e),
            TransactionError::Pool { source, .. } => Some(source),
            TransactionError::Store { source, .. } => Some(source),
            TransactionError::CommitUnconfirmed { source, .. } => Some(source),
            TransactionError::Ticket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IdentityError> for TransactionError {
    fn from(e: IdentityError) -> Self {
        TransactionError::Identity(e)
    }
}

impl From<StorageError> for TransactionError {
    fn from(e: StorageError) -> Self {
        TransactionError::Ticket(e)
    }
}

impl Classify for TransactionError {
    fn category(&self) -> ErrorCategory {
        match self {
            TransactionError::NotFound(_)
            | TransactionError::InvalidState { .. }
            | TransactionError::AlreadyPrepared { .. }
            | TransactionError::Aborted(_)
            | TransactionError::MisroutedOperation { .. }
            | TransactionError::IdentityMismatch { .. }
            | TransactionError::TicketNotFound(_) => ErrorCategory::ValidationFailure,
            TransactionError::Identity(e) => e.category(),
            TransactionError::Pool { source, .. } => source.category(),
            TransactionError::Store { source, .. } => source.category(),
            TransactionError::CommitUnconfirmed { source, .. } => source.category(),
            TransactionError::PrepareTimeout { .. } => ErrorCategory::NetworkFailure,
            TransactionError::NotVisible { .. } => ErrorCategory::IntegrityViolation,
            TransactionError::Ticket(e) => e.category(),
            TransactionError::RecoveryInProgress(_) => ErrorCategory::ResourceExhaustion,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            TransactionError::NotVisible { .. } | TransactionError::CommitUnconfirmed { .. } => {
                ErrorSeverity::Critical
            }
            TransactionError::Identity(e) => e.severity(),
            TransactionError::Pool { source, .. } => source.severity(),
            TransactionError::Store { source, .. } => source.severity(),
            TransactionError::Ticket(e) => e.severity(),
            other => other.category().default_severity(),
        }
    }
}
