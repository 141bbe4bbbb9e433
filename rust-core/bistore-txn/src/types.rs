// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::collections::BTreeMap;

use bistore_identity::{CanonicalId, StoreKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One write against one participant store.
///
/// `idempotency_key` must be unique per logical write: a store that has
/// already committed an operation with the same key skips it, which is what
/// makes recovery replay safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub store: StoreKind,
    /// Store-local key (the entity's id in that store).
    pub key: String,
    /// Opaque payload; the coordinator never inspects it.
    pub payload: Vec<u8>,
    pub idempotency_key: String,
    /// Set when the write belongs to an entity tracked by the identity
    /// registry; `key` must then equal the mapped store id.
    pub canonical_id: Option<CanonicalId>,
}

impl Operation {
    /// Operation with a fresh idempotency key.
    pub fn new(store: StoreKind, key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            key: key.into(),
            payload: payload.into(),
            idempotency_key: Uuid::new_v4().to_string(),
            canonical_id: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn for_entity(mut self, canonical_id: CanonicalId) -> Self {
        self.canonical_id = Some(canonical_id);
        self
    }
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    /// At least one store committed and at least one did not. Terminal
    /// until a recovery ticket is replayed.
    PartialFailure,
    RollingBack,
    RolledBack,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Preparing => "preparing",
            TransactionStatus::Prepared => "prepared",
            TransactionStatus::Committing => "committing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::PartialFailure => "partial_failure",
            TransactionStatus::RollingBack => "rolling_back",
            TransactionStatus::RolledBack => "rolled_back",
        }
    }

    /// States a transaction can finish in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed
                | TransactionStatus::PartialFailure
                | TransactionStatus::RolledBack
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned by [`TwoPhaseCoordinator::begin`](crate::TwoPhaseCoordinator::begin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionHandle {
    pub id: Uuid,
}

/// How a commit (or a whole `execute`) finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed,
    RolledBack { reason: String },
    PartialFailure { ticket_id: Uuid },
}

impl CommitOutcome {
    pub fn status(&self) -> TransactionStatus {
        match self {
            CommitOutcome::Committed => TransactionStatus::Committed,
            CommitOutcome::RolledBack { .. } => TransactionStatus::RolledBack,
            CommitOutcome::PartialFailure { .. } => TransactionStatus::PartialFailure,
        }
    }
}

/// Per-store result of the commit phase, as recorded on a recovery ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ParticipantOutcome {
    Committed,
    Failed { error: String },
    /// Native commit acknowledged but not every key was readable afterwards.
    Unverified { missing: Vec<String> },
    /// Commit issued but never answered; the writes may or may not be there.
    Unconfirmed { error: String },
    /// Rolled back after its commit failed.
    RolledBack { error: String },
}

impl ParticipantOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ParticipantOutcome::Committed)
    }
}

/// Archived view of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub id: Uuid,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Operation count per store.
    pub operations: BTreeMap<StoreKind, usize>,
    pub recovery_needed: bool,
    pub ticket_id: Option<Uuid>,
    pub failure: Option<String>,
}
