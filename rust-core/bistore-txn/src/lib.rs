// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! Two-Phase Commit for BiStore
//!
//! A logical write that spans the graph store and the relational store either
//! becomes visible in both or in neither. When a commit lands in one store and
//! not the other, the transaction is marked `PartialFailure` and a durable
//! [`RecoveryTicket`] records exactly what the lagging store is missing.
//!
//! # Protocol
//!
//! - **Prepare**: each participant checks a connection out of its pool, opens
//!   a native transaction and stages its operations. Participants prepare
//!   concurrently; any failure or timeout rolls every participant back.
//! - **Commit**: each participant commits natively, then the coordinator
//!   checks that every written key is readable.
//! - **Recovery**: replaying a ticket re-applies the lagging operations.
//!   Stores skip operations whose idempotency key they already committed, so
//!   a replay never duplicates an effect.
//!
//! # Transaction State Machine
//!
//! ```text
//! ┌────────┐ prepare ┌───────────┐ all prepared ┌──────────┐ commit ┌────────────┐
//! │ Active │ ──────> │ Preparing │ ───────────> │ Prepared │ ─────> │ Committing │
//! └────────┘         └───────────┘              └──────────┘        └────────────┘
//!      │                   │ failure / timeout       │                    │
//!      │ rollback()        ▼                         │ rollback()         ├─ all committed ──> Committed
//!      │            ┌─────────────┐                  │                    │
//!      └──────────> │ RollingBack │ <────────────────┘                    ├─ some committed ─> PartialFailure
//!                   └─────────────┘                                       │                        │ replay
//!                          │                                              │                        ▼
//!                          ▼                                              │                    Committed
//!                   ┌────────────┐          none committed                │
//!                   │ RolledBack │ <──────────────────────────────────────┘
//!                   └────────────┘
//! ```

mod coordinator;
mod error;
mod kv_store;
mod participant;
mod policy;
mod ticket;
mod types;

pub use bistore_identity::StoreKind;
pub use coordinator::{
    CoordinatorConfig, CoordinatorShutdown, CoordinatorStats, PurgeReport, RecoveryReport,
    TwoPhaseCoordinator,
};
pub use error::TransactionError;
pub use kv_store::{FaultPlan, KvConnection, KvConnector, KvStore};
pub use participant::{Participant, PreparedWork, StoreParticipant, TransactionalConnection};
pub use policy::{AutomaticReplay, ManualRecovery, RecoveryPolicy};
pub use ticket::{RecoveryTicket, TicketStatus, TicketStore};
pub use types::{
    CommitOutcome, Operation, ParticipantOutcome, TransactionHandle, TransactionStatus,
    TransactionSummary,
};
