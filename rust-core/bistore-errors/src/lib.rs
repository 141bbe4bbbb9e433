// SPDX-License-Identifier: PMPL-1.0-or-later
//! BiStore error classification and recovery
//!
//! Every failure raised by the pools, the identity registry, the service
//! registry and the two-phase coordinator is routed through this crate:
//!
//! 1. the error type declares its [`ErrorCategory`] and [`ErrorSeverity`]
//!    through the [`Classify`] trait;
//! 2. the [`ErrorClassifier`] picks a [`RecoveryStrategy`] for the category;
//! 3. the [`RecoveryCoordinator`] executes it (retry with backoff, reconnect
//!    hooks, load shedding, fail fast, quarantine), records an immutable
//!    [`ErrorRecord`], and escalates whatever it could not absorb.
//!
//! This crate depends on no other BiStore crate.

mod classifier;
mod record;
mod recovery;
mod taxonomy;

pub use classifier::{
    Classification, ClassifierConfig, ErrorClassifier, RecoveryStrategy, RetryPolicy,
};
pub use record::{ErrorLog, ErrorMetrics, ErrorRecord, RecoveryOutcome};
pub use recovery::{
    ChannelEscalation, EscalationHandler, LogEscalation, RecoveryConfig, RecoveryCoordinator,
    RecoveryHook, Unrecovered,
};
pub use taxonomy::{Classify, ErrorCategory, ErrorContext, ErrorSeverity};
