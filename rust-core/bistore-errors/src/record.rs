// SPDX-License-Identifier: PMPL-1.0-or-later
//! Immutable audit records of handled failures and the aggregate metrics
//! derived from them.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::classifier::Classification;
use crate::taxonomy::{ErrorCategory, ErrorContext, ErrorSeverity};

/// The end state of one recovery attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The failure was absorbed; the caller never sees it.
    Recovered,
    /// The failure was surfaced and handed to the escalation handlers.
    Escalated,
    /// The failure cannot be recovered in-process.
    Fatal,
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryOutcome::Recovered => "recovered",
            RecoveryOutcome::Escalated => "escalated",
            RecoveryOutcome::Fatal => "fatal",
        }
    }
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One handled failure. Fields are read-only once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    id: Uuid,
    category: ErrorCategory,
    severity: ErrorSeverity,
    recorded_at: DateTime<Utc>,
    context: ErrorContext,
    message: String,
    strategy: String,
    outcome: RecoveryOutcome,
    attempts: u32,
}

impl ErrorRecord {
    pub(crate) fn new(
        classification: &Classification,
        context: ErrorContext,
        message: String,
        outcome: RecoveryOutcome,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: classification.category,
            severity: classification.severity,
            recorded_at: Utc::now(),
            context,
            message,
            strategy: classification.strategy.name().to_string(),
            outcome,
            attempts,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn outcome(&self) -> RecoveryOutcome {
        self.outcome
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Aggregate view over the error log, exposed to operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorMetrics {
    /// Failures handled since start-up (not bounded by log retention).
    pub total_errors: u64,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    pub by_severity: BTreeMap<ErrorSeverity, u64>,
    pub recovered: u64,
    pub escalated: u64,
    pub fatal: u64,
    /// Errors per minute over the requested window, from retained records.
    pub error_rate_per_minute: f64,
    /// Categories ordered by count, highest first.
    pub top_categories: Vec<(ErrorCategory, u64)>,
}

/// Bounded log of [`ErrorRecord`]s with unbounded running totals.
#[derive(Debug)]
pub struct ErrorLog {
    records: VecDeque<Arc<ErrorRecord>>,
    capacity: usize,
    total: u64,
    by_category: BTreeMap<ErrorCategory, u64>,
    by_severity: BTreeMap<ErrorSeverity, u64>,
    by_outcome: BTreeMap<&'static str, u64>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            total: 0,
            by_category: BTreeMap::new(),
            by_severity: BTreeMap::new(),
            by_outcome: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, record: ErrorRecord) -> Arc<ErrorRecord> {
        self.total += 1;
        *self.by_category.entry(record.category).or_default() += 1;
        *self.by_severity.entry(record.severity).or_default() += 1;
        *self.by_outcome.entry(record.outcome.as_str()).or_default() += 1;

        let record = Arc::new(record);
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(Arc::clone(&record));
        record
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The most recent `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Arc<ErrorRecord>> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    /// Retained records raised on behalf of one transaction.
    pub fn for_transaction(&self, transaction_id: Uuid) -> Vec<Arc<ErrorRecord>> {
        self.records
            .iter()
            .filter(|r| r.context.transaction_id == Some(transaction_id))
            .cloned()
            .collect()
    }

    pub fn metrics(&self, window: Duration) -> ErrorMetrics {
        let window = window.max(Duration::from_secs(1));
        let cutoff = Utc::now()
            - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::minutes(1));
        let in_window = self
            .records
            .iter()
            .filter(|r| r.recorded_at >= cutoff)
            .count();
        let minutes = window.as_secs_f64() / 60.0;

        let mut top_categories: Vec<(ErrorCategory, u64)> =
            self.by_category.iter().map(|(c, n)| (*c, *n)).collect();
        top_categories.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        ErrorMetrics {
            total_errors: self.total,
            by_category: self.by_category.clone(),
            by_severity: self.by_severity.clone(),
            recovered: self.outcome_count(RecoveryOutcome::Recovered),
            escalated: self.outcome_count(RecoveryOutcome::Escalated),
            fatal: self.outcome_count(RecoveryOutcome::Fatal),
            error_rate_per_minute: in_window as f64 / minutes,
            top_categories,
        }
    }

    fn outcome_count(&self, outcome: RecoveryOutcome) -> u64 {
        self.by_outcome.get(outcome.as_str()).copied().unwrap_or(0)
    }
}
