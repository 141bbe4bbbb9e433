// SPDX-License-Identifier: PMPL-1.0-or-later
//! Recovery coordinator: executes the strategy chosen by the classifier,
//! records every decision and escalates what it cannot absorb.

use async_trait::async_trait;
use prometheus::{IntCounterVec, Opts, Registry};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::{Classification, ErrorClassifier, RecoveryStrategy, RetryPolicy};
use crate::record::{ErrorLog, ErrorMetrics, ErrorRecord, RecoveryOutcome};
use crate::taxonomy::{Classify, ErrorCategory, ErrorContext, ErrorSeverity};

/// Receives failures the coordinator could not recover from.
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn escalate(&self, record: &ErrorRecord);
}

/// Writes escalations to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEscalation;

#[async_trait]
impl EscalationHandler for LogEscalation {
    fn name(&self) -> &str {
        "log"
    }

    async fn escalate(&self, record: &ErrorRecord) {
        let ctx = record.context();
        if record.outcome() == RecoveryOutcome::Fatal {
            error!(
                category = %record.category(),
                severity = %record.severity(),
                component = %ctx.component,
                operation = %ctx.operation,
                transaction = ?ctx.transaction_id,
                "Fatal failure: {}",
                record.message()
            );
        } else {
            warn!(
                category = %record.category(),
                severity = %record.severity(),
                component = %ctx.component,
                operation = %ctx.operation,
                transaction = ?ctx.transaction_id,
                "Escalated failure: {}",
                record.message()
            );
        }
    }
}

/// Forwards escalations to an alerting task over a bounded channel.
///
/// Never blocks the failing operation: when the channel is full the record is
/// dropped from the channel (it stays in the error log).
#[derive(Debug, Clone)]
pub struct ChannelEscalation {
    sender: mpsc::Sender<ErrorRecord>,
}

impl ChannelEscalation {
    pub fn new(sender: mpsc::Sender<ErrorRecord>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EscalationHandler for ChannelEscalation {
    fn name(&self) -> &str {
        "channel"
    }

    async fn escalate(&self, record: &ErrorRecord) {
        if let Err(e) = self.sender.try_send(record.clone()) {
            warn!(record = %record.id(), "Escalation channel rejected record: {e}");
        }
    }
}

/// A corrective action run before retrying, e.g. re-checking pool health
/// after a database failure. Returns `true` if the action succeeded.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt(&self, classification: &Classification, context: &ErrorContext) -> bool;
}

/// An operation that failed even after its recovery strategy ran.
#[derive(Debug, Error)]
#[error("{outcome} after {attempts} attempt(s): {source}")]
pub struct Unrecovered<E: std::error::Error + 'static> {
    pub outcome: RecoveryOutcome,
    pub attempts: u32,
    #[source]
    pub source: E,
}

impl<E: Classify + 'static> Classify for Unrecovered<E> {
    fn category(&self) -> ErrorCategory {
        self.source.category()
    }

    fn severity(&self) -> ErrorSeverity {
        self.source.severity()
    }
}

/// Recovery coordinator settings.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How many error records to retain.
    pub log_capacity: usize,
    /// Window used for the error-rate metric.
    pub metrics_window: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            log_capacity: 10_000,
            metrics_window: Duration::from_secs(300),
        }
    }
}

struct PrometheusCounters {
    errors: IntCounterVec,
    outcomes: IntCounterVec,
}

/// Central failure handler shared by every component.
pub struct RecoveryCoordinator {
    classifier: ErrorClassifier,
    config: RecoveryConfig,
    log: RwLock<ErrorLog>,
    handlers: RwLock<Vec<Arc<dyn EscalationHandler>>>,
    hooks: RwLock<HashMap<ErrorCategory, Vec<Arc<dyn RecoveryHook>>>>,
    prometheus: Option<PrometheusCounters>,
}

impl RecoveryCoordinator {
    /// Create a coordinator that escalates to the tracing log.
    pub fn new(classifier: ErrorClassifier) -> Self {
        Self::with_config(classifier, RecoveryConfig::default())
    }

    pub fn with_config(classifier: ErrorClassifier, config: RecoveryConfig) -> Self {
        let handlers: Vec<Arc<dyn EscalationHandler>> = vec![Arc::new(LogEscalation)];
        Self {
            classifier,
            log: RwLock::new(ErrorLog::new(config.log_capacity)),
            config,
            handlers: RwLock::new(handlers),
            hooks: RwLock::new(HashMap::new()),
            prometheus: None,
        }
    }

    /// Add an escalation handler at construction time.
    pub fn with_handler(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.handlers.get_mut().push(handler);
        self
    }

    /// Register error and outcome counters.
    pub fn with_prometheus(mut self, registry: &Registry) -> Result<Self, prometheus::Error> {
        let errors = IntCounterVec::new(
            Opts::new("bistore_errors_total", "Handled failures by category and severity"),
            &["category", "severity"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let outcomes = IntCounterVec::new(
            Opts::new("bistore_recovery_outcomes_total", "Recovery outcomes"),
            &["outcome"],
        )?;
        registry.register(Box::new(outcomes.clone()))?;

        self.prometheus = Some(PrometheusCounters { errors, outcomes });
        Ok(self)
    }

    pub async fn register_handler(&self, handler: Arc<dyn EscalationHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Register a corrective action for a category.
    pub async fn register_hook(&self, category: ErrorCategory, hook: Arc<dyn RecoveryHook>) {
        info!(category = %category, hook = hook.name(), "Recovery hook registered");
        self.hooks.write().await.entry(category).or_default().push(hook);
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Classify a failure, run its recovery strategy, and record the result.
    ///
    /// No operation is retried here; retry-based strategies only run the
    /// registered hooks for the category. Use [`Self::run_with_recovery`] to
    /// retry an operation.
    pub async fn handle(&self, error: &dyn Classify, context: ErrorContext) -> RecoveryOutcome {
        let classification = self.classifier.classify(error);

        let (outcome, attempts) = if classification.severity == ErrorSeverity::Catastrophic {
            (RecoveryOutcome::Fatal, 0)
        } else {
            match &classification.strategy {
                RecoveryStrategy::Quarantine => (RecoveryOutcome::Fatal, 0),
                RecoveryStrategy::FailFast => (RecoveryOutcome::Escalated, 0),
                RecoveryStrategy::RetryWithBackoff(policy)
                | RecoveryStrategy::ReconnectWithBackoff(policy)
                | RecoveryStrategy::ShedLoad(policy) => {
                    self.run_hooks(&classification, &context, policy).await
                }
            }
        };

        self.finish(&classification, context, error.to_string(), outcome, attempts)
            .await;
        outcome
    }

    /// Run `op`, retrying transient failures per the classified strategy.
    ///
    /// Structural and quarantined failures are returned after the first
    /// attempt. A success after one or more failures is recorded as
    /// [`RecoveryOutcome::Recovered`].
    pub async fn run_with_recovery<T, E, F, Fut>(
        &self,
        context: ErrorContext,
        op: F,
    ) -> Result<T, Unrecovered<E>>
    where
        E: Classify + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_loop(context, None, op).await
    }

    /// [`Self::run_with_recovery`], but no retry starts after `deadline`.
    ///
    /// A backoff that would end past the deadline is not slept; the last
    /// failure is returned instead. `op` is responsible for bounding a single
    /// attempt.
    pub async fn run_with_recovery_until<T, E, F, Fut>(
        &self,
        context: ErrorContext,
        deadline: Instant,
        op: F,
    ) -> Result<T, Unrecovered<E>>
    where
        E: Classify + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_loop(context, Some(deadline), op).await
    }

    async fn retry_loop<T, E, F, Fut>(
        &self,
        context: ErrorContext,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T, Unrecovered<E>>
    where
        E: Classify + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        let mut last_failure: Option<(Classification, String)> = None;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if let Some((classification, message)) = last_failure {
                        self.finish(
                            &classification,
                            context,
                            message,
                            RecoveryOutcome::Recovered,
                            attempt,
                        )
                        .await;
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let classification = self.classifier.classify(&err);
                    let policy = if classification.is_retryable() {
                        classification.strategy.retry_policy().cloned()
                    } else {
                        None
                    };
                    let in_time = |delay: Duration| {
                        deadline.map_or(true, |deadline| Instant::now() + delay < deadline)
                    };

                    match policy {
                        Some(policy)
                            if attempt < policy.max_attempts
                                && in_time(policy.backoff_for(attempt)) =>
                        {
                            if matches!(
                                classification.strategy,
                                RecoveryStrategy::ReconnectWithBackoff(_)
                                    | RecoveryStrategy::ShedLoad(_)
                            ) {
                                self.run_hooks(&classification, &context, &RetryPolicy::none())
                                    .await;
                            }
                            let delay = policy.backoff_for(attempt);
                            debug!(
                                component = %context.component,
                                operation = %context.operation,
                                category = %classification.category,
                                attempt = attempt,
                                delay_ms = delay.as_millis() as u64,
                                "Retrying after transient failure: {err}"
                            );
                            last_failure = Some((classification, err.to_string()));
                            tokio::time::sleep(delay).await;
                        }
                        _ => {
                            let outcome = if classification.severity
                                == ErrorSeverity::Catastrophic
                                || classification.strategy == RecoveryStrategy::Quarantine
                            {
                                RecoveryOutcome::Fatal
                            } else {
                                RecoveryOutcome::Escalated
                            };
                            self.finish(&classification, context, err.to_string(), outcome, attempt)
                                .await;
                            return Err(Unrecovered {
                                outcome,
                                attempts: attempt,
                                source: err,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Aggregate metrics over the configured window.
    pub async fn metrics(&self) -> ErrorMetrics {
        self.log.read().await.metrics(self.config.metrics_window)
    }

    /// The most recent records, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<Arc<ErrorRecord>> {
        self.log.read().await.recent(limit)
    }

    /// Retained records raised on behalf of one transaction.
    pub async fn records_for_transaction(&self, transaction_id: Uuid) -> Vec<Arc<ErrorRecord>> {
        self.log.read().await.for_transaction(transaction_id)
    }

    async fn run_hooks(
        &self,
        classification: &Classification,
        context: &ErrorContext,
        policy: &RetryPolicy,
    ) -> (RecoveryOutcome, u32) {
        let hooks: Vec<Arc<dyn RecoveryHook>> = self
            .hooks
            .read()
            .await
            .get(&classification.category)
            .cloned()
            .unwrap_or_default();

        if hooks.is_empty() {
            return (RecoveryOutcome::Escalated, 0);
        }

        let max_attempts = policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            for hook in &hooks {
                if hook.attempt(classification, context).await {
                    debug!(hook = hook.name(), attempt = attempt, "Recovery hook succeeded");
                    return (RecoveryOutcome::Recovered, attempt);
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(policy.backoff_for(attempt)).await;
            }
        }

        (RecoveryOutcome::Escalated, max_attempts)
    }

    async fn finish(
        &self,
        classification: &Classification,
        context: ErrorContext,
        message: String,
        outcome: RecoveryOutcome,
        attempts: u32,
    ) -> Arc<ErrorRecord> {
        let record = ErrorRecord::new(classification, context, message, outcome, attempts);

        if let Some(counters) = &self.prometheus {
            counters
                .errors
                .with_label_values(&[
                    classification.category.as_str(),
                    classification.severity.as_str(),
                ])
                .inc();
            counters.outcomes.with_label_values(&[outcome.as_str()]).inc();
        }

        let record = self.log.write().await.push(record);

        if outcome == RecoveryOutcome::Recovered {
            debug!(
                category = %record.category(),
                attempts = attempts,
                "Recovered from failure: {}",
                record.message()
            );
        } else {
            let handlers = self.handlers.read().await.clone();
            for handler in handlers {
                handler.escalate(&record).await;
            }
        }

        record
    }
}
