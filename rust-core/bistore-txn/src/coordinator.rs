// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bistore_errors::{
    Classification, Classify, ErrorCategory, ErrorContext, RecoveryCoordinator, RecoveryHook,
    RecoveryOutcome,
};
use bistore_identity::{CrossStoreIdRegistry, StoreKind};
use bistore_pool::ShutdownReport;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TransactionError;
use crate::participant::{Participant, PreparedWork};
use crate::policy::{ManualRecovery, RecoveryPolicy};
use crate::ticket::{RecoveryTicket, TicketStatus, TicketStore};
use crate::types::{
    CommitOutcome, Operation, ParticipantOutcome, TransactionHandle, TransactionStatus,
    TransactionSummary,
};

const COMPONENT: &str = "two_phase_coordinator";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Coordinator timeouts and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Budget for one participant's prepare, connection checkout included.
    pub prepare_timeout_ms: u64,
    /// Budget for one participant's commit and presence check.
    pub commit_timeout_ms: u64,
    pub rollback_timeout_ms: u64,
    /// Finished transactions kept for status queries.
    pub archive_capacity: usize,
    /// How often the recovery worker looks at open tickets.
    pub recovery_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout_ms: 5_000,
            commit_timeout_ms: 5_000,
            rollback_timeout_ms: 2_000,
            archive_capacity: 1_000,
            recovery_interval_ms: 30_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.rollback_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub active: usize,
    pub committed: u64,
    pub rolled_back: u64,
    pub partial_failures: u64,
    /// Partial failures later completed by replay.
    pub recovered: u64,
    pub open_tickets: usize,
}

/// Result of one replay of a recovery ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub ticket_id: Uuid,
    pub transaction_id: Uuid,
    /// Whether the ticket is resolved after this call.
    pub resolved: bool,
    /// The ticket was already resolved; nothing was replayed.
    pub already_resolved: bool,
    /// Stores brought up to date by this call.
    pub replayed: Vec<StoreKind>,
    /// Stores still lagging.
    pub lagging: Vec<StoreKind>,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub transactions: usize,
    pub tickets: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorShutdown {
    /// Unfinished transactions rolled back.
    pub rolled_back: usize,
    pub pools: BTreeMap<StoreKind, ShutdownReport>,
}

// ---------------------------------------------------------------------------
// Transaction state
// ---------------------------------------------------------------------------

struct Transaction {
    id: Uuid,
    status: TransactionStatus,
    created_at: DateTime<Utc>,
    committed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    operations: BTreeMap<StoreKind, Vec<Operation>>,
    /// Stores with a prepare call in flight.
    preparing: BTreeSet<StoreKind>,
    prepared: BTreeMap<StoreKind, Box<dyn PreparedWork>>,
    recovery_needed: bool,
    ticket_id: Option<Uuid>,
    failure: Option<String>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TransactionStatus::Active,
            created_at: Utc::now(),
            committed_at: None,
            finished_at: None,
            operations: BTreeMap::new(),
            preparing: BTreeSet::new(),
            prepared: BTreeMap::new(),
            recovery_needed: false,
            ticket_id: None,
            failure: None,
        }
    }

    fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id,
            status: self.status,
            created_at: self.created_at,
            committed_at: self.committed_at,
            finished_at: self.finished_at,
            operations: self
                .operations
                .iter()
                .map(|(store, ops)| (*store, ops.len()))
                .collect(),
            recovery_needed: self.recovery_needed,
            ticket_id: self.ticket_id,
            failure: self.failure.clone(),
        }
    }
}

#[derive(Default)]
struct Counters {
    committed: AtomicU64,
    rolled_back: AtomicU64,
    partial_failures: AtomicU64,
    recovered: AtomicU64,
}

struct TransactionMetrics {
    outcomes: IntCounterVec,
    open_tickets: IntGauge,
}

impl TransactionMetrics {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let outcomes = IntCounterVec::new(
            Opts::new(
                "bistore_transactions_total",
                "Finished two-phase transactions by outcome",
            ),
            &["outcome"],
        )?;
        let open_tickets = IntGauge::new(
            "bistore_recovery_tickets_open",
            "Recovery tickets waiting for replay",
        )?;
        registry.register(Box::new(outcomes.clone()))?;
        registry.register(Box::new(open_tickets.clone()))?;
        Ok(Self {
            outcomes,
            open_tickets,
        })
    }
}

/// Removes a ticket from the in-replay set when dropped.
struct ReplayClaim<'a> {
    replaying: &'a parking_lot::Mutex<HashSet<Uuid>>,
    ticket_id: Uuid,
}

impl Drop for ReplayClaim<'_> {
    fn drop(&mut self) {
        self.replaying.lock().remove(&self.ticket_id);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Two-phase commit across the graph and relational participants.
///
/// Each transaction is guarded by its own async mutex, held only while its
/// state changes; participant I/O runs outside it. Transactions never block
/// each other.
pub struct TwoPhaseCoordinator {
    config: CoordinatorConfig,
    graph: Arc<dyn Participant>,
    relational: Arc<dyn Participant>,
    identity: Arc<CrossStoreIdRegistry>,
    recovery: Arc<RecoveryCoordinator>,
    tickets: TicketStore,
    policy: Arc<dyn RecoveryPolicy>,
    active: RwLock<HashMap<Uuid, Arc<Mutex<Transaction>>>>,
    archive: parking_lot::Mutex<VecDeque<TransactionSummary>>,
    /// Open tickets by id.
    pending: parking_lot::Mutex<HashMap<Uuid, RecoveryTicket>>,
    replaying: parking_lot::Mutex<HashSet<Uuid>>,
    counters: Counters,
    metrics: Option<TransactionMetrics>,
    shutdown: watch::Sender<bool>,
}

impl TwoPhaseCoordinator {
    pub fn new(
        graph: Arc<dyn Participant>,
        relational: Arc<dyn Participant>,
        identity: Arc<CrossStoreIdRegistry>,
        recovery: Arc<RecoveryCoordinator>,
        tickets: TicketStore,
    ) -> Self {
        if graph.store() != StoreKind::Graph || relational.store() != StoreKind::Relational {
            warn!(
                graph = %graph.store(),
                relational = %relational.store(),
                "Participants registered under a store they do not declare"
            );
        }
        let (shutdown, _) = watch::channel(false);
        Self {
            config: CoordinatorConfig::default(),
            graph,
            relational,
            identity,
            recovery,
            tickets,
            policy: Arc::new(ManualRecovery),
            active: RwLock::new(HashMap::new()),
            archive: parking_lot::Mutex::new(VecDeque::new()),
            pending: parking_lot::Mutex::new(HashMap::new()),
            replaying: parking_lot::Mutex::new(HashSet::new()),
            counters: Counters::default(),
            metrics: None,
            shutdown,
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn RecoveryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_prometheus(mut self, registry: &Registry) -> Result<Self, prometheus::Error> {
        self.metrics = Some(TransactionMetrics::register(registry)?);
        Ok(self)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn policy(&self) -> &dyn RecoveryPolicy {
        self.policy.as_ref()
    }

    pub fn identity(&self) -> &Arc<CrossStoreIdRegistry> {
        &self.identity
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }

    pub fn participant(&self, store: StoreKind) -> &Arc<dyn Participant> {
        match store {
            StoreKind::Graph => &self.graph,
            StoreKind::Relational => &self.relational,
        }
    }

    /// Register a hook that health-checks the affected pool whenever a
    /// database failure is handled.
    pub async fn register_recovery_hooks(&self) {
        let hook = Arc::new(PoolHealthHook {
            graph: Arc::clone(&self.graph),
            relational: Arc::clone(&self.relational),
        });
        self.recovery
            .register_hook(ErrorCategory::DatabaseFailure, hook)
            .await;
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start a transaction over both stores.
    pub async fn begin(&self) -> TransactionHandle {
        let txn = Transaction::new();
        let id = txn.id;
        self.active
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(txn)));
        debug!(transaction = %id, "Transaction started");
        TransactionHandle { id }
    }

    /// Phase 1 for one store.
    ///
    /// A failure here rolls back every participant already prepared and
    /// leaves the transaction `RolledBack`.
    pub async fn prepare(
        &self,
        handle: TransactionHandle,
        store: StoreKind,
        operations: Vec<Operation>,
    ) -> Result<(), TransactionError> {
        let id = handle.id;
        let txn = self.transaction(id, "prepare").await?;
        {
            let mut t = txn.lock().await;
            if !matches!(
                t.status,
                TransactionStatus::Active | TransactionStatus::Preparing
            ) {
                return Err(TransactionError::InvalidState {
                    transaction_id: id,
                    current: t.status,
                    operation: "prepare",
                });
            }
            if t.prepared.contains_key(&store) || !t.preparing.insert(store) {
                return Err(TransactionError::AlreadyPrepared {
                    transaction_id: id,
                    store,
                });
            }
            t.status = TransactionStatus::Preparing;
            t.operations.insert(store, operations.clone());
        }

        let result = match self.validate(store, &operations) {
            Ok(()) => self.prepare_participant(id, store, &operations).await,
            Err(err) => {
                self.report(&err, "prepare", id, Some(store)).await;
                Err(err)
            }
        };

        let mut t = txn.lock().await;
        t.preparing.remove(&store);
        match result {
            Ok(mut work) => {
                if t.status != TransactionStatus::Preparing {
                    drop(t);
                    debug!(transaction = %id, store = %store, "Prepared after abort; rolling back");
                    if let Err(err) = work.rollback(self.config.rollback_timeout()).await {
                        warn!(transaction = %id, store = %store, "Rollback of late prepare failed: {err}");
                        self.report(&err, "rollback", id, Some(store)).await;
                    }
                    return Err(TransactionError::Aborted(id));
                }
                t.prepared.insert(store, work);
                if t.prepared.len() == StoreKind::BOTH.len() {
                    t.status = TransactionStatus::Prepared;
                    info!(transaction = %id, "Transaction prepared");
                }
                Ok(())
            }
            Err(err) => {
                let abort = t.status == TransactionStatus::Preparing;
                let works = if abort {
                    t.status = TransactionStatus::RollingBack;
                    t.failure = Some(err.to_string());
                    std::mem::take(&mut t.prepared)
                } else {
                    BTreeMap::new()
                };
                drop(t);

                warn!(transaction = %id, store = %store, "Prepare failed: {err}");
                if abort {
                    self.rollback_works(id, works).await;
                    self.finish(&txn, TransactionStatus::RolledBack).await;
                }
                Err(err)
            }
        }
    }

    /// Run one participant's prepare, retrying transient failures (a refused
    /// connect, an exhausted pool) until the prepare timeout is spent. Each
    /// attempt gets what is left of the budget. The final failure is recorded
    /// by the recovery coordinator.
    async fn prepare_participant(
        &self,
        id: Uuid,
        store: StoreKind,
        operations: &[Operation],
    ) -> Result<Box<dyn PreparedWork>, TransactionError> {
        let deadline = Instant::now() + self.config.prepare_timeout();
        let participant = self.participant(store);
        let context = ErrorContext::new(COMPONENT, "prepare")
            .with_transaction(id)
            .with_store(store.as_str());
        self.recovery
            .run_with_recovery_until(context, deadline, || {
                let remaining = deadline.saturating_duration_since(Instant::now());
                participant.prepare(operations.to_vec(), remaining)
            })
            .await
            .map_err(|unrecovered| unrecovered.source)
    }

    /// Prepare and commit `operations` on one store in one go, outside the
    /// two-phase protocol. Re-applies the lagging side of a partial failure;
    /// relies on `apply` skipping already-committed idempotency keys, so
    /// replaying twice is harmless. `timeout` bounds each phase.
    pub async fn replay(
        &self,
        transaction_id: Uuid,
        store: StoreKind,
        operations: &[Operation],
        timeout: Duration,
    ) -> Result<(), TransactionError> {
        let mut work = self
            .participant(store)
            .prepare(operations.to_vec(), timeout)
            .await?;
        if let Err(err) = work.commit(timeout).await {
            if let Err(rollback_err) = work.rollback(self.config.rollback_timeout()).await {
                warn!(transaction = %transaction_id, store = %store, "Rollback after failed replay failed: {rollback_err}");
                self.report(&rollback_err, "rollback", transaction_id, Some(store))
                    .await;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Prepare both stores concurrently. Stores missing from `batches` are
    /// prepared with no operations.
    pub async fn prepare_all(
        &self,
        handle: TransactionHandle,
        mut batches: BTreeMap<StoreKind, Vec<Operation>>,
    ) -> Result<(), TransactionError> {
        for store in StoreKind::BOTH {
            batches.entry(store).or_default();
        }
        let results = join_all(
            batches
                .into_iter()
                .map(|(store, operations)| self.prepare(handle, store, operations)),
        )
        .await;

        let mut first: Option<TransactionError> = None;
        for err in results.into_iter().filter_map(Result::err) {
            // Prefer the root cause over the abort it triggered elsewhere.
            match (&first, &err) {
                (None, _) | (Some(TransactionError::Aborted(_)), _) => first = Some(err),
                _ => {}
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Phase 2. Requires every participant prepared.
    ///
    /// Commits run concurrently. If every store commits the transaction is
    /// `Committed`. It is `RolledBack` only when every store with writes
    /// refused its commit and rolled back. Anything else, including a commit
    /// that went unanswered, is `PartialFailure` with a recovery ticket.
    pub async fn commit(
        &self,
        handle: TransactionHandle,
    ) -> Result<CommitOutcome, TransactionError> {
        let id = handle.id;
        let txn = self.transaction(id, "commit").await?;
        let (works, operations) = {
            let mut t = txn.lock().await;
            if t.status != TransactionStatus::Prepared {
                return Err(TransactionError::InvalidState {
                    transaction_id: id,
                    current: t.status,
                    operation: "commit",
                });
            }
            t.status = TransactionStatus::Committing;
            (std::mem::take(&mut t.prepared), t.operations.clone())
        };

        let commit_timeout = self.config.commit_timeout();
        let results = join_all(works.into_iter().map(|(store, mut work)| async move {
            let result = work.commit(commit_timeout).await;
            (store, work, result)
        }))
        .await;

        let mut outcomes = BTreeMap::new();
        let mut failures = Vec::new();
        let mut unfinished = Vec::new();
        for (store, work, result) in results {
            match result {
                Ok(()) => {
                    outcomes.insert(store, ParticipantOutcome::Committed);
                }
                Err(err) => {
                    let outcome = match &err {
                        TransactionError::NotVisible { missing, .. } => {
                            ParticipantOutcome::Unverified {
                                missing: missing.clone(),
                            }
                        }
                        // May have landed: never rolled back, always lagging.
                        TransactionError::CommitUnconfirmed { .. } => {
                            ParticipantOutcome::Unconfirmed {
                                error: err.to_string(),
                            }
                        }
                        _ => {
                            unfinished.push((store, work));
                            ParticipantOutcome::Failed {
                                error: err.to_string(),
                            }
                        }
                    };
                    error!(transaction = %id, store = %store, "Commit failed: {err}");
                    self.report(&err, "commit", id, Some(store)).await;
                    outcomes.insert(store, outcome);
                    failures.push(err);
                }
            }
        }

        if failures.is_empty() {
            self.finish(&txn, TransactionStatus::Committed).await;
            info!(transaction = %id, "Transaction committed");
            return Ok(CommitOutcome::Committed);
        }

        // Release the native transactions that never committed.
        let rollback_timeout = self.config.rollback_timeout();
        for (store, mut work) in unfinished {
            match work.rollback(rollback_timeout).await {
                Ok(()) => {
                    if let Some(ParticipantOutcome::Failed { error }) = outcomes.remove(&store) {
                        outcomes.insert(store, ParticipantOutcome::RolledBack { error });
                    }
                }
                Err(err) => {
                    warn!(transaction = %id, store = %store, "Rollback after failed commit failed: {err}");
                    self.report(&err, "rollback", id, Some(store)).await;
                }
            }
        }

        // Stores with nothing to write cannot lag behind.
        let writes_to = |store: &StoreKind| operations.get(store).is_some_and(|ops| !ops.is_empty());
        let nothing_committed = outcomes
            .iter()
            .filter(|(store, _)| writes_to(store))
            .all(|(_, o)| matches!(o, ParticipantOutcome::RolledBack { .. }));
        if nothing_committed {
            let reason = failures
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            {
                let mut t = txn.lock().await;
                t.failure = Some(reason.clone());
            }
            self.finish(&txn, TransactionStatus::RolledBack).await;
            warn!(transaction = %id, "No participant committed; transaction rolled back");
            return Ok(CommitOutcome::RolledBack { reason });
        }

        let lagging: BTreeMap<StoreKind, Vec<Operation>> = outcomes
            .iter()
            .filter(|(store, outcome)| writes_to(store) && !outcome.is_committed())
            .map(|(store, _)| (*store, operations.get(store).cloned().unwrap_or_default()))
            .collect();
        let ticket = RecoveryTicket::new(id, outcomes, lagging);
        let ticket_id = ticket.id;
        self.open_ticket(ticket).await;

        {
            let mut t = txn.lock().await;
            t.recovery_needed = true;
            t.ticket_id = Some(ticket_id);
            t.failure = Some(
                failures
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }
        self.finish(&txn, TransactionStatus::PartialFailure).await;
        Ok(CommitOutcome::PartialFailure { ticket_id })
    }

    /// Abort a transaction that has not started committing.
    ///
    /// Rolling back an already rolled back transaction is a no-op.
    pub async fn rollback(&self, handle: TransactionHandle) -> Result<(), TransactionError> {
        let id = handle.id;
        if let Some(summary) = self.archived(id) {
            return match summary.status {
                TransactionStatus::RolledBack => Ok(()),
                current => Err(TransactionError::InvalidState {
                    transaction_id: id,
                    current,
                    operation: "roll back",
                }),
            };
        }
        let txn = self.transaction(id, "roll back").await?;
        let works = {
            let mut t = txn.lock().await;
            match t.status {
                TransactionStatus::Active
                | TransactionStatus::Preparing
                | TransactionStatus::Prepared => {}
                TransactionStatus::RollingBack | TransactionStatus::RolledBack => return Ok(()),
                current => {
                    return Err(TransactionError::InvalidState {
                        transaction_id: id,
                        current,
                        operation: "roll back",
                    })
                }
            }
            t.status = TransactionStatus::RollingBack;
            t.failure.get_or_insert_with(|| "rolled back by caller".to_string());
            std::mem::take(&mut t.prepared)
        };

        self.rollback_works(id, works).await;
        self.finish(&txn, TransactionStatus::RolledBack).await;
        info!(transaction = %id, "Transaction rolled back");
        Ok(())
    }

    /// Begin, prepare both stores and commit.
    ///
    /// Structural prepare failures (validation, configuration,
    /// authentication) are returned as errors; transient ones become
    /// `RolledBack`.
    pub async fn execute(
        &self,
        batches: BTreeMap<StoreKind, Vec<Operation>>,
    ) -> Result<CommitOutcome, TransactionError> {
        let handle = self.begin().await;
        if let Err(err) = self.prepare_all(handle, batches).await {
            if err.category().is_structural() {
                return Err(err);
            }
            return Ok(CommitOutcome::RolledBack {
                reason: err.to_string(),
            });
        }
        self.commit(handle).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn status(&self, id: Uuid) -> Option<TransactionStatus> {
        let txn = self.active.read().await.get(&id).cloned();
        match txn {
            Some(txn) => Some(txn.lock().await.status),
            None => self.archived(id).map(|s| s.status),
        }
    }

    pub async fn summary(&self, id: Uuid) -> Option<TransactionSummary> {
        let txn = self.active.read().await.get(&id).cloned();
        match txn {
            Some(txn) => Some(txn.lock().await.summary()),
            None => self.archived(id),
        }
    }

    /// Finished transactions still in the archive, oldest first.
    pub fn history(&self) -> Vec<TransactionSummary> {
        self.archive.lock().iter().cloned().collect()
    }

    pub async fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            active: self.active.read().await.len(),
            committed: self.counters.committed.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            partial_failures: self.counters.partial_failures.load(Ordering::Relaxed),
            recovered: self.counters.recovered.load(Ordering::Relaxed),
            open_tickets: self.pending.lock().len(),
        }
    }

    /// Open recovery tickets, oldest first.
    pub fn open_tickets(&self) -> Vec<RecoveryTicket> {
        let mut tickets: Vec<_> = self.pending.lock().values().cloned().collect();
        tickets.sort_by_key(|t| t.created_at);
        tickets
    }

    pub async fn ticket(&self, ticket_id: Uuid) -> Result<Option<RecoveryTicket>, TransactionError> {
        self.load_ticket(ticket_id).await
    }

    /// Drop finished transactions from the archive, keeping partial failures
    /// that still need recovery, and delete resolved tickets.
    pub async fn purge_completed(&self) -> Result<PurgeReport, TransactionError> {
        let transactions = {
            let mut archive = self.archive.lock();
            let before = archive.len();
            archive.retain(|s| s.recovery_needed);
            before - archive.len()
        };
        let tickets = self.tickets.purge_resolved().await?;
        debug!(transactions, tickets, "Purged completed transactions");
        Ok(PurgeReport {
            transactions,
            tickets,
        })
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Replay the lagging operations of a recovery ticket.
    ///
    /// Idempotent: participants skip operations they already committed, and
    /// replaying a resolved ticket does nothing. Once every lagging store has
    /// caught up the transaction becomes `Committed`.
    pub async fn recover(&self, ticket_id: Uuid) -> Result<RecoveryReport, TransactionError> {
        if !self.replaying.lock().insert(ticket_id) {
            return Err(TransactionError::RecoveryInProgress(ticket_id));
        }
        let _claim = ReplayClaim {
            replaying: &self.replaying,
            ticket_id,
        };

        let mut ticket = self
            .load_ticket(ticket_id)
            .await?
            .ok_or(TransactionError::TicketNotFound(ticket_id))?;
        if !ticket.is_open() {
            return Ok(RecoveryReport {
                ticket_id,
                transaction_id: ticket.transaction_id,
                resolved: true,
                already_resolved: true,
                replayed: Vec::new(),
                lagging: Vec::new(),
                attempts: ticket.attempts,
                error: None,
            });
        }

        ticket.attempts += 1;
        ticket.last_attempt_at = Some(Utc::now());
        info!(
            ticket = %ticket_id,
            transaction = %ticket.transaction_id,
            attempt = ticket.attempts,
            lagging = ?ticket.lagging_stores(),
            "Replaying recovery ticket"
        );

        let timeout = self.config.prepare_timeout() + self.config.commit_timeout();
        let mut replayed = Vec::new();
        let mut still_lagging = BTreeMap::new();
        let mut last_error = None;
        let transaction_id = ticket.transaction_id;
        for (store, operations) in std::mem::take(&mut ticket.lagging) {
            let context = ErrorContext::new(COMPONENT, "replay")
                .with_transaction(transaction_id)
                .with_store(store.as_str());
            let result = self
                .recovery
                .run_with_recovery(context, || {
                    self.replay(transaction_id, store, &operations, timeout)
                })
                .await;
            match result {
                Ok(()) => {
                    ticket.participants.insert(store, ParticipantOutcome::Committed);
                    replayed.push(store);
                }
                Err(unrecovered) => {
                    warn!(ticket = %ticket_id, store = %store, "Replay failed: {unrecovered}");
                    last_error = Some(unrecovered.to_string());
                    still_lagging.insert(store, operations);
                }
            }
        }
        ticket.lagging = still_lagging;

        let resolved = ticket.lagging.is_empty();
        if resolved {
            ticket.status = TicketStatus::Resolved;
            ticket.resolved_at = Some(Utc::now());
            ticket.last_error = None;
        } else {
            ticket.last_error = last_error;
        }
        self.tickets.save(&ticket).await?;

        if resolved {
            self.pending.lock().remove(&ticket_id);
            self.mark_recovered(ticket.transaction_id);
            self.counters.recovered.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.outcomes.with_label_values(&["recovered"]).inc();
            }
            info!(ticket = %ticket_id, transaction = %ticket.transaction_id, "Recovery ticket resolved");
        } else {
            self.pending.lock().insert(ticket_id, ticket.clone());
        }
        self.sync_ticket_gauge();

        Ok(RecoveryReport {
            ticket_id,
            transaction_id: ticket.transaction_id,
            resolved,
            already_resolved: false,
            replayed,
            lagging: ticket.lagging_stores(),
            attempts: ticket.attempts,
            error: ticket.last_error.clone(),
        })
    }

    /// Replay every open ticket the recovery policy allows right now.
    pub async fn recover_pending(&self) -> Vec<RecoveryReport> {
        let now = Utc::now();
        let due: Vec<Uuid> = self
            .open_tickets()
            .into_iter()
            .filter(|t| self.policy.should_replay(t, now))
            .map(|t| t.id)
            .collect();

        let mut reports = Vec::with_capacity(due.len());
        for ticket_id in due {
            match self.recover(ticket_id).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(ticket = %ticket_id, "Automatic replay skipped: {e}"),
            }
        }
        reports
    }

    /// Reload open tickets from the ticket store, e.g. after a restart, and
    /// mark their transactions as needing recovery. Returns the ticket ids.
    pub async fn resume_pending(&self) -> Result<Vec<Uuid>, TransactionError> {
        let open = self.tickets.open_tickets().await?;
        let ids: Vec<Uuid> = open.iter().map(|t| t.id).collect();
        {
            let mut pending = self.pending.lock();
            let mut archive = self.archive.lock();
            for ticket in open {
                if !archive.iter().any(|s| s.id == ticket.transaction_id) {
                    archive.push_back(TransactionSummary {
                        id: ticket.transaction_id,
                        status: TransactionStatus::PartialFailure,
                        created_at: ticket.created_at,
                        committed_at: None,
                        finished_at: Some(ticket.created_at),
                        operations: BTreeMap::new(),
                        recovery_needed: true,
                        ticket_id: Some(ticket.id),
                        failure: ticket.last_error.clone(),
                    });
                }
                pending.insert(ticket.id, ticket);
            }
            trim_archive(&mut archive, self.config.archive_capacity);
        }
        self.sync_ticket_gauge();
        if !ids.is_empty() {
            info!(tickets = ids.len(), policy = self.policy.name(), "Resumed open recovery tickets");
        }
        Ok(ids)
    }

    /// Periodically run [`Self::recover_pending`] until [`Self::shutdown`].
    pub fn start_recovery_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.recovery_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                let reports = coordinator.recover_pending().await;
                if !reports.is_empty() {
                    debug!(replayed = reports.len(), "Recovery worker pass finished");
                }
            }
            debug!("Recovery worker stopped");
        })
    }

    /// Stop the recovery worker, roll back unfinished transactions and close
    /// both pools.
    pub async fn shutdown(&self, timeout: Duration) -> CoordinatorShutdown {
        let _ = self.shutdown.send(true);

        let ids: Vec<Uuid> = self.active.read().await.keys().copied().collect();
        let mut rolled_back = 0;
        for id in ids {
            if self.rollback(TransactionHandle { id }).await.is_ok()
                && self.status(id).await == Some(TransactionStatus::RolledBack)
            {
                rolled_back += 1;
            }
        }

        let mut pools = BTreeMap::new();
        for store in StoreKind::BOTH {
            pools.insert(store, self.participant(store).shutdown(timeout).await);
        }
        info!(rolled_back, "Coordinator shut down");
        CoordinatorShutdown { rolled_back, pools }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn transaction(
        &self,
        id: Uuid,
        operation: &'static str,
    ) -> Result<Arc<Mutex<Transaction>>, TransactionError> {
        if let Some(txn) = self.active.read().await.get(&id) {
            return Ok(Arc::clone(txn));
        }
        match self.archived(id) {
            Some(summary) => Err(TransactionError::InvalidState {
                transaction_id: id,
                current: summary.status,
                operation,
            }),
            None => Err(TransactionError::NotFound(id)),
        }
    }

    fn archived(&self, id: Uuid) -> Option<TransactionSummary> {
        self.archive.lock().iter().rev().find(|s| s.id == id).cloned()
    }

    /// Check routing and identity of every operation before any I/O.
    fn validate(&self, store: StoreKind, operations: &[Operation]) -> Result<(), TransactionError> {
        for op in operations {
            if op.store != store {
                return Err(TransactionError::MisroutedOperation {
                    store,
                    operation_store: op.store,
                    key: op.key.clone(),
                });
            }
            let Some(canonical_id) = op.canonical_id else {
                continue;
            };
            let mapped = self
                .identity
                .mapping(canonical_id)
                .and_then(|m| m.store_id(store).map(str::to_string));
            if mapped.as_deref() != Some(op.key.as_str()) {
                return Err(TransactionError::IdentityMismatch {
                    canonical_id,
                    store,
                    key: op.key.clone(),
                    mapped,
                });
            }
        }
        Ok(())
    }

    async fn rollback_works(&self, id: Uuid, works: BTreeMap<StoreKind, Box<dyn PreparedWork>>) {
        let timeout = self.config.rollback_timeout();
        let results = join_all(works.into_iter().map(|(store, mut work)| async move {
            (store, work.rollback(timeout).await)
        }))
        .await;
        for (store, result) in results {
            if let Err(err) = result {
                // Never committed, so nothing of it is visible.
                warn!(transaction = %id, store = %store, "Native rollback failed: {err}");
                self.report(&err, "rollback", id, Some(store)).await;
            }
        }
    }

    /// Move a transaction to its terminal state and into the archive.
    async fn finish(&self, txn: &Arc<Mutex<Transaction>>, status: TransactionStatus) {
        let summary = {
            let mut t = txn.lock().await;
            let now = Utc::now();
            t.status = status;
            t.finished_at = Some(now);
            if status == TransactionStatus::Committed || status == TransactionStatus::PartialFailure {
                t.committed_at = Some(now);
            }
            t.summary()
        };

        self.active.write().await.remove(&summary.id);
        {
            let mut archive = self.archive.lock();
            archive.push_back(summary);
            trim_archive(&mut archive, self.config.archive_capacity);
        }

        let (counter, label) = match status {
            TransactionStatus::Committed => (&self.counters.committed, "committed"),
            TransactionStatus::PartialFailure => {
                (&self.counters.partial_failures, "partial_failure")
            }
            _ => (&self.counters.rolled_back, "rolled_back"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.outcomes.with_label_values(&[label]).inc();
        }
    }

    async fn open_ticket(&self, ticket: RecoveryTicket) {
        let ticket_id = ticket.id;
        let transaction_id = ticket.transaction_id;
        if let Err(e) = self.tickets.save(&ticket).await {
            // The in-memory copy still allows replay until restart.
            let err = TransactionError::Ticket(e);
            error!(ticket = %ticket_id, transaction = %transaction_id, "Recovery ticket not persisted: {err}");
            self.report(&err, "persist_ticket", transaction_id, None).await;
        }
        error!(
            transaction = %transaction_id,
            ticket = %ticket_id,
            lagging = ?ticket.lagging_stores(),
            "Partial commit; recovery ticket issued"
        );
        self.pending.lock().insert(ticket_id, ticket);
        self.sync_ticket_gauge();
    }

    async fn load_ticket(&self, ticket_id: Uuid) -> Result<Option<RecoveryTicket>, TransactionError> {
        if let Some(ticket) = self.pending.lock().get(&ticket_id).cloned() {
            return Ok(Some(ticket));
        }
        Ok(self.tickets.get(ticket_id).await?)
    }

    fn mark_recovered(&self, transaction_id: Uuid) {
        let mut archive = self.archive.lock();
        if let Some(summary) = archive.iter_mut().rev().find(|s| s.id == transaction_id) {
            summary.status = TransactionStatus::Committed;
            summary.recovery_needed = false;
            summary.committed_at.get_or_insert_with(Utc::now);
        }
    }

    fn sync_ticket_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.open_tickets.set(self.pending.lock().len() as i64);
        }
    }

    async fn report(
        &self,
        err: &TransactionError,
        operation: &str,
        transaction_id: Uuid,
        store: Option<StoreKind>,
    ) -> RecoveryOutcome {
        let mut context = ErrorContext::new(COMPONENT, operation).with_transaction(transaction_id);
        if let Some(store) = store {
            context = context.with_store(store.as_str());
        }
        self.recovery.handle(err, context).await
    }
}

/// Drop the oldest finished transactions past `capacity`, keeping those that
/// still need recovery.
fn trim_archive(archive: &mut VecDeque<TransactionSummary>, capacity: usize) {
    let mut index = 0;
    while archive.len() > capacity && index < archive.len() {
        if archive[index].recovery_needed {
            index += 1;
        } else {
            archive.remove(index);
        }
    }
}

/// Health-checks the pool of the store a database failure came from.
struct PoolHealthHook {
    graph: Arc<dyn Participant>,
    relational: Arc<dyn Participant>,
}

#[async_trait]
impl RecoveryHook for PoolHealthHook {
    fn name(&self) -> &str {
        "pool_health_check"
    }

    async fn attempt(&self, _classification: &Classification, context: &ErrorContext) -> bool {
        let targets: Vec<&Arc<dyn Participant>> = match context.store.as_deref() {
            Some("graph") => vec![&self.graph],
            Some("relational") => vec![&self.relational],
            _ => vec![&self.graph, &self.relational],
        };
        let mut healthy = true;
        for participant in targets {
            let report = participant.health_check().await;
            debug!(
                store = %participant.store(),
                probed = report.probed,
                unhealthy = report.unhealthy,
                created = report.created,
                "Pool health check after database failure"
            );
            healthy &= report.unhealthy == 0;
        }
        healthy
    }
}
