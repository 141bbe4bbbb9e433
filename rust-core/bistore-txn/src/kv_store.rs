// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A participant store over a plain `StorageBackend`.
//
// Each connection buffers its native transaction and writes it with one
// `apply_batch`, so a commit is all-or-nothing. Committed idempotency keys
// are stored next to the rows and skipped on re-apply. A `FaultPlan` lets
// callers make connects, pings, applies, commits and rollbacks fail, slow
// down applies, or acknowledge commits without writing anything.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bistore_pool::{StoreConnection, StoreConnector, StoreError};
use bistore_storage::{BatchWrite, InMemoryBackend, StorageBackend};
use tracing::trace;

use crate::participant::TransactionalConnection;
use crate::types::Operation;

const ROW_PREFIX: &str = "row:";
const APPLIED_PREFIX: &str = "applied:";

fn row_key(key: &str) -> Vec<u8> {
    format!("{ROW_PREFIX}{key}").into_bytes()
}

fn applied_key(idempotency_key: &str) -> Vec<u8> {
    format!("{APPLIED_PREFIX}{idempotency_key}").into_bytes()
}

/// Switchable failures for a [`KvStore`].
#[derive(Debug, Default)]
pub struct FaultPlan {
    fail_connect: AtomicBool,
    fail_ping: AtomicBool,
    fail_apply: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    lose_commits: AtomicBool,
    apply_delay_ms: AtomicU64,
    commit_ack_delay_ms: AtomicU64,
}

impl FaultPlan {
    pub fn set_fail_connect(&self, on: bool) {
        self.fail_connect.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_ping(&self, on: bool) {
        self.fail_ping.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_apply(&self, on: bool) {
        self.fail_apply.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, on: bool) {
        self.fail_commit.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_rollback(&self, on: bool) {
        self.fail_rollback.store(on, Ordering::SeqCst);
    }

    /// Acknowledge commits without writing them.
    pub fn set_lose_commits(&self, on: bool) {
        self.lose_commits.store(on, Ordering::SeqCst);
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        self.apply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Write commits, then wait this long before acknowledging them.
    pub fn set_commit_ack_delay(&self, delay: Duration) {
        self.commit_ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.set_fail_connect(false);
        self.set_fail_ping(false);
        self.set_fail_apply(false);
        self.set_fail_commit(false);
        self.set_fail_rollback(false);
        self.set_lose_commits(false);
        self.set_apply_delay(Duration::ZERO);
        self.set_commit_ack_delay(Duration::ZERO);
    }

    fn on(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

/// Shared state of one participant store.
pub struct KvStore {
    name: String,
    backend: Arc<dyn StorageBackend>,
    faults: FaultPlan,
    writes: AtomicU64,
    skipped: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl KvStore {
    pub fn new(name: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            faults: FaultPlan::default(),
            writes: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(InMemoryBackend::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Committed payload for `key`.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.backend.get(&row_key(key)).await.ok().flatten()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    pub async fn row_count(&self) -> usize {
        self.backend
            .scan_prefix(ROW_PREFIX.as_bytes(), usize::MAX)
            .await
            .map(|rows| rows.len())
            .unwrap_or_default()
    }

    pub async fn was_applied(&self, idempotency_key: &str) -> bool {
        matches!(
            self.backend.get(&applied_key(idempotency_key)).await,
            Ok(Some(_))
        )
    }

    /// Operations written by successful commits.
    pub fn writes_total(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Operations skipped because their idempotency key was already committed.
    pub fn skipped_total(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn commits_total(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn rollbacks_total(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }
}

/// [`StoreConnector`] for a [`KvStore`].
#[derive(Clone)]
pub struct KvConnector {
    store: Arc<KvStore>,
}

impl KvConnector {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }
}

#[async_trait]
impl StoreConnector for KvConnector {
    type Connection = KvConnection;

    async fn connect(&self) -> Result<KvConnection, StoreError> {
        if FaultPlan::on(&self.store.faults.fail_connect) {
            return Err(StoreError::Unreachable(format!(
                "{} refused the connection",
                self.store.name
            )));
        }
        Ok(KvConnection {
            store: Arc::clone(&self.store),
            pending: None,
            closed: false,
        })
    }

    fn store_name(&self) -> &str {
        &self.store.name
    }
}

/// Staged writes of the open native transaction.
#[derive(Default)]
struct NativeTransaction {
    writes: Vec<BatchWrite>,
    idempotency_keys: HashSet<String>,
}

pub struct KvConnection {
    store: Arc<KvStore>,
    pending: Option<NativeTransaction>,
    closed: bool,
}

impl KvConnection {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreConnection for KvConnection {
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if FaultPlan::on(&self.store.faults.fail_ping) {
            return Err(StoreError::Unreachable(format!(
                "{} did not answer ping",
                self.store.name
            )));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.pending = None;
        self.closed = true;
    }
}

#[async_trait]
impl TransactionalConnection for KvConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.pending = Some(NativeTransaction::default());
        Ok(())
    }

    async fn apply(&mut self, operation: &Operation) -> Result<(), StoreError> {
        self.ensure_open()?;
        let faults = &self.store.faults;
        if FaultPlan::on(&faults.fail_apply) {
            return Err(StoreError::Rejected(format!(
                "{} rejected write to '{}'",
                self.store.name, operation.key
            )));
        }
        let delay = faults.apply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let already_committed = self.store.was_applied(&operation.idempotency_key).await;
        let txn = self
            .pending
            .as_mut()
            .ok_or_else(|| StoreError::Rejected("no open transaction".into()))?;
        if already_committed || !txn.idempotency_keys.insert(operation.idempotency_key.clone()) {
            trace!(store = %self.store.name, key = %operation.key, "Skipping applied operation");
            self.store.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        txn.writes.push(BatchWrite::Put {
            key: row_key(&operation.key),
            value: operation.payload.clone(),
        });
        txn.writes.push(BatchWrite::Put {
            key: applied_key(&operation.idempotency_key),
            value: operation.key.clone().into_bytes(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let txn = self
            .pending
            .take()
            .ok_or_else(|| StoreError::Rejected("no open transaction".into()))?;
        let faults = &self.store.faults;
        if FaultPlan::on(&faults.fail_commit) {
            self.pending = Some(txn);
            return Err(StoreError::Rejected(format!(
                "{} refused to commit",
                self.store.name
            )));
        }

        if !FaultPlan::on(&faults.lose_commits) {
            self.store
                .backend
                .apply_batch(&txn.writes)
                .await
                .map_err(|e| StoreError::Rejected(e.to_string()))?;
            self.store
                .writes
                .fetch_add(txn.idempotency_keys.len() as u64, Ordering::Relaxed);
        }
        self.store.commits.fetch_add(1, Ordering::Relaxed);

        let ack_delay = faults.commit_ack_delay_ms.load(Ordering::SeqCst);
        if ack_delay > 0 {
            tokio::time::sleep(Duration::from_millis(ack_delay)).await;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if FaultPlan::on(&self.store.faults.fail_rollback) {
            return Err(StoreError::Rejected(format!(
                "{} failed to roll back",
                self.store.name
            )));
        }
        if self.pending.take().is_some() {
            self.store.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn contains(&mut self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        self.store
            .backend
            .get(&row_key(key))
            .await
            .map(|row| row.is_some())
            .map_err(|e| StoreError::Rejected(e.to_string()))
    }
}
