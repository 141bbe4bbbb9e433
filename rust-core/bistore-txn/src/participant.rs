// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Participant side of the two-phase protocol.
//
// A store joins a transaction through its connection pool. Preparing checks a
// connection out, opens a native transaction on it and applies the
// operations; the connection then stays with the transaction (inside a
// `PreparedWork`) until the coordinator commits or rolls it back. Dropping
// unfinished work rolls the native transaction back in the background before
// the connection goes back to the pool.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bistore_identity::StoreKind;
use bistore_pool::{
    ConnectionPool, HealthCheckReport, PoolGuard, PoolStats, ShutdownReport, StoreConnection,
    StoreConnector, StoreError,
};
use tracing::{debug, warn};

use crate::error::TransactionError;
use crate::types::Operation;

/// A store connection with native transactions.
///
/// At most one native transaction is open per connection; `begin` discards
/// any transaction a previous user left open.
#[async_trait]
pub trait TransactionalConnection: StoreConnection {
    async fn begin(&mut self) -> Result<(), StoreError>;

    /// Stage one operation in the open native transaction.
    ///
    /// Must be a no-op for an `idempotency_key` the store has already
    /// committed.
    async fn apply(&mut self, operation: &Operation) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Whether `key` is readable from committed state.
    async fn contains(&mut self, key: &str) -> Result<bool, StoreError>;
}

/// Operations staged in one store, waiting for the coordinator's decision.
#[async_trait]
pub trait PreparedWork: Send {
    fn store(&self) -> StoreKind;

    /// Commit natively, then check that every written key is readable.
    ///
    /// A refused commit leaves the native transaction open for
    /// [`Self::rollback`]. A commit that times out or loses its connection
    /// returns [`TransactionError::CommitUnconfirmed`]: the writes may have
    /// landed, so the work is closed and its connection destroyed.
    async fn commit(&mut self, timeout: Duration) -> Result<(), TransactionError>;

    /// Roll back the native transaction. A no-op once committed.
    async fn rollback(&mut self, timeout: Duration) -> Result<(), TransactionError>;
}

/// A store taking part in two-phase commits.
#[async_trait]
pub trait Participant: Send + Sync {
    fn store(&self) -> StoreKind;

    fn pool_stats(&self) -> PoolStats;

    /// Stage `operations` in a native transaction.
    ///
    /// On any failure, including the timeout, the native transaction is
    /// rolled back and the connection released before the error returns.
    async fn prepare(
        &self,
        operations: Vec<Operation>,
        timeout: Duration,
    ) -> Result<Box<dyn PreparedWork>, TransactionError>;

    async fn health_check(&self) -> HealthCheckReport;

    async fn shutdown(&self, timeout: Duration) -> ShutdownReport;
}

/// [`Participant`] backed by a [`ConnectionPool`].
pub struct StoreParticipant<K: StoreConnector> {
    store: StoreKind,
    pool: ConnectionPool<K>,
    rollback_timeout: Duration,
}

impl<K: StoreConnector> StoreParticipant<K> {
    pub fn new(store: StoreKind, pool: ConnectionPool<K>) -> Self {
        Self {
            store,
            pool,
            rollback_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }
}

#[async_trait]
impl<K> Participant for StoreParticipant<K>
where
    K: StoreConnector,
    K::Connection: TransactionalConnection,
{
    fn store(&self) -> StoreKind {
        self.store
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    async fn prepare(
        &self,
        operations: Vec<Operation>,
        timeout: Duration,
    ) -> Result<Box<dyn PreparedWork>, TransactionError> {
        let store = self.store;
        if operations.is_empty() {
            return Ok(Box::new(PreparedOnPool::<K>::empty(store)));
        }

        let started = Instant::now();
        let mut guard = self
            .pool
            .acquire(timeout)
            .await
            .map_err(|source| TransactionError::Pool { store, source })?;
        let remaining = timeout.saturating_sub(started.elapsed());

        let staged = tokio::time::timeout(remaining, async {
            guard.begin().await?;
            for operation in &operations {
                guard.apply(operation).await?;
            }
            Ok::<_, StoreError>(())
        })
        .await;

        let failure = match staged {
            Ok(Ok(())) => {
                debug!(store = %store, operations = operations.len(), "Participant prepared");
                let keys = operations.into_iter().map(|op| op.key).collect();
                return Ok(Box::new(PreparedOnPool::new(
                    store,
                    guard,
                    keys,
                    self.rollback_timeout,
                )));
            }
            Ok(Err(source)) => TransactionError::Store { store, source },
            Err(_) => TransactionError::PrepareTimeout {
                store,
                waited: started.elapsed(),
            },
        };

        abort_native(store, guard, self.rollback_timeout).await;
        Err(failure)
    }

    async fn health_check(&self) -> HealthCheckReport {
        self.pool.health_check_all().await
    }

    async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.pool.shutdown(timeout).await
    }
}

/// Roll back and release, or destroy the connection if rollback fails.
async fn abort_native<K>(store: StoreKind, mut guard: PoolGuard<K>, timeout: Duration)
where
    K: StoreConnector,
    K::Connection: TransactionalConnection,
{
    match tokio::time::timeout(timeout, guard.rollback()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(store = %store, connection = guard.id(), "Native rollback failed: {e}");
            guard.discard().await;
        }
        Err(_) => {
            warn!(store = %store, connection = guard.id(), "Native rollback timed out");
            guard.discard().await;
        }
    }
}

/// Whether a failed native commit may still have been applied. A store that
/// answers with a refusal has not committed; a lost or silent one may have.
fn outcome_unknown(error: &StoreError) -> bool {
    matches!(error, StoreError::Timeout(_) | StoreError::Unreachable(_))
}

struct PreparedOnPool<K>
where
    K: StoreConnector,
    K::Connection: TransactionalConnection,
{
    store: StoreKind,
    guard: Option<PoolGuard<K>>,
    keys: Vec<String>,
    open: bool,
    rollback_timeout: Duration,
}

impl<K> PreparedOnPool<K>
where
    K: StoreConnector,
    K::Connection: TransactionalConnection,
{
    fn new(
        store: StoreKind,
        guard: PoolGuard<K>,
        keys: Vec<String>,
        rollback_timeout: Duration,
    ) -> Self {
        Self {
            store,
            guard: Some(guard),
            keys,
            open: true,
            rollback_timeout,
        }
    }

    /// Nothing to stage in this store.
    fn empty(store: StoreKind) -> Self {
        Self {
            store,
            guard: None,
            keys: Vec::new(),
            open: false,
            rollback_timeout: Duration::ZERO,
        }
    }
}

#[async_trait]
impl<K> PreparedWork for PreparedOnPool<K>
where
    K: StoreConnector,
    K::Connection: TransactionalConnection,
{
    fn store(&self) -> StoreKind {
        self.store
    }

    async fn commit(&mut self, timeout: Duration) -> Result<(), TransactionError> {
        let store = self.store;
        if !self.open {
            return Ok(());
        }
        let Some(guard) = self.guard.as_mut() else {
            return Ok(());
        };

        let committed = match tokio::time::timeout(timeout, guard.commit()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };
        match committed {
            Ok(()) => self.open = false,
            Err(source) if outcome_unknown(&source) => {
                self.open = false;
                if let Some(guard) = self.guard.take() {
                    guard.discard().await;
                }
                warn!(store = %store, "Native commit unanswered: {source}");
                return Err(TransactionError::CommitUnconfirmed { store, source });
            }
            Err(source) => return Err(TransactionError::Store { store, source }),
        }
        let Some(guard) = self.guard.as_mut() else {
            return Ok(());
        };

        let mut missing = Vec::new();
        for key in &self.keys {
            match tokio::time::timeout(timeout, guard.contains(key)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => missing.push(key.clone()),
                Ok(Err(e)) => {
                    debug!(store = %store, key = %key, "Presence check failed: {e}");
                    missing.push(key.clone());
                }
                Err(_) => missing.push(key.clone()),
            }
        }
        self.guard = None;

        if missing.is_empty() {
            Ok(())
        } else {
            Err(TransactionError::NotVisible { store, missing })
        }
    }

    async fn rollback(&mut self, timeout: Duration) -> Result<(), TransactionError> {
        let store = self.store;
        if !self.open {
            self.guard = None;
            return Ok(());
        }
        let Some(mut guard) = self.guard.take() else {
            return Ok(());
        };
        self.open = false;

        let result = match tokio::time::timeout(timeout, guard.rollback()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(source)) => Err(TransactionError::Store { store, source }),
            Err(_) => Err(TransactionError::Store {
                store,
                source: StoreError::Timeout(timeout),
            }),
        };
        guard.discard().await;
        result
    }
}

impl<K> Drop for PreparedOnPool<K>
where
    K: StoreConnector,
    K::Connection: TransactionalConnection,
{
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        let store = self.store;
        let timeout = self.rollback_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let rolled_back = matches!(
                        tokio::time::timeout(timeout, guard.rollback()).await,
                        Ok(Ok(()))
                    );
                    if !rolled_back {
                        warn!(store = %store, "Abandoned native transaction did not roll back");
                        guard.discard().await;
                    }
                });
            }
            // No runtime: the next `begin` on this connection discards the
            // stale transaction.
            Err(_) => drop(guard),
        }
    }
}
