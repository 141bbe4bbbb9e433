// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bounded connection pool.
//
// All bookkeeping lives in one `PoolState` behind a parking_lot mutex that is
// never held across an `.await`: store I/O (connect, ping, health check, close)
// always happens after the slot has been moved out of the shared state and
// counted as in flight, so `total()` never undercounts and the pool never
// exceeds `max_size`. The in-flight count is owned by an `InFlight` guard, so
// a caller that drops an `acquire` mid-await still gives the capacity back.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{validate_bounds, PoolConfig};
use crate::connection::{StoreConnection, StoreConnector};
use crate::error::PoolError;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Active,
    Unhealthy,
    Closed,
}

/// Metadata tracked for every connection the pool owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledConnection {
    pub id: u64,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
    pub health_check_failures: u32,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    /// Every connection the pool accounts for, including ones being opened.
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub unhealthy: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
    pub acquired_total: u64,
    pub timeouts_total: u64,
}

/// Result of one [`ConnectionPool::health_check_all`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckReport {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Destroyed after reaching the consecutive-failure limit.
    pub destroyed: usize,
    /// Destroyed for sitting idle past the TTL.
    pub recycled: usize,
    /// Opened to bring the pool back to `min_size`.
    pub created: usize,
}

/// Result of [`ConnectionPool::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Connections closed, whether idle at shutdown or returned in time.
    pub closed: usize,
    /// Connections still checked out when the wait ran out. They are closed
    /// as soon as their guard drops.
    pub forced: usize,
}

struct Slot<C> {
    meta: PooledConnection,
    conn: C,
    idle_since: Instant,
}

struct PoolState<C> {
    min_size: usize,
    max_size: usize,
    idle: VecDeque<Slot<C>>,
    unhealthy: Vec<Slot<C>>,
    active: HashMap<u64, PooledConnection>,
    /// Connections being opened or checked outside the lock.
    in_flight: usize,
    closed: bool,
    next_id: u64,
    created_total: u64,
    destroyed_total: u64,
    acquired_total: u64,
    timeouts_total: u64,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.unhealthy.len() + self.active.len() + self.in_flight
    }

    fn new_slot(&mut self, conn: C) -> Slot<C> {
        self.next_id += 1;
        self.created_total += 1;
        let now = Utc::now();
        Slot {
            meta: PooledConnection {
                id: self.next_id,
                state: ConnectionState::Idle,
                created_at: now,
                last_used: now,
                use_count: 0,
                health_check_failures: 0,
            },
            conn,
            idle_since: Instant::now(),
        }
    }
}

struct PoolInner<K: StoreConnector> {
    config: PoolConfig,
    connector: K,
    state: Mutex<PoolState<K::Connection>>,
    available: Notify,
    shutdown_tx: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<K: StoreConnector> PoolInner<K> {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Return a checked-out connection. Runs from `Drop`, so it cannot await.
    fn check_in(&self, mut slot: Slot<K::Connection>) {
        let surplus = {
            let mut state = self.state.lock();
            state.active.remove(&slot.meta.id);
            if state.closed || state.total() >= state.max_size {
                state.destroyed_total += 1;
                Some(slot)
            } else {
                slot.meta.state = ConnectionState::Idle;
                slot.meta.last_used = Utc::now();
                slot.idle_since = Instant::now();
                state.idle.push_back(slot);
                None
            }
        };
        self.available.notify_one();

        if let Some(slot) = surplus {
            debug!(pool = %self.name(), connection = slot.meta.id, "Closing surplus connection on release");
            spawn_close(slot.conn);
        }
    }

    /// Remove a checked-out connection from the books before destroying it.
    fn forget_active(&self, id: u64) {
        let mut state = self.state.lock();
        state.active.remove(&id);
        state.destroyed_total += 1;
    }
}

fn spawn_close<C: StoreConnection>(mut conn: C) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { conn.close().await });
    }
}

/// Capacity counted in `PoolState::in_flight` while store I/O runs outside
/// the lock, plus any slots that I/O is being done on.
///
/// [`InFlight::settle`] hands the slots back under the lock. If the guard is
/// dropped first, the count is released and the held connections closed.
struct InFlight<'a, K: StoreConnector> {
    inner: &'a PoolInner<K>,
    count: usize,
    held: Vec<Slot<K::Connection>>,
}

impl<'a, K: StoreConnector> InFlight<'a, K> {
    /// Take ownership of `count` units the caller already added to `in_flight`.
    fn opening(inner: &'a PoolInner<K>, count: usize) -> Self {
        Self {
            inner,
            count,
            held: Vec::new(),
        }
    }

    /// Like [`Self::opening`], one unit per held slot.
    fn holding(inner: &'a PoolInner<K>, held: Vec<Slot<K::Connection>>) -> Self {
        Self {
            inner,
            count: held.len(),
            held,
        }
    }

    fn settle(&mut self, state: &mut PoolState<K::Connection>) -> Vec<Slot<K::Connection>> {
        state.in_flight -= self.count;
        self.count = 0;
        std::mem::take(&mut self.held)
    }
}

impl<K: StoreConnector> Drop for InFlight<'_, K> {
    fn drop(&mut self) {
        if self.count == 0 {
            return;
        }
        let abandoned = std::mem::take(&mut self.held);
        {
            let mut state = self.inner.state.lock();
            state.in_flight -= self.count;
            state.destroyed_total += abandoned.len() as u64;
        }
        debug!(
            pool = %self.inner.name(),
            released = self.count,
            closing = abandoned.len(),
            "Abandoned in-flight connection work"
        );
        for slot in abandoned {
            spawn_close(slot.conn);
        }
        self.inner.available.notify_waiters();
    }
}

enum Verdict {
    Healthy,
    Failing,
    Doomed,
}

enum Step<C> {
    Check(Slot<C>),
    Open,
    Wait,
}

/// A bounded pool of connections to one store.
///
/// Cloning is cheap and shares the pool.
pub struct ConnectionPool<K: StoreConnector> {
    inner: Arc<PoolInner<K>>,
}

impl<K: StoreConnector> Clone for ConnectionPool<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: StoreConnector> ConnectionPool<K> {
    /// Validate `config` and open `min_size` connections.
    pub async fn new(connector: K, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);

        let pool = Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    min_size: config.min_size,
                    max_size: config.max_size,
                    idle: VecDeque::new(),
                    unhealthy: Vec::new(),
                    active: HashMap::new(),
                    in_flight: 0,
                    closed: false,
                    next_id: 0,
                    created_total: 0,
                    destroyed_total: 0,
                    acquired_total: 0,
                    timeouts_total: 0,
                }),
                config,
                connector,
                available: Notify::new(),
                shutdown_tx,
                maintenance: Mutex::new(None),
            }),
        };

        let created = pool.fill_to_min().await?;
        info!(
            pool = %pool.name(),
            store = %pool.inner.connector.store_name(),
            created = created,
            "Connection pool ready"
        );
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &K {
        &self.inner.connector
    }

    /// [`Self::acquire`] with the configured default timeout.
    pub async fn acquire_default(&self) -> Result<PoolGuard<K>, PoolError> {
        self.acquire(self.inner.config.acquire_timeout()).await
    }

    /// Check out a live connection, waiting up to `timeout` for one.
    ///
    /// Idle connections are liveness-checked on the way out; one that fails
    /// is destroyed and acquisition continues. When the pool is at
    /// `max_size`, the caller polls every `poll_interval` (or sooner, when a
    /// connection is released) until `timeout` runs out.
    pub async fn acquire(&self, timeout: Duration) -> Result<PoolGuard<K>, PoolError> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let step = {
                let mut state = inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed(inner.name().to_string()));
                }
                if let Some(mut slot) = state.idle.pop_front() {
                    slot.meta.state = ConnectionState::Active;
                    state.in_flight += 1;
                    Step::Check(slot)
                } else if state.total() < state.max_size {
                    state.in_flight += 1;
                    Step::Open
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Check(slot) => {
                    let mut checking = InFlight::holding(inner, vec![slot]);
                    let budget = inner
                        .config
                        .probe_timeout()
                        .min(deadline.saturating_duration_since(Instant::now()));
                    let outcome = tokio::time::timeout(budget, checking.held[0].conn.ping()).await;

                    let mut state = inner.state.lock();
                    let Some(mut slot) = checking.settle(&mut state).pop() else {
                        continue;
                    };
                    match outcome {
                        Ok(Ok(())) if !state.closed => return Ok(self.hand_out(&mut state, slot)),
                        Ok(Ok(())) => {
                            state.destroyed_total += 1;
                            drop(state);
                            spawn_close(slot.conn);
                            return Err(PoolError::Closed(inner.name().to_string()));
                        }
                        outcome => {
                            state.destroyed_total += 1;
                            drop(state);
                            let reason = match outcome {
                                Ok(Err(e)) => e.to_string(),
                                _ => format!("no answer within {budget:?}"),
                            };
                            warn!(
                                pool = %inner.name(),
                                connection = slot.meta.id,
                                "Destroying connection that failed liveness check: {reason}"
                            );
                            inner.available.notify_one();
                            slot.conn.close().await;
                        }
                    }
                }
                Step::Open => {
                    let mut opening = InFlight::opening(inner, 1);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let opened = tokio::time::timeout(remaining, inner.connector.connect()).await;
                    let mut state = inner.state.lock();
                    opening.settle(&mut state);
                    match opened {
                        Ok(Ok(conn)) => {
                            if state.closed {
                                drop(state);
                                spawn_close(conn);
                                return Err(PoolError::Closed(inner.name().to_string()));
                            }
                            let slot = state.new_slot(conn);
                            debug!(pool = %inner.name(), connection = slot.meta.id, "Opened connection");
                            return Ok(self.hand_out(&mut state, slot));
                        }
                        Ok(Err(source)) => {
                            drop(state);
                            inner.available.notify_one();
                            return Err(PoolError::Connect {
                                pool: inner.name().to_string(),
                                source,
                            });
                        }
                        Err(_) => {
                            state.timeouts_total += 1;
                            drop(state);
                            inner.available.notify_one();
                            return Err(PoolError::AcquireTimeout {
                                pool: inner.name().to_string(),
                                waited: started.elapsed(),
                            });
                        }
                    }
                }
                Step::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        inner.state.lock().timeouts_total += 1;
                        warn!(
                            pool = %inner.name(),
                            waited_ms = (now - started).as_millis() as u64,
                            "Connection pool exhausted"
                        );
                        return Err(PoolError::AcquireTimeout {
                            pool: inner.name().to_string(),
                            waited: now - started,
                        });
                    }
                    let nap = inner.config.poll_interval().min(deadline - now);
                    let _ = tokio::time::timeout(nap, inner.available.notified()).await;
                }
            }
        }
    }

    /// Book `slot` as checked out. The caller holds the state lock, so the
    /// move from in-flight to active is never observed half done.
    fn hand_out(
        &self,
        state: &mut PoolState<K::Connection>,
        mut slot: Slot<K::Connection>,
    ) -> PoolGuard<K> {
        slot.meta.state = ConnectionState::Active;
        slot.meta.use_count += 1;
        slot.meta.last_used = Utc::now();
        state.acquired_total += 1;
        state.active.insert(slot.meta.id, slot.meta.clone());
        PoolGuard {
            pool: Arc::clone(&self.inner),
            slot: Some(slot),
        }
    }

    /// Return a connection to the pool. Dropping the guard does the same.
    pub fn release(&self, guard: PoolGuard<K>) {
        drop(guard);
    }

    /// Change the size bounds.
    ///
    /// Idle connections above the new maximum are closed now; checked-out
    /// ones are closed when released. The pool is then topped up to the new
    /// minimum.
    pub async fn resize(&self, min_size: usize, max_size: usize) -> Result<(), PoolError> {
        validate_bounds(min_size, max_size)?;

        let surplus: Vec<Slot<K::Connection>> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::Closed(self.name().to_string()));
            }
            state.min_size = min_size;
            state.max_size = max_size;
            let excess = state.total().saturating_sub(max_size).min(state.idle.len());
            let surplus: Vec<_> = state.idle.drain(..excess).collect();
            state.destroyed_total += surplus.len() as u64;
            surplus
        };

        for mut slot in surplus {
            slot.conn.close().await;
        }
        info!(pool = %self.name(), min_size, max_size, "Connection pool resized");

        self.fill_to_min().await?;
        self.inner.available.notify_waiters();
        Ok(())
    }

    /// Open connections until the pool holds `min_size`.
    async fn fill_to_min(&self) -> Result<usize, PoolError> {
        let inner = &self.inner;
        let mut created = 0;
        loop {
            {
                let mut state = inner.state.lock();
                if state.closed || state.total() >= state.min_size {
                    return Ok(created);
                }
                state.in_flight += 1;
            }

            let mut opening = InFlight::opening(inner, 1);
            let opened = inner.connector.connect().await;
            let mut state = inner.state.lock();
            opening.settle(&mut state);
            match opened {
                Ok(conn) if !state.closed => {
                    let slot = state.new_slot(conn);
                    state.idle.push_back(slot);
                    created += 1;
                    drop(state);
                    inner.available.notify_one();
                }
                Ok(conn) => {
                    drop(state);
                    spawn_close(conn);
                    return Ok(created);
                }
                Err(source) => {
                    return Err(PoolError::Connect {
                        pool: inner.name().to_string(),
                        source,
                    });
                }
            }
        }
    }

    /// Probe every idle and unhealthy connection with a real round trip.
    ///
    /// A connection failing `max_health_failures` probes in a row is
    /// destroyed; a failing connection below that limit is held out of the
    /// available queue until a probe passes. Idle connections past the TTL
    /// are recycled without probing. The pool is then topped up to
    /// `min_size`.
    pub async fn health_check_all(&self) -> HealthCheckReport {
        let inner = &self.inner;
        let config = &inner.config;

        let mut checking = {
            let mut state = inner.state.lock();
            if state.closed {
                return HealthCheckReport::default();
            }
            let mut candidates: Vec<_> = state.idle.drain(..).collect();
            candidates.extend(state.unhealthy.drain(..));
            state.in_flight += candidates.len();
            InFlight::holding(inner, candidates)
        };

        let mut report = HealthCheckReport::default();
        let mut verdicts = Vec::with_capacity(checking.held.len());

        for slot in checking.held.iter_mut() {
            if slot.meta.state == ConnectionState::Idle && slot.idle_since.elapsed() >= config.idle_ttl()
            {
                report.recycled += 1;
                verdicts.push(Verdict::Doomed);
                continue;
            }

            report.probed += 1;
            let probe = tokio::time::timeout(config.probe_timeout(), slot.conn.health_probe()).await;
            if matches!(probe, Ok(Ok(()))) {
                slot.meta.health_check_failures = 0;
                slot.meta.state = ConnectionState::Idle;
                report.healthy += 1;
                verdicts.push(Verdict::Healthy);
            } else {
                slot.meta.health_check_failures += 1;
                if slot.meta.health_check_failures >= config.max_health_failures {
                    warn!(
                        pool = %inner.name(),
                        connection = slot.meta.id,
                        failures = slot.meta.health_check_failures,
                        "Destroying connection after repeated failed health probes"
                    );
                    report.destroyed += 1;
                    verdicts.push(Verdict::Doomed);
                } else {
                    debug!(
                        pool = %inner.name(),
                        connection = slot.meta.id,
                        failures = slot.meta.health_check_failures,
                        "Health probe failed"
                    );
                    slot.meta.state = ConnectionState::Unhealthy;
                    report.unhealthy += 1;
                    verdicts.push(Verdict::Failing);
                }
            }
        }

        let mut doomed = Vec::new();
        {
            let mut state = inner.state.lock();
            let checked = checking.settle(&mut state);
            for (slot, verdict) in checked.into_iter().zip(verdicts) {
                match verdict {
                    Verdict::Healthy if !state.closed => state.idle.push_back(slot),
                    Verdict::Failing if !state.closed => state.unhealthy.push(slot),
                    _ => doomed.push(slot),
                }
            }
            state.destroyed_total += doomed.len() as u64;
        }
        for mut slot in doomed {
            slot.conn.close().await;
        }
        inner.available.notify_waiters();

        match self.fill_to_min().await {
            Ok(created) => report.created = created,
            Err(e) => warn!(pool = %inner.name(), "Could not top up pool: {e}"),
        }
        report
    }

    /// Run [`Self::health_check_all`] every `health_check_interval` until
    /// [`Self::shutdown`]. Calling it twice has no effect.
    pub fn start_maintenance(&self) {
        let mut maintenance = self.inner.maintenance.lock();
        if maintenance.is_some() {
            return;
        }

        let weak: Weak<PoolInner<K>> = Arc::downgrade(&self.inner);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let period = self.inner.config.health_check_interval();

        *maintenance = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let pool = ConnectionPool { inner };
                        let report = pool.health_check_all().await;
                        debug!(
                            pool = %pool.name(),
                            probed = report.probed,
                            destroyed = report.destroyed,
                            recycled = report.recycled,
                            created = report.created,
                            "Pool maintenance pass"
                        );
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    /// Stop maintenance, close idle connections, wait up to `timeout` for
    /// checked-out connections to come back, and give up on the rest.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;

        let (parked, outstanding) = {
            let mut state = inner.state.lock();
            if state.closed {
                return ShutdownReport::default();
            }
            state.closed = true;
            let mut parked: Vec<_> = state.idle.drain(..).collect();
            parked.extend(state.unhealthy.drain(..));
            state.destroyed_total += parked.len() as u64;
            (parked, state.active.len())
        };
        inner.shutdown_tx.send_replace(true);
        inner.available.notify_waiters();

        let handle = inner.maintenance.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        let mut closed = parked.len();
        for mut slot in parked {
            slot.conn.close().await;
        }

        loop {
            let active = inner.state.lock().active.len();
            let now = Instant::now();
            if active == 0 || now >= deadline {
                break;
            }
            let nap = inner.config.poll_interval().min(deadline - now);
            let _ = tokio::time::timeout(nap, inner.available.notified()).await;
        }

        let forced = {
            let mut state = inner.state.lock();
            for meta in state.active.values_mut() {
                meta.state = ConnectionState::Closed;
            }
            state.active.len()
        };
        closed += outstanding.saturating_sub(forced);

        if forced > 0 {
            warn!(pool = %inner.name(), forced, "Shutdown gave up waiting for checked-out connections");
        }
        info!(pool = %inner.name(), closed, forced, "Connection pool shut down");
        ShutdownReport { closed, forced }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            name: self.name().to_string(),
            total: state.total(),
            idle: state.idle.len(),
            active: state.active.len(),
            unhealthy: state.unhealthy.len(),
            min_size: state.min_size,
            max_size: state.max_size,
            created_total: state.created_total,
            destroyed_total: state.destroyed_total,
            acquired_total: state.acquired_total,
            timeouts_total: state.timeouts_total,
        }
    }

    /// Metadata for every connection currently owned by the pool.
    pub fn connections(&self) -> Vec<PooledConnection> {
        let state = self.inner.state.lock();
        state
            .idle
            .iter()
            .chain(state.unhealthy.iter())
            .map(|slot| slot.meta.clone())
            .chain(state.active.values().cloned())
            .collect()
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PoolGuard<K: StoreConnector> {
    pool: Arc<PoolInner<K>>,
    slot: Option<Slot<K::Connection>>,
}

impl<K: StoreConnector> PoolGuard<K> {
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map(|s| s.meta.id).unwrap_or_default()
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub fn use_count(&self) -> u64 {
        self.slot.as_ref().map(|s| s.meta.use_count).unwrap_or_default()
    }

    /// Destroy the connection instead of returning it, e.g. after the caller
    /// saw it break mid-operation.
    pub async fn discard(mut self) {
        if let Some(mut slot) = self.slot.take() {
            self.pool.forget_active(slot.meta.id);
            debug!(pool = %self.pool.name(), connection = slot.meta.id, "Discarding connection");
            slot.conn.close().await;
            self.pool.available.notify_one();
        }
    }
}

impl<K: StoreConnector> Deref for PoolGuard<K> {
    type Target = K::Connection;

    fn deref(&self) -> &Self::Target {
        // `slot` is only taken by `discard` and `drop`, both of which consume the guard.
        &self.slot.as_ref().expect("pool guard used after release").conn
    }
}

impl<K: StoreConnector> DerefMut for PoolGuard<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot.as_mut().expect("pool guard used after release").conn
    }
}

impl<K: StoreConnector> Drop for PoolGuard<K> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.check_in(slot);
        }
    }
}

impl<K: StoreConnector> std::fmt::Debug for PoolGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("pool", &self.pool.name())
            .field("connection", &self.id())
            .finish()
    }
}
