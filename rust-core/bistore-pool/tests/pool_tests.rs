// SPDX-License-Identifier: PMPL-1.0-or-later
//! Connection pool behaviour against a scripted store driver.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bistore_errors::{Classify, ErrorCategory};
use bistore_pool::{
    ConnectionPool, PoolConfig, PoolError, StoreConnection, StoreConnector, StoreError,
};
use tokio::time::Instant;

#[derive(Clone, Default)]
struct Switches {
    refuse_connect: Arc<AtomicBool>,
    fail_ping: Arc<AtomicBool>,
    fail_probe: Arc<AtomicBool>,
    connect_delay_ms: Arc<AtomicU64>,
    ping_delay_ms: Arc<AtomicU64>,
    health_delay_ms: Arc<AtomicU64>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

async fn pause(delay_ms: &AtomicU64) {
    let ms = delay_ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

struct ScriptedConnector {
    switches: Switches,
}

struct ScriptedConnection {
    switches: Switches,
}

#[async_trait]
impl StoreConnection for ScriptedConnection {
    async fn ping(&mut self) -> Result<(), StoreError> {
        pause(&self.switches.ping_delay_ms).await;
        if self.switches.fail_ping.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("reset by peer".into()));
        }
        Ok(())
    }

    async fn health_probe(&mut self) -> Result<(), StoreError> {
        pause(&self.switches.health_delay_ms).await;
        if self.switches.fail_probe.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout(Duration::from_millis(10)));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.switches.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> Result<ScriptedConnection, StoreError> {
        pause(&self.switches.connect_delay_ms).await;
        if self.switches.refuse_connect.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("connection refused".into()));
        }
        self.switches.opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection {
            switches: self.switches.clone(),
        })
    }

    fn store_name(&self) -> &str {
        "scripted"
    }
}

async fn pool_with(
    min: usize,
    max: usize,
    tweak: impl FnOnce(&mut PoolConfig),
) -> (ConnectionPool<ScriptedConnector>, Switches) {
    let switches = Switches::default();
    let mut config = PoolConfig::named("graph").with_size(min, max);
    tweak(&mut config);
    let pool = ConnectionPool::new(
        ScriptedConnector {
            switches: switches.clone(),
        },
        config,
    )
    .await
    .unwrap();
    (pool, switches)
}

// -- Sizing --

#[tokio::test]
async fn test_new_opens_min_size() {
    let (pool, switches) = pool_with(2, 4, |_| {}).await;
    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(switches.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_new_fails_when_store_refuses() {
    let switches = Switches::default();
    switches.refuse_connect.store(true, Ordering::SeqCst);
    let result = ConnectionPool::new(
        ScriptedConnector { switches },
        PoolConfig::named("graph").with_size(1, 2),
    )
    .await;
    assert!(matches!(result, Err(PoolError::Connect { .. })));
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let (pool, switches) = pool_with(0, 2, |_| {}).await;

    let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let id = first.id();
    pool.release(first);

    let second = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(second.use_count(), 2);
    assert_eq!(switches.opened.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().acquired_total, 2);
}

#[tokio::test]
async fn test_concurrent_acquirers_never_exceed_max() {
    let (pool, _) = pool_with(0, 3, |c| c.poll_interval_ms = 5).await;

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let guard = pool.acquire(Duration::from_secs(5)).await.unwrap();
            let total = pool.stats().total;
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(guard);
            total
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap() <= 3);
    }
    let stats = pool.stats();
    assert!(stats.total <= 3);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.acquired_total, 12);
}

// -- Exhaustion (Scenario E) --

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_times_out_without_leaking() {
    let (pool, switches) = pool_with(0, 2, |_| {}).await;
    let held_a = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let held_b = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let started = Instant::now();
    let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, PoolError::AcquireTimeout { .. }));
    assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_millis(1_200));

    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.active, 2);
    assert_eq!(stats.timeouts_total, 1);
    assert_eq!(switches.opened.load(Ordering::SeqCst), 2);

    drop(held_a);
    drop(held_b);
    let stats = pool.stats();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.total, 2);
}

#[tokio::test]
async fn test_abandoned_acquire_while_connecting_returns_capacity() {
    let (pool, switches) = pool_with(0, 1, |_| {}).await;
    switches.connect_delay_ms.store(200, Ordering::SeqCst);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), pool.acquire(Duration::from_secs(5))).await;
    assert!(abandoned.is_err());

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.active, 0);

    switches.connect_delay_ms.store(0, Ordering::SeqCst);
    let guard = pool.acquire(Duration::from_millis(100)).await.unwrap();
    assert_eq!(pool.stats().total, 1);
    drop(guard);
}

#[tokio::test]
async fn test_abandoned_acquire_while_checking_closes_connection() {
    let (pool, switches) = pool_with(1, 1, |_| {}).await;
    switches.ping_delay_ms.store(200, Ordering::SeqCst);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), pool.acquire(Duration::from_secs(5))).await;
    assert!(abandoned.is_err());

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.destroyed_total, 1);

    switches.ping_delay_ms.store(0, Ordering::SeqCst);
    let guard = pool.acquire(Duration::from_millis(100)).await.unwrap();
    assert_eq!(pool.stats().active, 1);
    assert_eq!(switches.opened.load(Ordering::SeqCst), 2);
    drop(guard);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(switches.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_abandoned_health_check_releases_connections() {
    let (pool, switches) = pool_with(2, 2, |_| {}).await;
    switches.health_delay_ms.store(200, Ordering::SeqCst);

    let abandoned = tokio::time::timeout(Duration::from_millis(20), pool.health_check_all()).await;
    assert!(abandoned.is_err());

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.destroyed_total, 2);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(switches.closed.load(Ordering::SeqCst), 2);

    switches.health_delay_ms.store(0, Ordering::SeqCst);
    let report = pool.health_check_all().await;
    assert_eq!(report.created, 2);
    assert_eq!(pool.stats().idle, 2);
}

#[tokio::test]
async fn test_waiter_gets_released_connection() {
    let (pool, switches) = pool_with(0, 1, |_| {}).await;
    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|g| g.id()) })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let id = held.id();
    drop(held);

    assert_eq!(waiter.await.unwrap().unwrap(), id);
    assert_eq!(switches.opened.load(Ordering::SeqCst), 1);
}

// -- Liveness and health --

#[tokio::test]
async fn test_dead_idle_connection_is_replaced_on_acquire() {
    let (pool, switches) = pool_with(1, 2, |_| {}).await;
    switches.fail_ping.store(true, Ordering::SeqCst);

    let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(guard.id(), 2);

    let stats = pool.stats();
    assert_eq!(stats.destroyed_total, 1);
    assert_eq!(stats.created_total, 2);
    assert_eq!(switches.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_three_failed_probes_destroy_and_top_up() {
    let (pool, switches) = pool_with(1, 2, |_| {}).await;
    switches.fail_probe.store(true, Ordering::SeqCst);

    let first = pool.health_check_all().await;
    assert_eq!(first.unhealthy, 1);
    assert_eq!(pool.stats().unhealthy, 1);
    assert_eq!(pool.stats().idle, 0);

    // An unhealthy connection is never handed out.
    let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_ne!(guard.id(), 1);
    drop(guard);

    pool.health_check_all().await;
    switches.fail_probe.store(false, Ordering::SeqCst);
    let healed = pool.health_check_all().await;
    assert_eq!(healed.destroyed, 0);
    assert_eq!(pool.stats().unhealthy, 0);

    switches.fail_probe.store(true, Ordering::SeqCst);
    for _ in 0..2 {
        pool.health_check_all().await;
    }
    let third = pool.health_check_all().await;
    assert_eq!(third.destroyed, 2);
    assert_eq!(third.created, 1);

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.destroyed_total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_idle_connections_are_recycled() {
    let (pool, switches) = pool_with(1, 2, |c| c.idle_ttl_ms = 1_000).await;

    tokio::time::advance(Duration::from_secs(2)).await;
    let report = pool.health_check_all().await;

    assert_eq!(report.recycled, 1);
    assert_eq!(report.probed, 0);
    assert_eq!(report.created, 1);
    assert_eq!(pool.stats().total, 1);
    assert_eq!(switches.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_task_runs_health_checks() {
    let (pool, switches) = pool_with(1, 1, |c| c.health_check_interval_ms = 100).await;
    switches.fail_probe.store(true, Ordering::SeqCst);

    pool.start_maintenance();
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert!(pool.stats().destroyed_total >= 1);
    assert_eq!(pool.stats().total, 1);
    pool.shutdown(Duration::from_millis(100)).await;
}

// -- Resize, discard, shutdown --

#[tokio::test]
async fn test_resize_shrinks_and_grows() {
    let (pool, _) = pool_with(0, 4, |_| {}).await;
    let guards: Vec<_> = {
        let mut v = Vec::new();
        for _ in 0..3 {
            v.push(pool.acquire(Duration::from_secs(1)).await.unwrap());
        }
        v
    };
    drop(guards);
    assert_eq!(pool.stats().idle, 3);

    pool.resize(0, 1).await.unwrap();
    assert_eq!(pool.stats().total, 1);

    pool.resize(2, 3).await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!((stats.min_size, stats.max_size), (2, 3));

    assert!(matches!(pool.resize(3, 1).await, Err(PoolError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_checked_out_surplus_closes_on_release() {
    let (pool, _) = pool_with(0, 2, |_| {}).await;
    let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let b = pool.acquire(Duration::from_secs(1)).await.unwrap();

    pool.resize(0, 1).await.unwrap();
    drop(a);
    drop(b);

    assert_eq!(pool.stats().total, 1);
}

#[tokio::test]
async fn test_discard_destroys_connection() {
    let (pool, switches) = pool_with(0, 2, |_| {}).await;
    let guard = pool.acquire(Duration::from_secs(1)).await.unwrap();
    guard.discard().await;

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.destroyed_total, 1);
    assert_eq!(switches.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_failure_is_classified_and_not_counted() {
    let (pool, switches) = pool_with(0, 2, |_| {}).await;
    switches.refuse_connect.store(true, Ordering::SeqCst);

    let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NetworkFailure);
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_forces_outstanding_connections() {
    let (pool, switches) = pool_with(1, 2, |_| {}).await;
    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let spare = pool.acquire(Duration::from_secs(1)).await.unwrap();
    drop(spare);

    let report = pool.shutdown(Duration::from_millis(200)).await;
    assert_eq!(report.closed, 1);
    assert_eq!(report.forced, 1);
    assert!(pool.is_closed());
    assert!(matches!(
        pool.acquire(Duration::from_secs(1)).await,
        Err(PoolError::Closed(_))
    ));

    drop(held);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(switches.closed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_returning_connection() {
    let (pool, switches) = pool_with(0, 2, |_| {}).await;
    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
    });

    let report = pool.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.forced, 0);
    assert_eq!(report.closed, 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(switches.closed.load(Ordering::SeqCst), 1);
}
