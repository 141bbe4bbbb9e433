// SPDX-License-Identifier: PMPL-1.0-or-later
//! Service wiring.
//!
//! Every long-lived component is created through the [`ServiceRegistry`], so
//! the HTTP layer, the recovery worker and administrative reconfiguration all
//! share the same instances.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bistore_errors::{ErrorClassifier, RecoveryConfig, RecoveryCoordinator};
use bistore_identity::{CrossStoreIdRegistry, IdentityError};
use bistore_pool::{ConnectionPool, PoolConfig, PoolError};
use bistore_registry::{Configurable, ServiceRegistry};
use bistore_storage::{InMemoryBackend, StorageBackend};
use bistore_txn::{
    AutomaticReplay, CoordinatorShutdown, KvConnector, KvStore, ManualRecovery, RecoveryPolicy,
    StoreKind, StoreParticipant, TicketStore, TwoPhaseCoordinator,
};
use chrono::Utc;
use prometheus::{Registry, TextEncoder};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BistoreConfig, RecoveryMode};
use crate::error::ApiError;
use crate::health::{HealthReport, HealthStatus, OutstandingTicket};

pub const RECOVERY_SERVICE: &str = "recovery";
pub const IDENTITY_SERVICE: &str = "identity";
pub const COORDINATOR_SERVICE: &str = "coordinator";

/// Registry name of the pool service for a store.
pub fn pool_service(store: StoreKind) -> String {
    format!("pool.{store}")
}

/// One store and the pool in front of it.
pub struct PoolService {
    kind: StoreKind,
    store: Arc<KvStore>,
    pool: ConnectionPool<KvConnector>,
}

#[derive(Debug, Deserialize)]
struct PoolSize {
    min_size: usize,
    max_size: usize,
}

impl PoolService {
    async fn open(
        kind: StoreKind,
        backend: Arc<dyn StorageBackend>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        let store = Arc::new(KvStore::new(kind.as_str(), backend));
        let pool = ConnectionPool::new(KvConnector::new(Arc::clone(&store)), config).await?;
        pool.start_maintenance();
        Ok(Self { kind, store, pool })
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn pool(&self) -> &ConnectionPool<KvConnector> {
        &self.pool
    }
}

#[async_trait]
impl Configurable for PoolService {
    async fn reconfigure(&self, config: &serde_json::Value) -> Result<(), String> {
        let size: PoolSize = serde_json::from_value(config.clone())
            .map_err(|e| format!("expected {{\"min_size\", \"max_size\"}}: {e}"))?;
        self.pool
            .resize(size.min_size, size.max_size)
            .await
            .map_err(|e| e.to_string())
    }
}

/// A running BiStore instance.
pub struct BiStore {
    config: BistoreConfig,
    services: ServiceRegistry,
    metrics: Registry,
    coordinator: Arc<TwoPhaseCoordinator>,
    recovery: Arc<RecoveryCoordinator>,
    graph: Arc<PoolService>,
    relational: Arc<PoolService>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    started: Instant,
}

impl BiStore {
    /// Create every service, resume open recovery tickets and, in automatic
    /// mode, start the recovery worker.
    pub async fn bootstrap(config: BistoreConfig) -> Result<Self, ApiError> {
        config.validate()?;
        let services = ServiceRegistry::new();
        let metrics = Registry::new();

        let recovery = services
            .get_or_create(RECOVERY_SERVICE, || async {
                RecoveryCoordinator::with_config(
                    ErrorClassifier::new(config.classifier.clone()),
                    RecoveryConfig {
                        log_capacity: config.error_log_capacity,
                        metrics_window: Duration::from_secs(config.metrics_window_secs),
                    },
                )
                .with_prometheus(&metrics)
                .map_err(|e| ApiError::Startup(format!("error metrics: {e}")))
            })
            .await?
            .instance();

        let identity = services
            .get_or_create(IDENTITY_SERVICE, || async {
                Ok::<_, IdentityError>(CrossStoreIdRegistry::new())
            })
            .await?
            .instance();

        let graph = services
            .get_or_create_configurable(&pool_service(StoreKind::Graph), || async {
                let backend = open_backend(&config, "graph")?;
                PoolService::open(StoreKind::Graph, backend, config.graph_pool.clone())
                    .await
                    .map_err(ApiError::from)
            })
            .await?
            .instance();

        let relational = services
            .get_or_create_configurable(&pool_service(StoreKind::Relational), || async {
                let backend = open_backend(&config, "relational")?;
                PoolService::open(
                    StoreKind::Relational,
                    backend,
                    config.relational_pool.clone(),
                )
                .await
                .map_err(ApiError::from)
            })
            .await?
            .instance();

        let policy: Arc<dyn RecoveryPolicy> = match &config.recovery {
            RecoveryMode::Manual => Arc::new(ManualRecovery),
            RecoveryMode::Automatic { backoff } => Arc::new(AutomaticReplay::new(backoff.clone())),
        };

        let coordinator = services
            .get_or_create(COORDINATOR_SERVICE, || async {
                let tickets = TicketStore::new(open_backend(&config, "tickets")?);
                let rollback_timeout = config.coordinator.rollback_timeout();
                TwoPhaseCoordinator::new(
                    Arc::new(
                        StoreParticipant::new(StoreKind::Graph, graph.pool().clone())
                            .with_rollback_timeout(rollback_timeout),
                    ),
                    Arc::new(
                        StoreParticipant::new(StoreKind::Relational, relational.pool().clone())
                            .with_rollback_timeout(rollback_timeout),
                    ),
                    Arc::clone(&identity),
                    Arc::clone(&recovery),
                    tickets,
                )
                .with_config(config.coordinator.clone())
                .with_policy(Arc::clone(&policy))
                .with_prometheus(&metrics)
                .map_err(|e| ApiError::Startup(format!("transaction metrics: {e}")))
            })
            .await?
            .instance();

        coordinator.register_recovery_hooks().await;
        let resumed = coordinator.resume_pending().await?;
        if !resumed.is_empty() {
            warn!(tickets = resumed.len(), "Open recovery tickets from a previous run");
        }

        let worker = match config.recovery {
            RecoveryMode::Automatic { .. } => Some(coordinator.start_recovery_worker()),
            RecoveryMode::Manual => None,
        };

        info!(
            policy = policy.name(),
            persistent = config.data_dir.is_some(),
            "BiStore started"
        );

        Ok(Self {
            config,
            services,
            metrics,
            coordinator,
            recovery,
            graph,
            relational,
            worker: parking_lot::Mutex::new(worker),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &BistoreConfig {
        &self.config
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn coordinator(&self) -> &Arc<TwoPhaseCoordinator> {
        &self.coordinator
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }

    pub fn pool(&self, store: StoreKind) -> &Arc<PoolService> {
        match store {
            StoreKind::Graph => &self.graph,
            StoreKind::Relational => &self.relational,
        }
    }

    /// Pool sizes, error rates, transaction counts and outstanding recovery.
    pub async fn health_report(&self) -> HealthReport {
        let pools: Vec<_> = StoreKind::BOTH
            .iter()
            .map(|store| self.pool(*store).pool().stats())
            .collect();
        let outstanding: Vec<OutstandingTicket> = self
            .coordinator
            .open_tickets()
            .iter()
            .map(OutstandingTicket::from)
            .collect();

        let degraded = !outstanding.is_empty()
            || pools
                .iter()
                .any(|p| p.total < p.min_size || p.unhealthy > 0);

        HealthReport {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            pools,
            errors: self.recovery.metrics().await,
            transactions: self.coordinator.stats().await,
            outstanding_recovery: outstanding,
            generated_at: Utc::now(),
        }
    }

    /// Both pools accept work.
    pub fn ready(&self) -> bool {
        StoreKind::BOTH
            .iter()
            .all(|store| !self.pool(*store).pool().is_closed())
    }

    pub fn render_metrics(&self) -> Result<String, ApiError> {
        TextEncoder::new()
            .encode_to_string(&self.metrics.gather())
            .map_err(|e| ApiError::Internal(format!("metrics encoding: {e}")))
    }

    /// Stop the recovery worker, roll back unfinished transactions and
    /// close both pools.
    pub async fn shutdown(&self, timeout: Duration) -> CoordinatorShutdown {
        let report = self.coordinator.shutdown(timeout).await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Recovery worker ended abnormally: {e}");
            }
        }
        report
    }
}

#[cfg(feature = "persistent")]
fn open_backend(config: &BistoreConfig, name: &str) -> Result<Arc<dyn StorageBackend>, ApiError> {
    use bistore_storage::redb_backend::RedbBackend;

    match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let backend = RedbBackend::open(dir.join(format!("{name}.redb")))?;
            Ok(Arc::new(backend))
        }
        None => Ok(memory_backend(name)),
    }
}

#[cfg(not(feature = "persistent"))]
fn open_backend(config: &BistoreConfig, name: &str) -> Result<Arc<dyn StorageBackend>, ApiError> {
    if config.data_dir.is_some() {
        warn!(
            backend = name,
            "data_dir is set but this build lacks the 'persistent' feature; keeping data in memory"
        );
    }
    Ok(memory_backend(name))
}

fn memory_backend(name: &str) -> Arc<dyn StorageBackend> {
    tracing::debug!(backend = name, "Using in-memory backend");
    Arc::new(InMemoryBackend::new())
}
