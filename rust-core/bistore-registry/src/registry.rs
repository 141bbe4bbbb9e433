// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service registry.
//
// The map lock (`services`) guards only the name -> slot map and is never held
// while a service is built, configured or used. Each slot carries its own
// `OnceCell` for creation and its own mutex for atomic operations, so work on
// one service never waits on another. That mutex is reentrant per tokio task:
// the task holding it may take it again without waiting on itself.

use std::any::{type_name, Any};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bistore_errors::Classify;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use crate::admin::{
    AdminCommand, AdminLog, AdminReceipt, AdminWorker, ConfigChange, Configurable, ServiceMap,
};
use crate::error::RegistryError;

const ADMIN_QUEUE_DEPTH: usize = 64;

type Instance = Arc<dyn Any + Send + Sync>;

pub(crate) struct ServiceSlot {
    name: String,
    instance: OnceCell<Instance>,
    lock: Arc<ServiceLock>,
    configurable: parking_lot::Mutex<Option<Arc<dyn Configurable>>>,
    history: parking_lot::Mutex<Vec<ConfigChange>>,
    registered_at: DateTime<Utc>,
}

impl ServiceSlot {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instance: OnceCell::new(),
            lock: Arc::new(ServiceLock::default()),
            configurable: parking_lot::Mutex::new(None),
            history: parking_lot::Mutex::new(Vec::new()),
            registered_at: Utc::now(),
        }
    }

    pub(crate) fn lock(&self) -> Arc<ServiceLock> {
        Arc::clone(&self.lock)
    }

    pub(crate) fn configurable(&self) -> Option<Arc<dyn Configurable>> {
        self.configurable.lock().clone()
    }

    pub(crate) fn record_config(&self, change: ConfigChange) {
        self.history.lock().push(change);
    }
}

/// A service's lock, reentrant for the tokio task that holds it.
///
/// Outside a tokio task the holder cannot be identified, and a second
/// acquire waits like any other caller.
#[derive(Default)]
pub(crate) struct ServiceLock {
    mutex: Arc<Mutex<()>>,
    holder: parking_lot::Mutex<Option<Holder>>,
}

struct Holder {
    task: Option<tokio::task::Id>,
    depth: usize,
    _guard: OwnedMutexGuard<()>,
}

impl ServiceLock {
    pub(crate) async fn acquire(self: Arc<Self>, service: &str) -> ScopedLock {
        let task = tokio::task::try_id();
        if task.is_some() {
            let mut holder = self.holder.lock();
            if let Some(h) = holder.as_mut().filter(|h| h.task == task) {
                h.depth += 1;
                drop(holder);
                return ScopedLock {
                    service: service.to_string(),
                    lock: self,
                };
            }
        }

        let guard = Arc::clone(&self.mutex).lock_owned().await;
        *self.holder.lock() = Some(Holder {
            task,
            depth: 1,
            _guard: guard,
        });
        ScopedLock {
            service: service.to_string(),
            lock: self,
        }
    }

    fn release(&self) {
        let mut holder = self.holder.lock();
        if let Some(h) = holder.as_mut() {
            h.depth -= 1;
            if h.depth == 0 {
                *holder = None;
            }
        }
    }
}

/// Shared handle to a registered service.
pub struct ServiceHandle<T> {
    name: String,
    instance: Arc<T>,
    lock: Arc<ServiceLock>,
}

impl<T> Clone for ServiceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            instance: Arc::clone(&self.instance),
            lock: Arc::clone(&self.lock),
        }
    }
}

impl<T> ServiceHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> Arc<T> {
        Arc::clone(&self.instance)
    }

    /// Take this service's lock. The task already holding it gets a nested
    /// guard at once; the lock is released when the outermost guard drops.
    pub async fn lock(&self) -> ScopedLock {
        Arc::clone(&self.lock).acquire(&self.name).await
    }
}

impl<T> Deref for ServiceHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.instance
    }
}

impl<T> std::fmt::Debug for ServiceHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("name", &self.name)
            .field("type", &type_name::<T>())
            .finish()
    }
}

/// Exclusive access to one service, released on drop.
pub struct ScopedLock {
    service: String,
    lock: Arc<ServiceLock>,
}

impl ScopedLock {
    pub fn service(&self) -> &str {
        &self.service
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl std::fmt::Debug for ScopedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedLock")
            .field("service", &self.service)
            .finish()
    }
}

/// Summary of a registered service.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub initialized: bool,
    pub configurable: bool,
    pub config_changes: usize,
    pub registered_at: DateTime<Utc>,
}

/// Container of shared, long-lived services, passed explicitly to whatever
/// needs them.
///
/// Must be created inside a tokio runtime: construction spawns the admin
/// worker.
pub struct ServiceRegistry {
    services: ServiceMap,
    admin: mpsc::Sender<AdminCommand>,
    admin_log: AdminLog,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let services: ServiceMap = Arc::new(RwLock::new(HashMap::new()));
        let admin_log: AdminLog = Arc::new(parking_lot::Mutex::new(VecDeque::new()));
        let (admin, commands) = mpsc::channel(ADMIN_QUEUE_DEPTH);

        let worker = AdminWorker::new(Arc::clone(&services), Arc::clone(&admin_log));
        tokio::spawn(worker.run(commands));

        Self {
            services,
            admin,
            admin_log,
        }
    }

    /// Slot for `name`, inserting an empty one if needed.
    ///
    /// Read-locked fast path, then write lock and recheck.
    async fn slot(&self, name: &str) -> Arc<ServiceSlot> {
        if let Some(slot) = self.services.read().await.get(name) {
            return Arc::clone(slot);
        }
        let mut services = self.services.write().await;
        Arc::clone(
            services
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ServiceSlot::new(name))),
        )
    }

    async fn existing_slot(&self, name: &str) -> Result<Arc<ServiceSlot>, RegistryError> {
        self.services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))
    }

    /// Return the service registered as `name`, building it with `factory`
    /// the first time.
    ///
    /// Concurrent first callers run the factory once; the others wait for it.
    /// A failed factory leaves the name unregistered so a later call can try
    /// again.
    pub async fn get_or_create<T, E, F, Fut>(
        &self,
        name: &str,
        factory: F,
    ) -> Result<ServiceHandle<T>, RegistryError>
    where
        T: Send + Sync + 'static,
        E: Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let slot = self.slot(name).await;
        let instance = slot
            .instance
            .get_or_try_init(|| async {
                let built = factory().await.map_err(|e| RegistryError::Factory {
                    name: name.to_string(),
                    category: e.category(),
                    message: e.to_string(),
                })?;
                info!(service = %name, kind = type_name::<T>(), "Service created");
                Ok::<Instance, RegistryError>(Arc::new(built))
            })
            .await?;

        let instance = Arc::clone(instance)
            .downcast::<T>()
            .map_err(|_| RegistryError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })?;

        Ok(ServiceHandle {
            name: name.to_string(),
            instance,
            lock: slot.lock(),
        })
    }

    /// [`Self::get_or_create`] for services that accept runtime configuration.
    pub async fn get_or_create_configurable<T, E, F, Fut>(
        &self,
        name: &str,
        factory: F,
    ) -> Result<ServiceHandle<T>, RegistryError>
    where
        T: Configurable + 'static,
        E: Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let handle = self.get_or_create(name, factory).await?;
        let slot = self.slot(name).await;
        let mut configurable = slot.configurable.lock();
        if configurable.is_none() {
            *configurable = Some(handle.instance() as Arc<dyn Configurable>);
        }
        Ok(handle)
    }

    /// The service registered as `name`, if it has been created.
    pub async fn get<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<ServiceHandle<T>, RegistryError> {
        let slot = self.existing_slot(name).await?;
        let instance = slot
            .instance
            .get()
            .cloned()
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?
            .downcast::<T>()
            .map_err(|_| RegistryError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })?;
        Ok(ServiceHandle {
            name: name.to_string(),
            instance,
            lock: slot.lock(),
        })
    }

    /// Take the lock of service `name`.
    ///
    /// Locks are per service: holding one never blocks operations on
    /// another. Reentrant within a tokio task, so a task already inside an
    /// atomic operation on `name` may start a nested one.
    pub async fn atomic_operation(&self, name: &str) -> Result<ScopedLock, RegistryError> {
        let slot = self.existing_slot(name).await?;
        let scoped = slot.lock().acquire(name).await;
        debug!(service = %name, "Atomic operation started");
        Ok(scoped)
    }

    pub async fn atomic_operation_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<ScopedLock, RegistryError> {
        let slot = self.existing_slot(name).await?;
        match tokio::time::timeout(timeout, slot.lock().acquire(name)).await {
            Ok(scoped) => Ok(scoped),
            Err(_) => Err(RegistryError::LockTimeout {
                name: name.to_string(),
                waited: timeout,
            }),
        }
    }

    /// Reconfigure service `name` through the admin queue.
    pub async fn configure(
        &self,
        name: &str,
        config: serde_json::Value,
    ) -> Result<AdminReceipt, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.admin
            .send(AdminCommand::Configure {
                name: name.to_string(),
                config,
                reply,
            })
            .await
            .map_err(|_| RegistryError::WorkerStopped)?;
        response.await.map_err(|_| RegistryError::WorkerStopped)?
    }

    /// Drop service `name` through the admin queue, after any in-flight
    /// atomic operation on it finishes. The next `get_or_create` builds a
    /// fresh instance; existing handles keep the old one alive.
    ///
    /// Returns `None` when nothing was registered under `name`.
    pub async fn reset(&self, name: &str) -> Result<Option<AdminReceipt>, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.admin
            .send(AdminCommand::Reset {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| RegistryError::WorkerStopped)?;
        response.await.map_err(|_| RegistryError::WorkerStopped)?
    }

    /// Accepted configurations of `name`, oldest first.
    pub async fn config_history(&self, name: &str) -> Result<Vec<ConfigChange>, RegistryError> {
        Ok(self.existing_slot(name).await?.history.lock().clone())
    }

    /// Recent administrative operations, oldest first.
    pub fn admin_log(&self) -> Vec<AdminReceipt> {
        self.admin_log.lock().iter().cloned().collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.services.read().await.contains_key(name)
    }

    pub async fn services(&self) -> Vec<ServiceInfo> {
        let services = self.services.read().await;
        let mut infos: Vec<ServiceInfo> = services
            .values()
            .map(|slot| ServiceInfo {
                name: slot.name.clone(),
                initialized: slot.instance.initialized(),
                configurable: slot.configurable.lock().is_some(),
                config_changes: slot.history.lock().len(),
                registered_at: slot.registered_at,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
