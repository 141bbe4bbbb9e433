// SPDX-License-Identifier: PMPL-1.0-or-later
//! Serialized administrative operations.
//!
//! `configure` and `reset` are sent to one worker task over an mpsc channel
//! and applied in arrival order, so every administrative change has a place
//! in a single total order (its `sequence`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::registry::ServiceSlot;

const ADMIN_LOG_CAPACITY: usize = 1_024;

/// A service that can be reconfigured at runtime.
#[async_trait]
pub trait Configurable: Send + Sync {
    /// Apply a new configuration. An `Err` leaves the previous one in force.
    async fn reconfigure(&self, config: &serde_json::Value) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    Configure,
    Reset,
}

/// Record of one applied administrative operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminReceipt {
    /// Position in the registry-wide order of administrative operations.
    pub sequence: u64,
    pub service: String,
    pub action: AdminAction,
    pub applied_at: DateTime<Utc>,
}

/// One accepted configuration of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub sequence: u64,
    pub config: serde_json::Value,
    pub applied_at: DateTime<Utc>,
}

pub(crate) enum AdminCommand {
    Configure {
        name: String,
        config: serde_json::Value,
        reply: oneshot::Sender<Result<AdminReceipt, RegistryError>>,
    },
    Reset {
        name: String,
        reply: oneshot::Sender<Result<Option<AdminReceipt>, RegistryError>>,
    },
}

pub(crate) type ServiceMap = Arc<RwLock<HashMap<String, Arc<ServiceSlot>>>>;
pub(crate) type AdminLog = Arc<parking_lot::Mutex<VecDeque<AdminReceipt>>>;

pub(crate) struct AdminWorker {
    services: ServiceMap,
    log: AdminLog,
    sequence: u64,
}

impl AdminWorker {
    pub(crate) fn new(services: ServiceMap, log: AdminLog) -> Self {
        Self {
            services,
            log,
            sequence: 0,
        }
    }

    /// Apply commands until every sender is dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<AdminCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                AdminCommand::Configure {
                    name,
                    config,
                    reply,
                } => {
                    let result = self.configure(&name, config).await;
                    let _ = reply.send(result);
                }
                AdminCommand::Reset { name, reply } => {
                    let result = self.reset(&name).await;
                    let _ = reply.send(result);
                }
            }
        }
        debug!("Registry admin worker stopped");
    }

    fn next_receipt(&mut self, service: &str, action: AdminAction) -> AdminReceipt {
        self.sequence += 1;
        let receipt = AdminReceipt {
            sequence: self.sequence,
            service: service.to_string(),
            action,
            applied_at: Utc::now(),
        };
        let mut log = self.log.lock();
        if log.len() == ADMIN_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(receipt.clone());
        receipt
    }

    async fn configure(
        &mut self,
        name: &str,
        config: serde_json::Value,
    ) -> Result<AdminReceipt, RegistryError> {
        let slot = self
            .services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?;

        let target = slot
            .configurable()
            .ok_or_else(|| RegistryError::NotConfigurable(name.to_string()))?;

        // The service's own lock, so reconfiguration never interleaves with
        // an atomic operation on the same service.
        let _guard = slot.lock().acquire(name).await;
        if let Err(reason) = target.reconfigure(&config).await {
            warn!(service = %name, "Configuration rejected: {reason}");
            return Err(RegistryError::ConfigRejected {
                name: name.to_string(),
                reason,
            });
        }

        let receipt = self.next_receipt(name, AdminAction::Configure);
        slot.record_config(ConfigChange {
            sequence: receipt.sequence,
            config,
            applied_at: receipt.applied_at,
        });
        info!(service = %name, sequence = receipt.sequence, "Service reconfigured");
        Ok(receipt)
    }

    async fn reset(&mut self, name: &str) -> Result<Option<AdminReceipt>, RegistryError> {
        let removed = self.services.write().await.remove(name);
        let Some(slot) = removed else {
            return Ok(None);
        };

        // Wait for in-flight atomic operations on the old instance.
        let _guard = slot.lock().acquire(name).await;
        let receipt = self.next_receipt(name, AdminAction::Reset);
        info!(service = %name, sequence = receipt.sequence, "Service reset");
        Ok(Some(receipt))
    }
}
