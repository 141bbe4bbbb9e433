// SPDX-License-Identifier: PMPL-1.0-or-later

use bistore_errors::ErrorMetrics;
use bistore_pool::PoolStats;
use bistore_txn::{CoordinatorStats, RecoveryTicket, StoreKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but a pool is below its minimum or has unhealthy
    /// connections, or a transaction is awaiting recovery.
    Degraded,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub pools: Vec<PoolStats>,
    pub errors: ErrorMetrics,
    pub transactions: CoordinatorStats,
    pub outstanding_recovery: Vec<OutstandingTicket>,
    pub generated_at: DateTime<Utc>,
}

/// An open recovery ticket as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutstandingTicket {
    pub ticket_id: Uuid,
    pub transaction_id: Uuid,
    pub lagging: Vec<StoreKind>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl From<&RecoveryTicket> for OutstandingTicket {
    fn from(ticket: &RecoveryTicket) -> Self {
        Self {
            ticket_id: ticket.id,
            transaction_id: ticket.transaction_id,
            lagging: ticket.lagging.keys().copied().collect(),
            attempts: ticket.attempts,
            created_at: ticket.created_at,
            last_error: ticket.last_error.clone(),
        }
    }
}
