// SPDX-License-Identifier: PMPL-1.0-or-later
//! Pool sizing and timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Configuration for one [`crate::ConnectionPool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name, used in logs, stats and metric labels.
    pub name: String,
    pub min_size: usize,
    pub max_size: usize,
    /// Default wait used by [`crate::ConnectionPool::acquire_default`].
    pub acquire_timeout_ms: u64,
    /// How long a waiter sleeps before re-checking an exhausted pool.
    pub poll_interval_ms: u64,
    /// Period of the background health check.
    pub health_check_interval_ms: u64,
    /// Bound on a single liveness check or health probe.
    pub probe_timeout_ms: u64,
    /// Idle connections older than this are recycled.
    pub idle_ttl_ms: u64,
    /// Consecutive failed probes before a connection is destroyed.
    pub max_health_failures: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_size: 2,
            max_size: 10,
            acquire_timeout_ms: 5_000,
            poll_interval_ms: 50,
            health_check_interval_ms: 30_000,
            probe_timeout_ms: 2_000,
            idle_ttl_ms: 600_000,
            max_health_failures: 3,
        }
    }
}

impl PoolConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        validate_bounds(self.min_size, self.max_size)?;
        if self.max_health_failures == 0 {
            return Err(PoolError::InvalidConfig(
                "max_health_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_bounds(min_size: usize, max_size: usize) -> Result<(), PoolError> {
    if max_size == 0 {
        return Err(PoolError::InvalidConfig("max_size must be at least 1".to_string()));
    }
    if min_size > max_size {
        return Err(PoolError::InvalidConfig(format!(
            "min_size {min_size} exceeds max_size {max_size}"
        )));
    }
    Ok(())
}
