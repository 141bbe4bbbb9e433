// SPDX-License-Identifier: PMPL-1.0-or-later
//! BiStore connection pools
//!
//! One [`ConnectionPool`] per participant store. A pool owns between
//! `min_size` and `max_size` live connections, hands them out behind a
//! [`PoolGuard`] that returns them on drop, liveness-checks every connection
//! on the way out, and runs a background health check that destroys
//! connections failing three probes in a row and recycles stale idle ones.
//!
//! Drivers plug in through [`StoreConnector`] and [`StoreConnection`].

mod config;
mod connection;
mod error;
mod pool;

pub use config::PoolConfig;
pub use connection::{StoreConnection, StoreConnector, StoreError};
pub use error::PoolError;
pub use pool::{
    ConnectionPool, ConnectionState, HealthCheckReport, PoolGuard, PoolStats, PooledConnection,
    ShutdownReport,
};
