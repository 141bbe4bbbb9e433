// SPDX-License-Identifier: PMPL-1.0-or-later
//! BiStore service registry
//!
//! An explicitly constructed container for the long-lived services shared by
//! every transaction: the two connection pools, the identity registry and the
//! recovery coordinator. There is no global instance; the binary builds one
//! [`ServiceRegistry`] at start-up and passes it to whatever needs it.
//!
//! - creation is double-checked and runs each factory at most once at a time;
//! - every service has its own lock ([`ServiceRegistry::atomic_operation`]);
//! - `configure` and `reset` are applied by a single admin worker, in order.

mod admin;
mod error;
mod registry;

pub use admin::{AdminAction, AdminReceipt, ConfigChange, Configurable};
pub use error::RegistryError;
pub use registry::{ScopedLock, ServiceHandle, ServiceInfo, ServiceRegistry};
