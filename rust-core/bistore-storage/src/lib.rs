// SPDX-License-Identifier: PMPL-1.0-or-later
//! BiStore storage
//!
//! Byte-keyed persistence for BiStore's own state: recovery tickets, the
//! identity export, and the rows of the in-memory participant stores used in
//! tests and benches.
//!
//! - [`InMemoryBackend`]: ordered map, always available.
//! - [`redb_backend::RedbBackend`]: single-file durable store (feature
//!   `redb-backend`).
//! - [`TypedStore`]: JSON values under a key namespace.

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "redb-backend")]
pub mod redb_backend;
pub mod typed;

pub use backend::{BatchWrite, StorageBackend};
pub use error::StorageError;
pub use memory::InMemoryBackend;
pub use typed::TypedStore;
