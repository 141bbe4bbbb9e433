// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Key-value backend contract used for BiStore's own durable state.

use async_trait::async_trait;

use crate::error::StorageError;

/// A write applied as part of [`StorageBackend::apply_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchWrite {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchWrite {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchWrite::Put { key, .. } | BatchWrite::Delete { key } => key,
        }
    }
}

/// Ordered byte-keyed storage.
///
/// Implementations must be safe to share across tokio tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// `Ok(None)` when the key is absent.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &[u8]) -> Result<bool, StorageError>;

    /// Up to `limit` entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply every write or none of them.
    async fn apply_batch(&self, writes: &[BatchWrite]) -> Result<(), StorageError>;

    /// Make previously acknowledged writes durable.
    async fn flush(&self) -> Result<(), StorageError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}
