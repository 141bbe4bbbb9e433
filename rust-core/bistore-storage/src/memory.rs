// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory backend. A `BTreeMap` behind a tokio `RwLock`; ordering gives
// prefix scans for free. Cloning shares the same map.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::{BatchWrite, StorageBackend};
use crate::error::StorageError;

/// Process-local storage, lost on drop of the last clone.
///
/// ```rust
/// use bistore_storage::{InMemoryBackend, StorageBackend};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryBackend::new();
/// store.put(b"ticket:1", b"{}").await.unwrap();
/// assert_eq!(store.get(b"ticket:1").await.unwrap(), Some(b"{}".to_vec()));
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        self.data.write().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.data.write().await.remove(key).is_some())
    }

    async fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let map = self.data.read().await;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn apply_batch(&self, writes: &[BatchWrite]) -> Result<(), StorageError> {
        if writes.iter().any(|w| w.key().is_empty()) {
            return Err(StorageError::EmptyKey);
        }
        // One write guard for the whole batch: readers see all or nothing.
        let mut map = self.data.write().await;
        for write in writes {
            match write {
                BatchWrite::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                BatchWrite::Delete { key } => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
