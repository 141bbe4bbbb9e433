// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// JSON-typed, namespaced view over a `StorageBackend`. Several logical stores
// (recovery tickets, participant rows) share one physical backend without key
// collisions because every key is written as `"{namespace}:{key}"`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::StorageBackend;
use crate::error::StorageError;

/// Serde wrapper around a shared backend.
#[derive(Clone)]
pub struct TypedStore {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
}

impl TypedStore {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: &str) -> Self {
        Self {
            backend,
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    fn key(&self, key: &str) -> Vec<u8> {
        format!("{}:{}", self.namespace, key).into_bytes()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.backend.get(&self.key(key)).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                StorageError::CorruptedData(format!(
                    "{}:{key} does not decode: {e}",
                    self.namespace
                ))
            }),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            StorageError::Serialization(format!("{}:{key}: {e}", self.namespace))
        })?;
        self.backend.put(&self.key(key), &bytes).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.backend.delete(&self.key(key)).await
    }

    /// Every value in the namespace, keyed by its logical key.
    pub async fn list<T: DeserializeOwned>(
        &self,
        limit: usize,
    ) -> Result<Vec<(String, T)>, StorageError> {
        let prefix = format!("{}:", self.namespace).into_bytes();
        let rows = self.backend.scan_prefix(&prefix, limit).await?;

        let mut out = Vec::with_capacity(rows.len());
        for (raw_key, raw_value) in rows {
            let key = String::from_utf8_lossy(&raw_key[prefix.len()..]).to_string();
            let value = serde_json::from_slice(&raw_value).map_err(|e| {
                StorageError::CorruptedData(format!(
                    "{}:{key} does not decode: {e}",
                    self.namespace
                ))
            })?;
            out.push((key, value));
        }
        Ok(out)
    }
}

impl std::fmt::Debug for TypedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedStore")
            .field("backend", &self.backend.name())
            .field("namespace", &self.namespace)
            .finish()
    }
}
