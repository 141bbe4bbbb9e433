// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable backend for recovery tickets, on a single redb file.
//
// redb calls block, so every operation runs on the blocking pool. Each write
// is its own redb write transaction; `apply_batch` puts the whole batch in one,
// which is what makes a ticket update plus its archive move atomic.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::backend::{BatchWrite, StorageBackend};
use crate::error::StorageError;

const KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("bistore_kv");

/// redb-backed [`StorageBackend`].
///
/// ```rust,no_run
/// use bistore_storage::redb_backend::RedbBackend;
/// use bistore_storage::StorageBackend;
///
/// # tokio_test::block_on(async {
/// let store = RedbBackend::open("/tmp/bistore-tickets.redb").unwrap();
/// store.put(b"ticket:1", b"{}").await.unwrap();
/// # });
/// ```
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbBackend {
    /// Open the file at `path`, creating it and its parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path).map_err(|e| {
            StorageError::BackendUnavailable(format!("open {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "opened redb ticket store");

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StorageError::BackendUnavailable(format!("blocking task: {e}")))?
    }
}

fn unavailable(what: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::BackendUnavailable(format!("{what}: {e}"))
}

fn corrupted(what: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::CorruptedData(format!("{what}: {e}"))
}

/// Run `writes` inside one redb write transaction.
fn write_all(db: &Database, writes: &[BatchWrite]) -> Result<Vec<bool>, StorageError> {
    let txn = db.begin_write().map_err(|e| unavailable("begin write", e))?;
    let mut removed = Vec::with_capacity(writes.len());
    {
        let mut table = txn
            .open_table(KV)
            .map_err(|e| unavailable("open table", e))?;
        for write in writes {
            match write {
                BatchWrite::Put { key, value } => {
                    table
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(|e| corrupted("insert", e))?;
                    removed.push(false);
                }
                BatchWrite::Delete { key } => {
                    let existed = table
                        .remove(key.as_slice())
                        .map_err(|e| corrupted("remove", e))?
                        .is_some();
                    removed.push(existed);
                }
            }
        }
    }
    txn.commit().map_err(|e| corrupted("commit", e))?;
    Ok(removed)
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend").field("path", &self.path).finish()
    }
}

#[async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| unavailable("begin read", e))?;
            // No table yet means nothing was ever written.
            let Ok(table) = txn.open_table(KV) else {
                return Ok(None);
            };
            let value = table
                .get(key.as_slice())
                .map_err(|e| corrupted("get", e))?;
            Ok(value.map(|v| v.value().to_vec()))
        })
        .await
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let write = BatchWrite::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.blocking(move |db| write_all(db, &[write]).map(|_| ()))
            .await
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, StorageError> {
        let write = BatchWrite::Delete { key: key.to_vec() };
        self.blocking(move |db| Ok(write_all(db, &[write])?.first().copied().unwrap_or(false)))
            .await
    }

    async fn scan_prefix(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let prefix = prefix.to_vec();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| unavailable("begin read", e))?;
            let Ok(table) = txn.open_table(KV) else {
                return Ok(Vec::new());
            };

            let mut rows = Vec::new();
            let range = table
                .range(prefix.as_slice()..)
                .map_err(|e| corrupted("range", e))?;
            for entry in range {
                if rows.len() >= limit {
                    break;
                }
                let (k, v) = entry.map_err(|e| corrupted("range entry", e))?;
                let k = k.value().to_vec();
                if !k.starts_with(&prefix) {
                    break;
                }
                rows.push((k, v.value().to_vec()));
            }
            Ok(rows)
        })
        .await
    }

    async fn apply_batch(&self, writes: &[BatchWrite]) -> Result<(), StorageError> {
        if writes.iter().any(|w| w.key().is_empty()) {
            return Err(StorageError::EmptyKey);
        }
        let writes = writes.to_vec();
        self.blocking(move |db| write_all(db, &writes).map(|_| ()))
            .await
    }

    async fn flush(&self) -> Result<(), StorageError> {
        // redb fsyncs on every commit.
        Ok(())
    }

    fn name(&self) -> &str {
        "redb"
    }
}
