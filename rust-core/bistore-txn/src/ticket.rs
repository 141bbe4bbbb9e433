// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Recovery tickets: the durable record of a partially committed transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use bistore_identity::StoreKind;
use bistore_storage::{InMemoryBackend, StorageBackend, StorageError, TypedStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Operation, ParticipantOutcome};

const TICKET_NAMESPACE: &str = "recovery_ticket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Resolved,
}

/// Everything needed to finish a transaction that committed in one store
/// but not the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryTicket {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Commit-phase result per store.
    pub participants: BTreeMap<StoreKind, ParticipantOutcome>,
    /// Operations still to be applied, per lagging store.
    pub lagging: BTreeMap<StoreKind, Vec<Operation>>,
    pub status: TicketStatus,
    /// Replay attempts so far.
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl RecoveryTicket {
    pub(crate) fn new(
        transaction_id: Uuid,
        participants: BTreeMap<StoreKind, ParticipantOutcome>,
        lagging: BTreeMap<StoreKind, Vec<Operation>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            created_at: Utc::now(),
            participants,
            lagging,
            status: TicketStatus::Open,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TicketStatus::Open
    }

    pub fn lagging_stores(&self) -> Vec<StoreKind> {
        self.lagging.keys().copied().collect()
    }
}

/// Persistence for recovery tickets over any [`StorageBackend`].
#[derive(Clone)]
pub struct TicketStore {
    store: TypedStore,
}

impl TicketStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            store: TypedStore::new(backend, TICKET_NAMESPACE),
        }
    }

    /// Tickets that do not survive a restart.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    pub async fn save(&self, ticket: &RecoveryTicket) -> Result<(), StorageError> {
        self.store.put(&ticket.id.to_string(), ticket).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<RecoveryTicket>, StorageError> {
        self.store.get(&id.to_string()).await
    }

    /// All tickets, oldest first.
    pub async fn all(&self) -> Result<Vec<RecoveryTicket>, StorageError> {
        let mut tickets: Vec<RecoveryTicket> = self
            .store
            .list(usize::MAX)
            .await?
            .into_iter()
            .map(|(_, ticket)| ticket)
            .collect();
        tickets.sort_by_key(|t| t.created_at);
        Ok(tickets)
    }

    pub async fn open_tickets(&self) -> Result<Vec<RecoveryTicket>, StorageError> {
        Ok(self.all().await?.into_iter().filter(|t| t.is_open()).collect())
    }

    /// Delete resolved tickets. Returns how many were removed.
    pub async fn purge_resolved(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for ticket in self.all().await? {
            if !ticket.is_open() && self.store.delete(&ticket.id.to_string()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ticket() -> RecoveryTicket {
        let mut participants = BTreeMap::new();
        participants.insert(StoreKind::Graph, ParticipantOutcome::Committed);
        participants.insert(
            StoreKind::Relational,
            ParticipantOutcome::Failed {
                error: "commit refused".into(),
            },
        );
        let mut lagging = BTreeMap::new();
        lagging.insert(
            StoreKind::Relational,
            vec![Operation::new(StoreKind::Relational, "row:1", b"payload".to_vec())],
        );
        RecoveryTicket::new(Uuid::new_v4(), participants, lagging)
    }

    #[tokio::test]
    async fn test_ticket_survives_store_round_trip() {
        let store = TicketStore::in_memory();
        let ticket = sample_ticket();
        store.save(&ticket).await.unwrap();

        let loaded = store.get(ticket.id).await.unwrap().unwrap();
        assert_eq!(loaded, ticket);
        assert_eq!(loaded.lagging_stores(), vec![StoreKind::Relational]);
    }

    #[tokio::test]
    async fn test_purge_keeps_open_tickets() {
        let store = TicketStore::in_memory();
        let open = sample_ticket();
        let mut resolved = sample_ticket();
        resolved.status = TicketStatus::Resolved;
        store.save(&open).await.unwrap();
        store.save(&resolved).await.unwrap();

        assert_eq!(store.purge_resolved().await.unwrap(), 1);
        let remaining = store.all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, open.id);
        assert_eq!(store.open_tickets().await.unwrap().len(), 1);
    }
}
