// SPDX-License-Identifier: PMPL-1.0-or-later
//! Shared fixtures: two in-memory stores behind real pools.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use bistore_errors::{ErrorClassifier, RecoveryCoordinator};
use bistore_identity::{CanonicalId, CrossStoreIdRegistry, StoreIds};
use bistore_pool::{ConnectionPool, PoolConfig};
use bistore_txn::{
    CoordinatorConfig, KvConnector, KvStore, Operation, StoreKind, StoreParticipant, TicketStore,
    TwoPhaseCoordinator,
};

pub struct Harness {
    pub coordinator: Arc<TwoPhaseCoordinator>,
    pub graph: Arc<KvStore>,
    pub relational: Arc<KvStore>,
    pub graph_pool: ConnectionPool<KvConnector>,
    pub relational_pool: ConnectionPool<KvConnector>,
    pub identity: Arc<CrossStoreIdRegistry>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub tickets: TicketStore,
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        prepare_timeout_ms: 200,
        commit_timeout_ms: 200,
        rollback_timeout_ms: 200,
        ..CoordinatorConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(fast_config(), TicketStore::in_memory(), |c| c).await
}

pub async fn harness_with(
    config: CoordinatorConfig,
    tickets: TicketStore,
    customize: impl FnOnce(TwoPhaseCoordinator) -> TwoPhaseCoordinator,
) -> Harness {
    let graph = Arc::new(KvStore::in_memory("graph"));
    let relational = Arc::new(KvStore::in_memory("relational"));
    let graph_pool = ConnectionPool::new(
        KvConnector::new(Arc::clone(&graph)),
        PoolConfig::named("graph").with_size(1, 4),
    )
    .await
    .unwrap();
    let relational_pool = ConnectionPool::new(
        KvConnector::new(Arc::clone(&relational)),
        PoolConfig::named("relational").with_size(1, 4),
    )
    .await
    .unwrap();

    let identity = Arc::new(CrossStoreIdRegistry::new());
    let recovery = Arc::new(RecoveryCoordinator::new(ErrorClassifier::default()));
    let coordinator = TwoPhaseCoordinator::new(
        Arc::new(StoreParticipant::new(StoreKind::Graph, graph_pool.clone())),
        Arc::new(StoreParticipant::new(
            StoreKind::Relational,
            relational_pool.clone(),
        )),
        Arc::clone(&identity),
        Arc::clone(&recovery),
        tickets.clone(),
    )
    .with_config(config);

    Harness {
        coordinator: Arc::new(customize(coordinator)),
        graph,
        relational,
        graph_pool,
        relational_pool,
        identity,
        recovery,
        tickets,
    }
}

impl Harness {
    /// Register an entity present in both stores.
    pub fn entity(&self, name: &str) -> CanonicalId {
        self.identity
            .resolve_or_create(&StoreIds {
                graph: Some(format!("node:{name}")),
                relational: Some(format!("row:{name}")),
            })
            .unwrap()
            .canonical_id
    }

    /// One write per store for an entity.
    pub fn entity_batches(&self, name: &str) -> BTreeMap<StoreKind, Vec<Operation>> {
        let id = self.entity(name);
        let mut batches = BTreeMap::new();
        batches.insert(
            StoreKind::Graph,
            vec![Operation::new(StoreKind::Graph, format!("node:{name}"), b"{\"label\":\"E\"}".to_vec())
                .with_idempotency_key(format!("{name}-graph"))
                .for_entity(id)],
        );
        batches.insert(
            StoreKind::Relational,
            vec![Operation::new(StoreKind::Relational, format!("row:{name}"), b"id,label".to_vec())
                .with_idempotency_key(format!("{name}-relational"))
                .for_entity(id)],
        );
        batches
    }
}
