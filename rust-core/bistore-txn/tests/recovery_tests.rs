// SPDX-License-Identifier: PMPL-1.0-or-later
//! Recovery ticket replay

mod common;

use std::sync::Arc;
use std::time::Duration;

use bistore_errors::RetryPolicy;
use bistore_storage::InMemoryBackend;
use bistore_txn::{
    AutomaticReplay, CommitOutcome, CoordinatorConfig, StoreKind, TicketStore, TransactionError,
    TransactionStatus,
};
use common::{fast_config, harness, harness_with, Harness};
use uuid::Uuid;

async fn partial_failure(h: &Harness, name: &str) -> Uuid {
    h.relational.faults().set_fail_commit(true);
    let outcome = h.coordinator.execute(h.entity_batches(name)).await.unwrap();
    h.relational.faults().set_fail_commit(false);
    match outcome {
        CommitOutcome::PartialFailure { ticket_id } => ticket_id,
        other => panic!("expected partial failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_replay_converges_to_committed() {
    let h = harness().await;
    let ticket_id = partial_failure(&h, "e1").await;
    let graph_writes = h.graph.writes_total();

    let report = h.coordinator.recover(ticket_id).await.unwrap();
    assert!(report.resolved);
    assert_eq!(report.replayed, vec![StoreKind::Relational]);
    assert!(report.lagging.is_empty());
    assert_eq!(report.attempts, 1);

    assert!(h.relational.contains("row:e1").await);
    assert_eq!(h.relational.writes_total(), 1);
    assert_eq!(h.graph.writes_total(), graph_writes);

    let summary = h.coordinator.summary(report.transaction_id).await.unwrap();
    assert_eq!(summary.status, TransactionStatus::Committed);
    assert!(!summary.recovery_needed);

    let stats = h.coordinator.stats().await;
    assert_eq!(stats.recovered, 1);
    assert_eq!(stats.open_tickets, 0);
}

#[tokio::test]
async fn test_replaying_resolved_ticket_changes_nothing() {
    let h = harness().await;
    let ticket_id = partial_failure(&h, "e1").await;
    h.coordinator.recover(ticket_id).await.unwrap();
    let writes = h.relational.writes_total();

    let again = h.coordinator.recover(ticket_id).await.unwrap();
    assert!(again.resolved);
    assert!(again.already_resolved);
    assert!(again.replayed.is_empty());
    assert_eq!(h.relational.writes_total(), writes);
    assert_eq!(h.coordinator.stats().await.recovered, 1);
}

#[tokio::test]
async fn test_replay_skips_operations_already_applied() {
    let h = harness().await;
    // Lost commit: the ticket asks for graph writes the store will accept
    // once the fault clears; the second replay must not write again.
    h.graph.faults().set_lose_commits(true);
    let outcome = h.coordinator.execute(h.entity_batches("e1")).await.unwrap();
    h.graph.faults().set_lose_commits(false);
    let CommitOutcome::PartialFailure { ticket_id } = outcome else {
        panic!("expected partial failure, got {outcome:?}");
    };

    let report = h.coordinator.recover(ticket_id).await.unwrap();
    assert!(report.resolved);
    assert!(h.graph.contains("node:e1").await);
    assert_eq!(h.graph.writes_total(), 1);

    // Replaying the same operations directly is a no-op.
    let ticket = h.tickets.get(ticket_id).await.unwrap().unwrap();
    assert!(ticket.lagging.is_empty());
    let ops = h.entity_batches("e1").remove(&StoreKind::Graph).unwrap();
    h.coordinator
        .replay(ticket.transaction_id, StoreKind::Graph, &ops, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(h.graph.writes_total(), 1);
    assert_eq!(h.graph.skipped_total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_replay_keeps_ticket_open() {
    let h = harness().await;
    let ticket_id = partial_failure(&h, "e1").await;
    h.relational.faults().set_fail_commit(true);

    let report = h.coordinator.recover(ticket_id).await.unwrap();
    assert!(!report.resolved);
    assert_eq!(report.lagging, vec![StoreKind::Relational]);
    assert!(report.error.is_some());

    let ticket = h.coordinator.ticket(ticket_id).await.unwrap().unwrap();
    assert!(ticket.is_open());
    assert_eq!(ticket.attempts, 1);
    assert_eq!(h.coordinator.open_tickets().len(), 1);
    assert_eq!(h.relational_pool.stats().active, 0);

    h.relational.faults().set_fail_commit(false);
    let report = h.coordinator.recover(ticket_id).await.unwrap();
    assert!(report.resolved);
    assert_eq!(report.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_rollback_during_replay_is_recorded() {
    let h = harness().await;
    let ticket_id = partial_failure(&h, "e1").await;
    let transaction_id = h.tickets.get(ticket_id).await.unwrap().unwrap().transaction_id;
    h.relational.faults().set_fail_commit(true);
    h.relational.faults().set_fail_rollback(true);

    let report = h.coordinator.recover(ticket_id).await.unwrap();
    assert!(!report.resolved);

    let records = h.recovery.records_for_transaction(transaction_id).await;
    assert!(records.iter().any(|r| r.context().operation == "rollback"
        && r.context().store.as_deref() == Some("relational")));
    assert_eq!(h.relational_pool.stats().active, 0);
}

#[tokio::test]
async fn test_unknown_ticket() {
    let h = harness().await;
    let err = h.coordinator.recover(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, TransactionError::TicketNotFound(_)));
}

#[tokio::test]
async fn test_manual_policy_leaves_tickets_alone() {
    let h = harness().await;
    partial_failure(&h, "e1").await;

    assert_eq!(h.coordinator.policy().name(), "manual");
    assert!(h.coordinator.recover_pending().await.is_empty());
    assert_eq!(h.coordinator.open_tickets().len(), 1);
}

#[tokio::test]
async fn test_automatic_policy_replays_due_tickets() {
    let policy = Arc::new(AutomaticReplay::new(RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 0,
        max_backoff_ms: 0,
        multiplier: 1.0,
    }));
    let h = harness_with(fast_config(), TicketStore::in_memory(), |c| c.with_policy(policy)).await;
    partial_failure(&h, "e1").await;
    partial_failure(&h, "e2").await;

    let reports = h.coordinator.recover_pending().await;
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.resolved));
    assert!(h.coordinator.open_tickets().is_empty());
    assert!(h.relational.contains("row:e2").await);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_worker_replays_in_background() {
    let config = CoordinatorConfig {
        recovery_interval_ms: 1_000,
        ..fast_config()
    };
    let policy = Arc::new(AutomaticReplay::new(RetryPolicy {
        max_attempts: 5,
        initial_backoff_ms: 0,
        max_backoff_ms: 0,
        multiplier: 1.0,
    }));
    let h = harness_with(config, TicketStore::in_memory(), |c| c.with_policy(policy)).await;
    let ticket_id = partial_failure(&h, "e1").await;

    let worker = h.coordinator.start_recovery_worker();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let ticket = h.coordinator.ticket(ticket_id).await.unwrap().unwrap();
    assert!(!ticket.is_open());

    h.coordinator.shutdown(Duration::from_millis(100)).await;
    worker.await.unwrap();
}

#[tokio::test]
async fn test_tickets_survive_coordinator_restart() {
    let backend = Arc::new(InMemoryBackend::new());
    let tickets = TicketStore::new(backend.clone());

    let first = harness_with(fast_config(), tickets.clone(), |c| c).await;
    let ticket_id = partial_failure(&first, "e1").await;
    let transaction_id = first.tickets.get(ticket_id).await.unwrap().unwrap().transaction_id;

    let second = harness_with(fast_config(), TicketStore::new(backend), |c| c).await;
    let resumed = second.coordinator.resume_pending().await.unwrap();
    assert_eq!(resumed, vec![ticket_id]);
    assert_eq!(
        second.coordinator.status(transaction_id).await,
        Some(TransactionStatus::PartialFailure)
    );

    let report = second.coordinator.recover(ticket_id).await.unwrap();
    assert!(report.resolved);
    assert!(second.relational.contains("row:e1").await);
    assert_eq!(
        second.coordinator.status(transaction_id).await,
        Some(TransactionStatus::Committed)
    );
}

#[tokio::test]
async fn test_purge_keeps_unrecovered_transactions() {
    let h = harness().await;
    h.coordinator.execute(h.entity_batches("e1")).await.unwrap();
    let open = partial_failure(&h, "e2").await;
    let resolved = partial_failure(&h, "e3").await;
    h.coordinator.recover(resolved).await.unwrap();

    let report = h.coordinator.purge_completed().await.unwrap();
    assert_eq!(report.transactions, 2);
    assert_eq!(report.tickets, 1);

    let history = h.coordinator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].ticket_id, Some(open));
}
