//! Integration tests for dead-letter administration.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use chrono::Duration as ChronoDuration;
use relayflow_core::dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterQuery, Resolution};
use relayflow_core::environment::Clock;
use relayflow_core::outbox::OutboxStatus;
use relayflow_runtime::dead_letter::DeadLetterAdmin;
use relayflow_runtime::metrics::PipelineMetrics;
use relayflow_runtime::relay::{OutboxRelay, RelayConfig};
use relayflow_testing::fixtures::pending_entry;
use relayflow_testing::{InMemoryOutboxStore, ScriptedTransport, test_clock};
use std::sync::Arc;

struct Harness {
    store: InMemoryOutboxStore,
    transport: ScriptedTransport,
    metrics: Arc<PipelineMetrics>,
    admin: DeadLetterAdmin,
}

fn harness() -> Harness {
    let store = InMemoryOutboxStore::new();
    let transport = ScriptedTransport::new();
    let metrics = Arc::new(PipelineMetrics::new());
    let admin = DeadLetterAdmin::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(transport.clone()),
        Arc::new(test_clock()),
        Arc::clone(&metrics),
        "events:dlq",
    );
    Harness {
        store,
        transport,
        metrics,
        admin,
    }
}

/// A dead-lettered outbox row with its mirrored dead-letter row.
fn dead_letter(store: &InMemoryOutboxStore, tenant: &str, event_type: &str, age_minutes: i64) -> DeadLetterEntry {
    let now = test_clock().now();
    let mut entry = pending_entry(event_type, now - ChronoDuration::minutes(age_minutes + 5));
    entry.tenant_id = tenant.to_string();
    entry.status = OutboxStatus::DeadLetter;
    entry.retry_count = 3;
    store.insert_entry(entry.clone());

    let dead = DeadLetterEntry::from_outbox(
        &entry,
        3,
        "stream unavailable",
        now - ChronoDuration::minutes(age_minutes),
    );
    store.insert_dead_letter(dead.clone());
    dead
}

#[tokio::test]
async fn retry_requeues_a_fresh_pending_row() {
    let h = harness();
    let dead = dead_letter(&h.store, "tenant-1", "WORKITEM_COMPLETED", 1);

    let receipt = h.admin.retry(dead.id).await.unwrap();

    assert_eq!(receipt.event_id, dead.id);
    assert_eq!(receipt.status, Resolution::Retried);

    let pending = h.store.with_status(OutboxStatus::Pending);
    assert_eq!(pending.len(), 1);
    let requeued = &pending[0];
    assert_ne!(requeued.id, dead.original_event_id);
    assert_eq!(requeued.retry_count, 0);
    assert_eq!(requeued.payload, dead.payload);
    assert_eq!(requeued.event_type, "WORKITEM_COMPLETED");
    assert_eq!(requeued.tenant_id, "tenant-1");

    let resolved = h.store.dead_letters().pop().unwrap();
    assert_eq!(resolved.resolution, Some(Resolution::Retried));
    assert_eq!(resolved.resolved_at, Some(test_clock().now()));
    assert_eq!(h.metrics.counters().dlq_retry_total, 1);
}

#[tokio::test]
async fn second_action_on_the_same_row_conflicts() {
    let h = harness();
    let dead = dead_letter(&h.store, "tenant-1", "WORKITEM_STARTED", 1);

    h.admin.retry(dead.id).await.unwrap();

    let again = h.admin.retry(dead.id).await.unwrap_err();
    assert_eq!(again.code(), "ALREADY_RESOLVED");
    assert!(matches!(
        again,
        DeadLetterError::AlreadyResolved {
            resolution: Resolution::Retried,
            ..
        }
    ));

    let discard = h.admin.discard(dead.id, "too late").await.unwrap_err();
    assert_eq!(discard.code(), "ALREADY_RESOLVED");

    // Still exactly one requeued row.
    assert_eq!(h.store.count(OutboxStatus::Pending), 1);
    assert_eq!(h.metrics.counters().dlq_retry_total, 1);
    assert_eq!(h.metrics.counters().dlq_discard_total, 0);
}

#[tokio::test]
async fn discard_records_the_operator_reason() {
    let h = harness();
    let dead = dead_letter(&h.store, "tenant-1", "CASE_CLOSED", 1);

    let receipt = h.admin.discard(dead.id, "duplicate of case 42").await.unwrap();

    assert_eq!(receipt.status, Resolution::Discarded);
    let resolved = h.store.dead_letters().pop().unwrap();
    assert_eq!(resolved.resolution, Some(Resolution::Discarded));
    assert_eq!(
        resolved.failure_reason,
        "stream unavailable | Discarded: duplicate of case 42"
    );
    assert_eq!(h.store.count(OutboxStatus::Pending), 0);

    let retry = h.admin.retry(dead.id).await.unwrap_err();
    assert_eq!(retry.code(), "ALREADY_RESOLVED");
    assert_eq!(h.metrics.counters().dlq_discard_total, 1);
}

#[tokio::test]
async fn unknown_row_is_not_found() {
    let h = harness();
    let id = uuid::Uuid::new_v4();

    assert_eq!(h.admin.retry(id).await.unwrap_err().code(), "NOT_FOUND");
    assert_eq!(h.admin.discard(id, "x").await.unwrap_err().code(), "NOT_FOUND");
}

#[tokio::test]
async fn list_filters_by_tenant_and_orders_newest_first() {
    let h = harness();
    let oldest = dead_letter(&h.store, "tenant-1", "WORKITEM_CREATED", 30);
    let newest = dead_letter(&h.store, "tenant-1", "WORKITEM_STARTED", 1);
    let middle = dead_letter(&h.store, "tenant-1", "PROCESS_INITIATED", 10);
    dead_letter(&h.store, "tenant-2", "WORKITEM_CREATED", 1);

    let mut query = DeadLetterQuery::for_tenant("tenant-1");
    query.limit = 2;
    let page = h.admin.list(query.clone()).await.unwrap();

    assert_eq!(page.total, 3);
    assert_eq!(page.limit, 2);
    let ids: Vec<_> = page.items.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![newest.id, middle.id]);

    query.offset = 2;
    let page = h.admin.list(query).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, oldest.id);
}

#[tokio::test]
async fn list_filters_by_resolution_and_event_type() {
    let h = harness();
    let retried = dead_letter(&h.store, "tenant-1", "WORKITEM_CREATED", 3);
    let open = dead_letter(&h.store, "tenant-1", "WORKITEM_CREATED", 2);
    dead_letter(&h.store, "tenant-1", "PROCESS_INITIATED", 1);
    h.admin.retry(retried.id).await.unwrap();

    let mut query = DeadLetterQuery::for_tenant("tenant-1");
    query.resolved = Some(false);
    query.event_type = Some("WORKITEM_CREATED".to_string());
    let page = h.admin.list(query).await.unwrap();

    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, open.id);

    let mut query = DeadLetterQuery::for_tenant("tenant-1");
    query.resolved = Some(true);
    assert_eq!(h.admin.list(query).await.unwrap().items[0].id, retried.id);
}

#[tokio::test]
async fn list_clamps_out_of_range_paging() {
    let h = harness();
    dead_letter(&h.store, "tenant-1", "WORKITEM_CREATED", 1);

    let mut query = DeadLetterQuery::for_tenant("tenant-1");
    query.limit = 10_000;
    query.offset = -5;
    let page = h.admin.list(query).await.unwrap();

    assert_eq!(page.limit, 500);
    assert_eq!(page.offset, 0);
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn snapshot_reports_both_views_of_the_backlog() {
    let h = harness();
    let (relay, _shutdown) = OutboxRelay::new(
        Arc::new(h.store.clone()),
        Arc::new(h.transport.clone()),
        Arc::new(test_clock()),
        Arc::clone(&h.metrics),
        RelayConfig::default().with_max_retries(1),
    );
    h.store
        .insert_entry(pending_entry("WORKITEM_CREATED", test_clock().now()));
    h.store
        .insert_entry(pending_entry("WORKITEM_STARTED", test_clock().now()));
    h.transport
        .fail_event_type_on("events:workitem", "WORKITEM_STARTED");
    relay.relay_once().await.unwrap();

    let snapshot = h.admin.metrics_snapshot().await.unwrap();

    assert_eq!(snapshot.outbox_published_total, 1);
    assert_eq!(snapshot.outbox_failed_total, 1);
    assert_eq!(snapshot.dlq_messages_total, 1);
    assert_eq!(snapshot.dlq_depth, Some(1));
    assert_eq!(snapshot.dlq_db_unresolved, 1);
    assert_eq!(snapshot.outbox_pending, 0);
    assert_eq!(snapshot.outbox_status_counts["PUBLISHED"], 1);
    assert_eq!(snapshot.outbox_status_counts["DEAD_LETTER"], 1);
    assert_eq!(snapshot.outbox_status_counts["FAILED"], 0);

    let dead = h.store.dead_letters().pop().unwrap();
    h.admin.discard(dead.id, "known bad").await.unwrap();
    let snapshot = h.admin.metrics_snapshot().await.unwrap();
    assert_eq!(snapshot.dlq_db_unresolved, 0);
    // The stream copy is independent of the table.
    assert_eq!(snapshot.dlq_depth, Some(1));
}

#[tokio::test]
async fn unreadable_stream_still_reports_table_counts() {
    let h = harness();
    dead_letter(&h.store, "tenant-1", "WORKITEM_CREATED", 1);
    dead_letter(&h.store, "tenant-1", "WORKITEM_STARTED", 2);
    h.transport.fail_reads(true);

    let snapshot = h.admin.metrics_snapshot().await.unwrap();

    assert_eq!(snapshot.dlq_depth, None);
    assert_eq!(snapshot.dlq_db_unresolved, 2);
    assert_eq!(snapshot.outbox_status_counts["DEAD_LETTER"], 2);
}
