//! Integration tests for the outbox relay against the in-memory doubles.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use relayflow_core::dead_letter::DeadLetterEntry;
use relayflow_core::environment::Clock;
use relayflow_core::outbox::{OutboxEntry, OutboxStatus};
use relayflow_core::transport::{StreamMessage, fields};
use relayflow_runtime::metrics::PipelineMetrics;
use relayflow_runtime::relay::{OutboxRelay, RelayConfig};
use relayflow_testing::fixtures::pending_entry;
use relayflow_testing::{InMemoryOutboxStore, ScriptedTransport, test_clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Harness {
    store: InMemoryOutboxStore,
    transport: ScriptedTransport,
    metrics: Arc<PipelineMetrics>,
    relay: OutboxRelay,
    shutdown: watch::Sender<bool>,
}

fn harness(config: RelayConfig) -> Harness {
    relayflow_testing::init_tracing();
    let store = InMemoryOutboxStore::new();
    let transport = ScriptedTransport::new();
    let metrics = Arc::new(PipelineMetrics::new());
    let (relay, shutdown) = OutboxRelay::new(
        Arc::new(store.clone()),
        Arc::new(transport.clone()),
        Arc::new(test_clock()),
        Arc::clone(&metrics),
        config,
    );
    Harness {
        store,
        transport,
        metrics,
        relay,
        shutdown,
    }
}

fn seconds_ago(seconds: i64) -> DateTime<Utc> {
    test_clock().now() - ChronoDuration::seconds(seconds)
}

fn seed(store: &InMemoryOutboxStore, event_type: &str, age_seconds: i64) -> OutboxEntry {
    let entry = pending_entry(event_type, seconds_ago(age_seconds));
    store.insert_entry(entry.clone());
    entry
}

#[tokio::test]
async fn one_failing_event_does_not_abort_the_batch() {
    let h = harness(RelayConfig::default());
    seed(&h.store, "WORKITEM_CREATED", 30);
    let bad = seed(&h.store, "WORKITEM_STARTED", 20);
    seed(&h.store, "WORKITEM_COMPLETED", 10);
    h.transport.fail_event_type("WORKITEM_STARTED");

    let report = h.relay.relay_once().await.unwrap();

    assert_eq!(report.claimed, 3);
    assert_eq!(report.published, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.dead_lettered, 0);

    assert_eq!(h.store.count(OutboxStatus::Published), 2);
    let failed = h.store.entry(bad.id).unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert!(failed.last_error.unwrap().contains("WORKITEM_STARTED"));

    // Each success is on the stream exactly once.
    assert_eq!(h.transport.stream_len("events:workitem"), 2);
    assert_eq!(h.metrics.counters().outbox_published_total, 2);
    assert_eq!(h.metrics.counters().outbox_failed_total, 1);
}

#[tokio::test]
async fn batch_is_published_oldest_first() {
    let h = harness(RelayConfig::default());
    let newest = seed(&h.store, "WORKITEM_COMPLETED", 1);
    let oldest = seed(&h.store, "WORKITEM_CREATED", 100);
    let middle = seed(&h.store, "WORKITEM_STARTED", 50);

    h.relay.relay_once().await.unwrap();

    let ids: Vec<String> = h
        .transport
        .messages("events:workitem")
        .iter()
        .map(|m| m.get(fields::EVENT_ID).unwrap().to_string())
        .collect();
    assert_eq!(
        ids,
        vec![oldest.id.to_string(), middle.id.to_string(), newest.id.to_string()]
    );
}

#[tokio::test]
async fn batch_size_limits_each_iteration() {
    let h = harness(RelayConfig::default().with_batch_size(2));
    for age in 0..5 {
        seed(&h.store, "PROCESS_INITIATED", age);
    }

    assert_eq!(h.relay.relay_once().await.unwrap().claimed, 2);
    assert_eq!(h.relay.relay_once().await.unwrap().claimed, 2);
    assert_eq!(h.relay.relay_once().await.unwrap().claimed, 1);
    assert_eq!(h.relay.relay_once().await.unwrap().claimed, 0);
    assert_eq!(h.transport.stream_len("events:process"), 5);
    assert_eq!(h.store.leased(), 0);
}

#[tokio::test]
async fn failure_at_the_ceiling_dead_letters_exactly_once() {
    let h = harness(RelayConfig::default());
    let mut entry = pending_entry("WORKITEM_SUBMITTED", seconds_ago(60));
    entry.retry_count = 2;
    h.store.insert_entry(entry.clone());
    h.transport
        .fail_event_type_on("events:workitem", "WORKITEM_SUBMITTED");

    let report = h.relay.relay_once().await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.failed, 0);
    let row = h.store.entry(entry.id).unwrap();
    assert_eq!(row.status, OutboxStatus::DeadLetter);
    assert_eq!(row.retry_count, 3);

    let dead = h.store.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_event_id, entry.id);
    assert_eq!(dead[0].retry_count, 3);
    assert_eq!(dead[0].payload, entry.payload);
    assert!(!dead[0].is_resolved());

    let dlq = h.transport.messages("events:dlq");
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].get(fields::EVENT_ID), Some(entry.id.to_string().as_str()));
    assert_eq!(dlq[0].get(fields::TARGET_STREAM), Some("events:workitem"));
    assert_eq!(h.metrics.counters().dlq_messages_total, 1);

    // Nothing left to sweep.
    let swept = h.relay.retry_failed_once(100).await.unwrap();
    assert_eq!(swept.requeued, 0);
    assert!(swept.dead_lettered.is_empty());
    assert_eq!(h.store.dead_letters().len(), 1);
}

#[tokio::test]
async fn repeated_failures_escalate_to_dead_letter() {
    let h = harness(RelayConfig::default());
    let entry = seed(&h.store, "CASE_OPENED", 5);
    h.transport.fail_event_type("CASE_OPENED");

    for attempt in 1..=2 {
        let report = h.relay.relay_once().await.unwrap();
        assert_eq!(report.failed, 1, "attempt {attempt}");
        assert_eq!(h.store.entry(entry.id).unwrap().retry_count, attempt);

        let requeue = h.relay.retry_failed_once(100).await.unwrap();
        assert_eq!(requeue.requeued, 1);
        assert_eq!(h.store.entry(entry.id).unwrap().status, OutboxStatus::Pending);
    }

    let report = h.relay.relay_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.store.entry(entry.id).unwrap().status, OutboxStatus::DeadLetter);
    assert_eq!(h.store.dead_letters().len(), 1);
    assert_eq!(h.transport.appends(), 4);
}

#[tokio::test]
async fn recovered_transport_publishes_requeued_rows() {
    let h = harness(RelayConfig::default());
    let entry = seed(&h.store, "DOCUMENT_UPLOADED", 5);
    h.transport.fail_next(1);

    h.relay.relay_once().await.unwrap();
    h.relay.retry_failed_once(100).await.unwrap();
    let report = h.relay.relay_once().await.unwrap();

    assert_eq!(report.published, 1);
    let row = h.store.entry(entry.id).unwrap();
    assert_eq!(row.status, OutboxStatus::Published);
    assert_eq!(row.published_at, Some(test_clock().now()));
    assert_eq!(h.transport.stream_len("events:document"), 1);
}

#[tokio::test]
async fn retry_failed_sweeps_rows_at_the_ceiling() {
    let h = harness(RelayConfig::default());
    let mut below = pending_entry("WORKITEM_CREATED", seconds_ago(20));
    below.status = OutboxStatus::Failed;
    below.retry_count = 1;
    let mut at = pending_entry("WORKITEM_STARTED", seconds_ago(10));
    at.status = OutboxStatus::Failed;
    at.retry_count = 3;
    at.last_error = Some("connection refused".to_string());
    h.store.insert_entry(below.clone());
    h.store.insert_entry(at.clone());

    let report = h.relay.retry_failed_once(100).await.unwrap();

    assert_eq!(report.requeued, 1);
    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(h.store.entry(below.id).unwrap().status, OutboxStatus::Pending);
    assert_eq!(h.store.entry(at.id).unwrap().status, OutboxStatus::DeadLetter);

    let dead = h.store.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].failure_reason, "connection refused");
    assert_eq!(h.transport.stream_len("events:dlq"), 1);
}

#[tokio::test]
async fn dlq_stream_outage_does_not_fail_the_batch() {
    let h = harness(RelayConfig::default().with_max_retries(1));
    let entry = seed(&h.store, "WORKITEM_CANCELLED", 5);
    h.transport.fail_event_type("WORKITEM_CANCELLED");
    h.transport.fail_stream("events:dlq");

    let report = h.relay.relay_once().await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    assert_eq!(h.store.entry(entry.id).unwrap().status, OutboxStatus::DeadLetter);
    assert_eq!(h.store.dead_letters().len(), 1);
    assert_eq!(h.transport.stream_len("events:dlq"), 0);
}

#[tokio::test]
async fn reprocess_replays_into_target_stream_and_removes_from_dlq() {
    let h = harness(RelayConfig::default());
    let entry = pending_entry("WORKITEM_COMPLETED", seconds_ago(5));
    let dead = DeadLetterEntry::from_outbox(&entry, 3, "timeout", test_clock().now());
    h.transport
        .seed("events:dlq", StreamMessage::from_dead_letter(&dead, "events:workitem"));
    h.transport.seed(
        "events:dlq",
        StreamMessage::new()
            .with(fields::EVENT_ID, "legacy")
            .with(fields::EVENT_TYPE, "PROCESS_COMPLETED"),
    );

    let report = h.relay.reprocess_dlq_once(10).await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(h.transport.stream_len("events:dlq"), 0);

    let replayed = h.transport.messages("events:workitem");
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].get(fields::EVENT_ID), Some(entry.id.to_string().as_str()));
    assert_eq!(replayed[0].get(fields::TARGET_STREAM), None);
    assert_eq!(replayed[0].get(fields::FAILURE_REASON), None);

    // No target recorded: routed by event type.
    assert_eq!(h.transport.stream_len("events:process"), 1);
    assert_eq!(h.metrics.counters().dlq_reprocess_success_total, 2);
}

#[tokio::test]
async fn failed_reprocess_keeps_the_message() {
    let h = harness(RelayConfig::default());
    let entry = pending_entry("WORKITEM_STARTED", seconds_ago(5));
    let dead = DeadLetterEntry::from_outbox(&entry, 3, "timeout", test_clock().now());
    h.transport
        .seed("events:dlq", StreamMessage::from_dead_letter(&dead, "events:workitem"));
    h.transport.fail_stream("events:workitem");

    let report = h.relay.reprocess_dlq_once(10).await.unwrap();

    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(h.transport.stream_len("events:dlq"), 1);
    assert_eq!(h.metrics.counters().dlq_reprocess_failed_total, 1);
}

#[tokio::test]
async fn reprocess_surfaces_dlq_read_failure() {
    let h = harness(RelayConfig::default());
    h.transport.fail_reads(true);

    assert!(h.relay.reprocess_dlq_once(10).await.is_err());
}

#[tokio::test]
async fn failing_dlq_message_does_not_block_the_ones_behind_it() {
    let h = harness(RelayConfig::default());
    let stuck = pending_entry("CASE_OPENED", seconds_ago(10));
    let healthy = pending_entry("WORKITEM_STARTED", seconds_ago(5));
    h.transport.seed(
        "events:dlq",
        StreamMessage::from_dead_letter(
            &DeadLetterEntry::from_outbox(&stuck, 3, "timeout", test_clock().now()),
            "events:case",
        ),
    );
    h.transport.seed(
        "events:dlq",
        StreamMessage::from_dead_letter(
            &DeadLetterEntry::from_outbox(&healthy, 3, "timeout", test_clock().now()),
            "events:workitem",
        ),
    );
    h.transport.fail_stream("events:case");

    let first = h.relay.reprocess_dlq_once(1).await.unwrap();
    assert_eq!((first.succeeded, first.failed), (0, 1));

    let second = h.relay.reprocess_dlq_once(1).await.unwrap();
    assert_eq!((second.succeeded, second.failed), (1, 0));

    let replayed = h.transport.messages("events:workitem");
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].get(fields::EVENT_ID), Some(healthy.id.to_string().as_str()));

    // The failing message is still queued, now alone.
    let dlq = h.transport.messages("events:dlq");
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].get(fields::EVENT_ID), Some(stuck.id.to_string().as_str()));
}

#[tokio::test]
async fn run_replays_the_dlq_stream_when_enabled() {
    let h = harness(
        RelayConfig::default()
            .with_poll_interval(Duration::from_secs(3600))
            .with_dlq_reprocessing(true),
    );
    let entry = pending_entry("WORKITEM_COMPLETED", seconds_ago(5));
    let dead = DeadLetterEntry::from_outbox(&entry, 3, "timeout", test_clock().now());
    h.transport
        .seed("events:dlq", StreamMessage::from_dead_letter(&dead, "events:workitem"));

    let transport = h.transport.clone();
    let handle = tokio::spawn(h.relay.run());

    for _ in 0..100 {
        if transport.stream_len("events:workitem") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(transport.stream_len("events:workitem"), 1);
    assert_eq!(transport.stream_len("events:dlq"), 0);

    h.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("relay did not stop")
        .unwrap();
}

#[tokio::test]
async fn run_relays_until_shutdown() {
    let h = harness(RelayConfig::default().with_poll_interval(Duration::from_secs(3600)));
    seed(&h.store, "WORKITEM_CREATED", 5);

    let store = h.store.clone();
    let handle = tokio::spawn(h.relay.run());

    // First iteration runs before the first sleep.
    for _ in 0..100 {
        if store.count(OutboxStatus::Published) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.count(OutboxStatus::Published), 1);

    h.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("relay did not stop")
        .unwrap();
}

#[tokio::test]
async fn dropped_shutdown_sender_stops_the_relay() {
    let Harness {
        relay, shutdown, ..
    } = harness(RelayConfig::default().with_poll_interval(Duration::from_secs(3600)));

    let handle = tokio::spawn(relay.run());
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(shutdown);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("relay did not stop")
        .unwrap();
}
