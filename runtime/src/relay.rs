//! Outbox relay worker.
//!
//! A polling loop that moves `PENDING` outbox rows onto the stream transport:
//!
//! 1. lease a batch (`FOR UPDATE SKIP LOCKED` in Postgres, so several relays can
//!    run side by side without double-publishing or blocking each other)
//! 2. push each row to the stream its event type routes to
//! 3. mark it `PUBLISHED`, or count the failure: below the retry ceiling the row
//!    becomes `FAILED`, at the ceiling it becomes `DEAD_LETTER`, gets a mirrored
//!    dead-letter row, and a copy is pushed to the DLQ stream
//! 4. commit the batch
//!
//! One failing event never aborts the batch. Transport failures never reach the
//! business transaction that wrote the row; it committed long ago.
//!
//! # Shutdown
//!
//! [`OutboxRelay::new`] returns a `watch` sender. Sending `true` (or dropping
//! the sender) stops the loop between iterations; an in-flight batch always
//! completes.

use crate::metrics::PipelineMetrics;
use chrono::{DateTime, Utc};
use relayflow_core::dead_letter::DeadLetterEntry;
use relayflow_core::environment::Clock;
use relayflow_core::outbox::{OutboxError, OutboxStatus, OutboxStore, RequeueReport};
use relayflow_core::transport::{
    DEFAULT_DLQ_STREAM, DEFAULT_STREAM_MAX_LEN, StreamMessage, StreamRouter, StreamTransport,
    TransportError, fields,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Relay settings.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Sleep between iterations.
    pub poll_interval: Duration,
    /// Rows leased per iteration.
    pub batch_size: usize,
    /// Failed attempts after which a row is dead-lettered.
    pub max_retries: i32,
    /// Approximate length cap of every stream.
    pub stream_max_len: usize,
    /// Stream receiving copies of dead-lettered events.
    pub dlq_stream: String,
    /// Event type → stream routing.
    pub router: StreamRouter,
    /// Replay up to `batch_size` DLQ stream messages on every iteration.
    pub reprocess_dlq: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_retries: 3,
            stream_max_len: DEFAULT_STREAM_MAX_LEN,
            dlq_stream: DEFAULT_DLQ_STREAM.to_string(),
            router: StreamRouter::default(),
            reprocess_dlq: false,
        }
    }
}

impl RelayConfig {
    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the retry ceiling (at least 1).
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Set the stream length cap.
    #[must_use]
    pub const fn with_stream_max_len(mut self, stream_max_len: usize) -> Self {
        self.stream_max_len = stream_max_len;
        self
    }

    /// Set the DLQ stream.
    #[must_use]
    pub fn with_dlq_stream(mut self, dlq_stream: impl Into<String>) -> Self {
        self.dlq_stream = dlq_stream.into();
        self
    }

    /// Set the routing table.
    #[must_use]
    pub fn with_router(mut self, router: StreamRouter) -> Self {
        self.router = router;
        self
    }

    /// Replay the DLQ stream from the poll loop.
    #[must_use]
    pub const fn with_dlq_reprocessing(mut self, enabled: bool) -> Self {
        self.reprocess_dlq = enabled;
        self
    }
}

/// Outcome of one [`OutboxRelay::relay_once`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    /// Rows leased.
    pub claimed: usize,
    /// Rows marked `PUBLISHED`.
    pub published: usize,
    /// Rows marked `FAILED`.
    pub failed: usize,
    /// Rows marked `DEAD_LETTER`.
    pub dead_lettered: usize,
}

/// Outcome of one [`OutboxRelay::reprocess_dlq_once`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessReport {
    /// Messages replayed into their target stream and removed from the DLQ stream.
    pub succeeded: u64,
    /// Messages left on the DLQ stream.
    pub failed: u64,
}

/// The relay worker.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn StreamTransport>,
    clock: Arc<dyn Clock>,
    metrics: Arc<PipelineMetrics>,
    config: RelayConfig,
    shutdown: watch::Receiver<bool>,
}

impl OutboxRelay {
    /// Create a relay.
    ///
    /// Returns the relay and a shutdown sender. Send `true` to stop [`run`](Self::run).
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn StreamTransport>,
        clock: Arc<dyn Clock>,
        metrics: Arc<PipelineMetrics>,
        config: RelayConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let relay = Self {
            store,
            transport,
            clock,
            metrics,
            config,
            shutdown: shutdown_rx,
        };

        (relay, shutdown_tx)
    }

    /// Relay settings.
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Poll until shutdown.
    ///
    /// Each iteration relays one batch, requeues failed rows, replays the DLQ
    /// stream when [`RelayConfig::reprocess_dlq`] is set, refreshes the backlog
    /// gauges, then sleeps. Errors are logged and the loop continues.
    pub async fn run(mut self) {
        tracing::info!(
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Outbox relay started"
        );

        while !*self.shutdown.borrow() {
            self.iterate().await;

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                changed = self.shutdown.changed() => {
                    // A dropped sender can never signal again.
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox relay stopped");
    }

    async fn iterate(&self) {
        match self.relay_once().await {
            Ok(report) if report.claimed > 0 => {
                tracing::info!(
                    claimed = report.claimed,
                    published = report.published,
                    failed = report.failed,
                    dead_lettered = report.dead_lettered,
                    "Outbox batch relayed"
                );
            },
            Ok(_) => {},
            Err(e) => tracing::error!(error = %e, "Outbox relay iteration failed"),
        }

        if let Err(e) = self.retry_failed_once(self.config.batch_size).await {
            tracing::error!(error = %e, "Requeueing failed outbox rows failed");
        }

        if self.config.reprocess_dlq {
            if let Err(e) = self.reprocess_dlq_once(self.config.batch_size).await {
                tracing::error!(error = %e, "DLQ stream reprocessing failed");
            }
        }

        self.refresh_gauges().await;
    }

    /// Lease one batch of `PENDING` rows and deliver it.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if leasing, marking or committing the batch fails.
    /// Transport failures are not errors: they are recorded on the rows.
    pub async fn relay_once(&self) -> Result<RelayReport, OutboxError> {
        let mut batch = self.store.claim_pending(self.config.batch_size).await?;
        let entries = batch.entries().to_vec();
        let mut report = RelayReport {
            claimed: entries.len(),
            ..RelayReport::default()
        };
        let mut dead_letters: Vec<(DeadLetterEntry, String)> = Vec::new();

        for entry in &entries {
            let stream = self.config.router.stream_for(&entry.event_type);
            let message = StreamMessage::from_entry(entry);

            match self
                .transport
                .append(stream, &message, self.config.stream_max_len)
                .await
            {
                Ok(_) => {
                    let now = self.clock.now();
                    batch.mark_published(entry.id, now).await?;
                    self.metrics.record_published(lag(entry.created_at, now));
                    report.published += 1;
                    tracing::debug!(
                        event_id = %entry.id,
                        event_type = %entry.event_type,
                        stream,
                        "Event published"
                    );
                },
                Err(e) => {
                    let retry_count = entry.retry_count.saturating_add(1);
                    let reason = e.to_string();
                    self.metrics.record_failed();

                    if retry_count >= self.config.max_retries {
                        let dead = DeadLetterEntry::from_outbox(
                            entry,
                            retry_count,
                            reason,
                            self.clock.now(),
                        );
                        batch.mark_dead_letter(dead.clone()).await?;
                        report.dead_lettered += 1;
                        tracing::warn!(
                            event_id = %entry.id,
                            event_type = %entry.event_type,
                            retry_count,
                            error = %e,
                            "Event moved to dead-letter queue"
                        );
                        dead_letters.push((dead, stream.to_string()));
                    } else {
                        batch.mark_failed(entry.id, retry_count, reason).await?;
                        report.failed += 1;
                        tracing::warn!(
                            event_id = %entry.id,
                            event_type = %entry.event_type,
                            retry_count,
                            error = %e,
                            "Event publish failed"
                        );
                    }
                },
            }
        }

        batch.commit().await?;

        if !dead_letters.is_empty() {
            self.metrics
                .record_dead_lettered(u64::try_from(dead_letters.len()).unwrap_or(u64::MAX));
            for (dead, stream) in &dead_letters {
                self.push_dead_letter(dead, stream).await;
            }
        }

        Ok(report)
    }

    /// Move up to `limit` `FAILED` rows back to `PENDING`; sweep rows at or above
    /// the retry ceiling straight to `DEAD_LETTER`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the update fails.
    pub async fn retry_failed_once(&self, limit: usize) -> Result<RequeueReport, OutboxError> {
        let report = self
            .store
            .requeue_failed(limit, self.config.max_retries, self.clock.now())
            .await?;

        if report.requeued > 0 {
            tracing::info!(requeued = report.requeued, "Failed outbox rows requeued");
        }
        if !report.dead_lettered.is_empty() {
            tracing::warn!(
                dead_lettered = report.dead_lettered.len(),
                "Failed outbox rows at the retry ceiling dead-lettered"
            );
            self.metrics.record_dead_lettered(
                u64::try_from(report.dead_lettered.len()).unwrap_or(u64::MAX),
            );
            for dead in &report.dead_lettered {
                let stream = self.config.router.stream_for(&dead.event_type).to_string();
                self.push_dead_letter(dead, &stream).await;
            }
        }

        Ok(report)
    }

    /// Replay up to `count` messages from the DLQ stream into their target streams.
    ///
    /// A message is removed from the DLQ stream only once it was appended to its
    /// target stream. A message that cannot be replayed is re-appended at the
    /// tail of the DLQ stream (under a new id), so the next call reaches the
    /// messages queued behind it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the DLQ stream cannot be read. Per-message
    /// failures are counted, not returned.
    pub async fn reprocess_dlq_once(&self, count: usize) -> Result<ReprocessReport, TransportError> {
        let messages = self.transport.read(&self.config.dlq_stream, count).await?;
        let mut report = ReprocessReport::default();

        for (id, message) in messages {
            let target = message.get(fields::TARGET_STREAM).map_or_else(
                || {
                    self.config
                        .router
                        .stream_for(message.get(fields::EVENT_TYPE).unwrap_or_default())
                        .to_string()
                },
                ToString::to_string,
            );

            let outcome = async {
                self.transport
                    .append(
                        &target,
                        &message.without_dead_letter_fields(),
                        self.config.stream_max_len,
                    )
                    .await?;
                self.transport.delete(&self.config.dlq_stream, &id).await
            }
            .await;

            match outcome {
                Ok(()) => {
                    report.succeeded += 1;
                    self.metrics.record_reprocess(true);
                },
                Err(e) => {
                    report.failed += 1;
                    self.metrics.record_reprocess(false);
                    tracing::warn!(message_id = %id, stream = %target, error = %e, "DLQ reprocess failed");
                    self.rotate_dlq_message(&id, &message).await;
                },
            }
        }

        if report.succeeded + report.failed > 0 {
            tracing::info!(
                succeeded = report.succeeded,
                failed = report.failed,
                "DLQ stream reprocessed"
            );
        }

        Ok(report)
    }

    /// Move a message that failed to replay to the tail of the DLQ stream. If
    /// the re-append fails the message stays where it is.
    async fn rotate_dlq_message(&self, id: &str, message: &StreamMessage) {
        let stream = &self.config.dlq_stream;
        let rotated = async {
            self.transport
                .append(stream, message, self.config.stream_max_len)
                .await?;
            self.transport.delete(stream, id).await
        }
        .await;

        if let Err(e) = rotated {
            tracing::warn!(message_id = %id, error = %e, "Failed to rotate DLQ message");
        }
    }

    /// Refresh the `outbox_pending` and `dlq_depth` gauges. Failures are logged.
    pub async fn refresh_gauges(&self) {
        match self.store.count_by_status().await {
            Ok(counts) => self
                .metrics
                .set_outbox_pending(counts.get(&OutboxStatus::Pending).copied().unwrap_or(0)),
            Err(e) => tracing::warn!(error = %e, "Failed to count outbox rows"),
        }

        match self.transport.len(&self.config.dlq_stream).await {
            Ok(depth) => self.metrics.set_dlq_depth(depth),
            Err(e) => tracing::warn!(error = %e, "Failed to read DLQ stream length"),
        }
    }

    /// Best effort: the dead-letter row is already committed.
    async fn push_dead_letter(&self, dead: &DeadLetterEntry, target_stream: &str) {
        let message = StreamMessage::from_dead_letter(dead, target_stream);
        if let Err(e) = self
            .transport
            .append(&self.config.dlq_stream, &message, self.config.stream_max_len)
            .await
        {
            tracing::warn!(
                event_id = %dead.original_event_id,
                error = %e,
                "Failed to push dead-lettered event to DLQ stream"
            );
        }
    }
}

fn lag(created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - created_at).to_std().unwrap_or(Duration::ZERO)
}
