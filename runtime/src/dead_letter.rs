//! Dead-letter queue administration.
//!
//! Operator actions over the dead-letter table plus the pipeline metrics
//! snapshot. Each dead-letter row is resolved once: a second retry or discard
//! fails with `ALREADY_RESOLVED`.

use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use relayflow_core::dead_letter::{
    DeadLetterError, DeadLetterPage, DeadLetterQuery, DeadLetterStore, Resolution,
};
use relayflow_core::environment::Clock;
use relayflow_core::outbox::OutboxStore;
use relayflow_core::transport::StreamTransport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Result of an operator action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReceipt {
    /// The dead-letter row acted on.
    pub event_id: Uuid,
    /// How it was resolved.
    pub status: Resolution,
    /// Human-readable summary.
    pub message: String,
}

/// Operator surface over the dead-letter queue.
#[derive(Clone)]
pub struct DeadLetterAdmin {
    dead_letters: Arc<dyn DeadLetterStore>,
    outbox: Arc<dyn OutboxStore>,
    transport: Arc<dyn StreamTransport>,
    clock: Arc<dyn Clock>,
    metrics: Arc<PipelineMetrics>,
    dlq_stream: String,
}

impl DeadLetterAdmin {
    /// Create the admin service.
    #[must_use]
    pub fn new(
        dead_letters: Arc<dyn DeadLetterStore>,
        outbox: Arc<dyn OutboxStore>,
        transport: Arc<dyn StreamTransport>,
        clock: Arc<dyn Clock>,
        metrics: Arc<PipelineMetrics>,
        dlq_stream: impl Into<String>,
    ) -> Self {
        Self {
            dead_letters,
            outbox,
            transport,
            clock,
            metrics,
            dlq_stream: dlq_stream.into(),
        }
    }

    /// List dead-letter rows, newest failure first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::DatabaseError`] if the query fails.
    pub async fn list(&self, query: DeadLetterQuery) -> Result<DeadLetterPage, DeadLetterError> {
        self.dead_letters.list(query.normalized()).await
    }

    /// Re-queue a dead-letter row as a fresh `PENDING` outbox row.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND`, `ALREADY_RESOLVED`, or a database error.
    pub async fn retry(&self, id: Uuid) -> Result<ResolutionReceipt, DeadLetterError> {
        let requeued = self.dead_letters.retry(id, self.clock.now()).await?;
        self.metrics.record_dlq_retry();

        tracing::info!(
            dead_letter_id = %id,
            outbox_id = %requeued.id,
            event_type = %requeued.event_type,
            "Dead-letter entry retried"
        );

        Ok(ResolutionReceipt {
            event_id: id,
            status: Resolution::Retried,
            message: format!("Event re-queued as outbox entry {}", requeued.id),
        })
    }

    /// Mark a dead-letter row discarded, recording the operator's reason.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND`, `ALREADY_RESOLVED`, or a database error.
    pub async fn discard(
        &self,
        id: Uuid,
        reason: impl Into<String>,
    ) -> Result<ResolutionReceipt, DeadLetterError> {
        let reason = reason.into();
        let entry = self
            .dead_letters
            .discard(id, reason.clone(), self.clock.now())
            .await?;
        self.metrics.record_dlq_discard();

        tracing::info!(
            dead_letter_id = %id,
            event_type = %entry.event_type,
            reason = %reason,
            "Dead-letter entry discarded"
        );

        Ok(ResolutionReceipt {
            event_id: id,
            status: Resolution::Discarded,
            message: format!("Event discarded: {reason}"),
        })
    }

    /// Counters plus live reads of the outbox table, the dead-letter table and
    /// the DLQ stream.
    ///
    /// An unreadable DLQ stream leaves `dlq_depth` empty; the table counts are
    /// still reported.
    ///
    /// # Errors
    ///
    /// Returns a [`DeadLetterError`] if either table read fails.
    pub async fn metrics_snapshot(&self) -> Result<MetricsSnapshot, DeadLetterError> {
        let status_counts = self.outbox.count_by_status().await?;
        let unresolved = self.dead_letters.count_unresolved().await?;
        let depth = match self.transport.len(&self.dlq_stream).await {
            Ok(depth) => {
                self.metrics.set_dlq_depth(depth);
                Some(depth)
            },
            Err(e) => {
                tracing::warn!(stream = %self.dlq_stream, error = %e, "DLQ stream length unavailable");
                None
            },
        };

        self.metrics.set_dlq_db_unresolved(unresolved);

        let counts = status_counts
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        Ok(MetricsSnapshot::new(
            self.metrics.counters(),
            counts,
            depth,
            unresolved,
        ))
    }
}
