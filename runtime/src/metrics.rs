//! Prometheus metrics for the event pipeline.
//!
//! Every counter and gauge goes through the `metrics` facade under the names in
//! [`names`], so whatever recorder the binary installs (normally the Prometheus
//! exporter, see [`PrometheusExporter`]) sees them.
//!
//! Facade values cannot be read back, so [`PipelineMetrics`] also keeps atomic
//! mirrors of the process-local counters. The admin snapshot is built from those
//! mirrors plus live reads of the outbox table, the dead-letter table and the DLQ
//! stream.
//!
//! # Example
//!
//! ```rust,no_run
//! use relayflow_runtime::metrics::PrometheusExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let exporter = PrometheusExporter::install()?;
//! println!("{}", exporter.render());
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Metric names.
pub mod names {
    /// Outbox rows delivered to their stream.
    pub const OUTBOX_PUBLISHED_TOTAL: &str = "outbox_published_total";
    /// Failed delivery attempts (including the last one before dead-lettering).
    pub const OUTBOX_FAILED_TOTAL: &str = "outbox_failed_total";
    /// Rows moved to the dead-letter queue.
    pub const DLQ_MESSAGES_TOTAL: &str = "dlq_messages_total";
    /// DLQ stream messages replayed into their target stream.
    pub const DLQ_REPROCESS_SUCCESS_TOTAL: &str = "dlq_reprocess_success_total";
    /// DLQ stream messages that could not be replayed.
    pub const DLQ_REPROCESS_FAILED_TOTAL: &str = "dlq_reprocess_failed_total";
    /// Operator retries of dead-letter rows.
    pub const DLQ_RETRY_TOTAL: &str = "dlq_retry_total";
    /// Operator discards of dead-letter rows.
    pub const DLQ_DISCARD_TOTAL: &str = "dlq_discard_total";
    /// Length of the DLQ stream.
    pub const DLQ_DEPTH: &str = "dlq_depth";
    /// Seconds between outbox insert and delivery of the last published row.
    pub const RELAY_LAG_SECONDS: &str = "relay_lag_seconds";
    /// `PENDING` outbox rows.
    pub const OUTBOX_PENDING: &str = "outbox_pending";
    /// Unresolved dead-letter rows.
    pub const DLQ_DB_UNRESOLVED: &str = "dlq_db_unresolved";
}

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        names::OUTBOX_PUBLISHED_TOTAL,
        "Total number of outbox events delivered to the stream transport"
    );
    describe_counter!(
        names::OUTBOX_FAILED_TOTAL,
        "Total number of failed outbox delivery attempts"
    );
    describe_counter!(
        names::DLQ_MESSAGES_TOTAL,
        "Total number of outbox events moved to the dead-letter queue"
    );
    describe_counter!(
        names::DLQ_REPROCESS_SUCCESS_TOTAL,
        "Total number of DLQ stream messages replayed successfully"
    );
    describe_counter!(
        names::DLQ_REPROCESS_FAILED_TOTAL,
        "Total number of DLQ stream messages that failed to replay"
    );
    describe_counter!(
        names::DLQ_RETRY_TOTAL,
        "Total number of dead-letter entries retried by an operator"
    );
    describe_counter!(
        names::DLQ_DISCARD_TOTAL,
        "Total number of dead-letter entries discarded by an operator"
    );
    describe_gauge!(names::DLQ_DEPTH, "Current length of the DLQ stream");
    describe_gauge!(
        names::RELAY_LAG_SECONDS,
        "Delay between outbox insert and delivery of the last published event"
    );
    describe_gauge!(names::OUTBOX_PENDING, "Current number of PENDING outbox rows");
    describe_gauge!(
        names::DLQ_DB_UNRESOLVED,
        "Current number of unresolved dead-letter rows"
    );
}

/// Installed Prometheus recorder.
#[derive(Clone)]
pub struct PrometheusExporter {
    handle: PrometheusHandle,
}

impl fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

impl PrometheusExporter {
    /// Install the Prometheus recorder globally and describe every metric.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a recorder is already installed. In
    /// production, ensure this is only called once.
    pub fn install() -> Result<Self, MetricsError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();
        tracing::info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    /// A recorder that is not installed globally; renders nothing the facade
    /// records. For tests and tools that need a handle.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            handle: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Process-local pipeline counters, mirrored into the `metrics` facade.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    published: AtomicU64,
    failed: AtomicU64,
    dlq_messages: AtomicU64,
    reprocess_success: AtomicU64,
    reprocess_failed: AtomicU64,
    dlq_retry: AtomicU64,
    dlq_discard: AtomicU64,
    relay_lag_micros: AtomicU64,
}

impl PipelineMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An event was delivered `lag` after its outbox insert.
    pub fn record_published(&self, lag: Duration) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(lag.as_micros()).unwrap_or(u64::MAX);
        self.relay_lag_micros.store(micros, Ordering::Relaxed);
        counter!(names::OUTBOX_PUBLISHED_TOTAL).increment(1);
        gauge!(names::RELAY_LAG_SECONDS).set(lag.as_secs_f64());
    }

    /// A delivery attempt failed.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        counter!(names::OUTBOX_FAILED_TOTAL).increment(1);
    }

    /// `count` rows were moved to the dead-letter queue.
    pub fn record_dead_lettered(&self, count: u64) {
        self.dlq_messages.fetch_add(count, Ordering::Relaxed);
        counter!(names::DLQ_MESSAGES_TOTAL).increment(count);
    }

    /// A DLQ stream message was replayed (or not).
    pub fn record_reprocess(&self, success: bool) {
        if success {
            self.reprocess_success.fetch_add(1, Ordering::Relaxed);
            counter!(names::DLQ_REPROCESS_SUCCESS_TOTAL).increment(1);
        } else {
            self.reprocess_failed.fetch_add(1, Ordering::Relaxed);
            counter!(names::DLQ_REPROCESS_FAILED_TOTAL).increment(1);
        }
    }

    /// An operator retried a dead-letter row.
    pub fn record_dlq_retry(&self) {
        self.dlq_retry.fetch_add(1, Ordering::Relaxed);
        counter!(names::DLQ_RETRY_TOTAL).increment(1);
    }

    /// An operator discarded a dead-letter row.
    pub fn record_dlq_discard(&self) {
        self.dlq_discard.fetch_add(1, Ordering::Relaxed);
        counter!(names::DLQ_DISCARD_TOTAL).increment(1);
    }

    /// Update the `outbox_pending` gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_outbox_pending(&self, pending: i64) {
        gauge!(names::OUTBOX_PENDING).set(pending as f64);
    }

    /// Update the `dlq_depth` gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_dlq_depth(&self, depth: u64) {
        gauge!(names::DLQ_DEPTH).set(depth as f64);
    }

    /// Update the `dlq_db_unresolved` gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_dlq_db_unresolved(&self, unresolved: i64) {
        gauge!(names::DLQ_DB_UNRESOLVED).set(unresolved as f64);
    }

    /// Current counter values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            outbox_published_total: self.published.load(Ordering::Relaxed),
            outbox_failed_total: self.failed.load(Ordering::Relaxed),
            dlq_messages_total: self.dlq_messages.load(Ordering::Relaxed),
            dlq_reprocess_success_total: self.reprocess_success.load(Ordering::Relaxed),
            dlq_reprocess_failed_total: self.reprocess_failed.load(Ordering::Relaxed),
            dlq_retry_total: self.dlq_retry.load(Ordering::Relaxed),
            dlq_discard_total: self.dlq_discard.load(Ordering::Relaxed),
            relay_lag_seconds: self.relay_lag_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Process-local counter values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineCounters {
    /// Events delivered.
    pub outbox_published_total: u64,
    /// Failed delivery attempts.
    pub outbox_failed_total: u64,
    /// Events dead-lettered.
    pub dlq_messages_total: u64,
    /// DLQ stream messages replayed.
    pub dlq_reprocess_success_total: u64,
    /// DLQ stream messages that failed to replay.
    pub dlq_reprocess_failed_total: u64,
    /// Operator retries.
    pub dlq_retry_total: u64,
    /// Operator discards.
    pub dlq_discard_total: u64,
    /// Lag of the last delivered event.
    pub relay_lag_seconds: f64,
}

/// JSON snapshot served by `GET /admin/events/metrics`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// `PENDING` outbox rows.
    pub outbox_pending: i64,
    /// Events delivered by this process.
    pub outbox_published_total: u64,
    /// Failed delivery attempts in this process.
    pub outbox_failed_total: u64,
    /// Events dead-lettered by this process.
    pub dlq_messages_total: u64,
    /// DLQ stream messages replayed by this process.
    pub dlq_reprocess_success_total: u64,
    /// DLQ stream replays that failed in this process.
    pub dlq_reprocess_failed_total: u64,
    /// Operator retries in this process.
    pub dlq_retry_total: u64,
    /// Operator discards in this process.
    pub dlq_discard_total: u64,
    /// DLQ stream length; `None` when the stream could not be read.
    pub dlq_depth: Option<u64>,
    /// Unresolved dead-letter rows.
    pub dlq_db_unresolved: i64,
    /// Lag of the last delivered event.
    pub relay_lag_seconds: f64,
    /// Outbox rows per status.
    pub outbox_status_counts: BTreeMap<String, i64>,
}

impl MetricsSnapshot {
    /// Combine counter mirrors with live backlog reads.
    #[must_use]
    pub fn new(
        counters: PipelineCounters,
        outbox_status_counts: BTreeMap<String, i64>,
        dlq_depth: Option<u64>,
        dlq_db_unresolved: i64,
    ) -> Self {
        Self {
            outbox_pending: outbox_status_counts.get("PENDING").copied().unwrap_or(0),
            outbox_published_total: counters.outbox_published_total,
            outbox_failed_total: counters.outbox_failed_total,
            dlq_messages_total: counters.dlq_messages_total,
            dlq_reprocess_success_total: counters.dlq_reprocess_success_total,
            dlq_reprocess_failed_total: counters.dlq_reprocess_failed_total,
            dlq_retry_total: counters.dlq_retry_total,
            dlq_discard_total: counters.dlq_discard_total,
            dlq_depth,
            dlq_db_unresolved,
            relay_lag_seconds: counters.relay_lag_seconds,
            outbox_status_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_mirror_recorded_values() {
        let metrics = PipelineMetrics::new();
        metrics.record_published(Duration::from_millis(1500));
        metrics.record_failed();
        metrics.record_failed();
        metrics.record_dead_lettered(1);
        metrics.record_reprocess(true);
        metrics.record_reprocess(false);
        metrics.record_dlq_retry();
        metrics.record_dlq_discard();

        let counters = metrics.counters();
        assert_eq!(counters.outbox_published_total, 1);
        assert_eq!(counters.outbox_failed_total, 2);
        assert_eq!(counters.dlq_messages_total, 1);
        assert_eq!(counters.dlq_reprocess_success_total, 1);
        assert_eq!(counters.dlq_reprocess_failed_total, 1);
        assert_eq!(counters.dlq_retry_total, 1);
        assert_eq!(counters.dlq_discard_total, 1);
        assert!((counters.relay_lag_seconds - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_takes_pending_from_status_counts() {
        let counts = BTreeMap::from([("PENDING".to_string(), 7), ("PUBLISHED".to_string(), 3)]);
        let snapshot = MetricsSnapshot::new(PipelineCounters::default(), counts, Some(2), 1);
        assert_eq!(snapshot.outbox_pending, 7);
        assert_eq!(snapshot.dlq_depth, Some(2));
        assert_eq!(snapshot.dlq_db_unresolved, 1);
    }

    #[test]
    fn detached_exporter_renders() {
        let exporter = PrometheusExporter::detached();
        let _ = exporter.render();
        assert!(format!("{exporter:?}").starts_with("PrometheusExporter"));
    }
}
