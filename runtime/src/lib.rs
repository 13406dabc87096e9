//! # Relayflow Runtime
//!
//! The moving parts of the event pipeline, written against the storage and
//! transport traits in `relayflow-core`:
//!
//! - [`relay::OutboxRelay`]: background worker that moves outbox rows onto the
//!   stream transport, retrying and dead-lettering failures
//! - [`dead_letter::DeadLetterAdmin`]: operator retry/discard over the
//!   dead-letter table, plus the pipeline metrics snapshot
//! - [`service::WorkItemService`]: load → command → commit for WorkItems
//! - [`start_process::StartProcess`]: the compensating "start process" saga
//! - [`metrics`]: Prometheus counters and gauges
//!
//! ## Example
//!
//! ```ignore
//! use relayflow_runtime::relay::{OutboxRelay, RelayConfig};
//!
//! let (relay, shutdown) = OutboxRelay::new(store, transport, clock, metrics, RelayConfig::default());
//! let handle = tokio::spawn(relay.run());
//!
//! // later
//! let _ = shutdown.send(true);
//! handle.await?;
//! ```

pub mod dead_letter;
pub mod metrics;
pub mod relay;
pub mod service;
pub mod start_process;

pub use dead_letter::{DeadLetterAdmin, ResolutionReceipt};
pub use metrics::{MetricsSnapshot, PipelineMetrics, PrometheusExporter};
pub use relay::{OutboxRelay, RelayConfig, RelayReport, ReprocessReport};
pub use service::WorkItemService;
pub use start_process::{ProcessRegistry, StartProcess, StartProcessRequest};
