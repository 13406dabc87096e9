//! # Relayflow Testing
//!
//! Test doubles for the Relayflow event pipeline.
//!
//! This crate provides:
//! - [`FixedClock`]: deterministic time
//! - [`InMemoryOutboxStore`]: outbox and dead-letter tables with batch leasing
//! - [`InMemoryEventStore`] and [`InMemoryWorkItemRepository`]: WorkItem persistence
//! - [`ScriptedTransport`]: stream transport that fails on demand
//! - [`InMemoryProcessRegistry`]: process instances and role bindings
//!
//! ## Example
//!
//! ```ignore
//! use relayflow_testing::{InMemoryOutboxStore, ScriptedTransport, test_clock};
//! use relayflow_runtime::relay::{OutboxRelay, RelayConfig};
//!
//! #[tokio::test]
//! async fn failing_event_is_isolated() {
//!     let store = InMemoryOutboxStore::new();
//!     let transport = ScriptedTransport::new();
//!     transport.fail_event_type("WORKITEM_STARTED");
//!
//!     let (relay, _shutdown) = OutboxRelay::new(
//!         Arc::new(store.clone()),
//!         Arc::new(transport),
//!         Arc::new(test_clock()),
//!         Arc::new(PipelineMetrics::new()),
//!         RelayConfig::default(),
//!     );
//!     let report = relay.relay_once().await.unwrap();
//!     assert_eq!(report.failed, 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use relayflow_core::environment::Clock;

pub mod outbox_mocks;
pub mod process_mocks;
pub mod transport_mocks;
pub mod workitem_mocks;

/// Mock implementations of the injected environment.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use relayflow_testing::mocks::FixedClock;
    /// use relayflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Fixture builders.
pub mod fixtures {
    use chrono::{DateTime, Utc};
    use relayflow_core::outbox::{NewOutboxEntry, OutboxEntry};
    use relayflow_core::workitem::NewWorkItem;
    use serde_json::json;
    use uuid::Uuid;

    /// A `PENDING` outbox row of `event_type` created at `created_at`.
    #[must_use]
    pub fn pending_entry(event_type: &str, created_at: DateTime<Utc>) -> OutboxEntry {
        let aggregate_id = Uuid::new_v4().to_string();
        NewOutboxEntry {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_type: "WorkItem".to_string(),
            aggregate_id: aggregate_id.clone(),
            payload: json!({
                "workitem_id": aggregate_id,
                "idempotency_key": format!("{event_type}:{aggregate_id}"),
            }),
            tenant_id: "tenant-1".to_string(),
            created_at,
        }
        .into_entry()
    }

    /// A manual WorkItem for `tenant-1`.
    #[must_use]
    pub fn new_workitem(activity_name: &str) -> NewWorkItem {
        NewWorkItem::new(Uuid::new_v4(), activity_name, "task", "tenant-1")
    }
}

/// Install a fmt subscriber for test output; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
pub use outbox_mocks::InMemoryOutboxStore;
pub use process_mocks::InMemoryProcessRegistry;
pub use transport_mocks::ScriptedTransport;
pub use workitem_mocks::{InMemoryEventStore, InMemoryWorkItemRepository};
