//! # Relayflow Core
//!
//! Domain types and storage seams for reliable event propagation and saga-based
//! workflow orchestration.
//!
//! ## Building blocks
//!
//! - [`workitem`]: the WorkItem aggregate, a fixed finite-state machine whose
//!   commands buffer [`event::DomainEvent`]s
//! - [`contract`]: the event contract registry (validation and idempotency keys)
//! - [`publisher`]: contract-checked writes into the transactional outbox
//! - [`outbox`] and [`dead_letter`]: outbox rows, dead-letter rows and their stores
//! - [`transport`]: the stream transport the relay delivers to
//! - [`event_store`]: the append-only WorkItem event log and replay
//! - [`repository`]: atomic persistence of a WorkItem's buffered events
//! - [`saga`]: sequential steps with reverse-order compensation
//!
//! No I/O happens in this crate. Postgres and Redis implementations live in
//! `relayflow-postgres` and `relayflow-redis`; in-memory ones in `relayflow-testing`.
//!
//! ## Delivery guarantees
//!
//! Delivery is at-least-once. Every outbox payload carries an idempotency key so
//! consumers can discard duplicates. Ordering is best-effort per aggregate.

pub mod contract;
pub mod dead_letter;
pub mod event;
pub mod event_store;
pub mod outbox;
pub mod publisher;
pub mod repository;
pub mod saga;
pub mod transport;
pub mod workitem;

pub use chrono::{DateTime, Utc};

/// Injected dependencies shared by the runtime.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use relayflow_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
