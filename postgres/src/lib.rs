//! `PostgreSQL` storage for Relayflow.
//!
//! Implements the storage seams of `relayflow-core` on top of sqlx:
//!
//! - [`PostgresOutboxStore`]: the `event_outbox` table (relay leasing with
//!   `FOR UPDATE SKIP LOCKED`) and the `dead_letter_events` table
//! - [`PostgresEventStore`]: the append-only `work_item_events` log
//! - [`PostgresWorkItemRepository`]: event log, `work_items` projection and
//!   outbox rows written in one transaction
//!
//! Every table lives in one schema (default `core`), created by [`migrate`].
//!
//! # Example
//!
//! ```ignore
//! use relayflow_postgres::{PostgresOutboxStore, Schema, connect, migrate};
//!
//! let pool = connect("postgres://localhost/relayflow", 10).await?;
//! let schema = Schema::new("core")?;
//! migrate(&pool, &schema).await?;
//! let outbox = PostgresOutboxStore::new(pool, schema);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter;
pub mod event_store;
pub mod migrations;
pub mod outbox;
pub mod repository;

pub use event_store::PostgresEventStore;
pub use migrations::migrate;
pub use outbox::{PgOutboxSink, PostgresOutboxStore};
pub use repository::PostgresWorkItemRepository;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fmt;
use thiserror::Error;

/// Schema used when none is configured.
pub const DEFAULT_SCHEMA: &str = "core";

/// Errors from connecting and migrating.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// The schema name is not a plain lowercase identifier.
    #[error("Invalid schema name: {0:?}")]
    InvalidSchema(String),

    /// A migration statement failed.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Connecting to the database failed.
    #[error("Failed to connect: {0}")]
    Connection(String),
}

/// A validated schema name.
///
/// Table names are interpolated into SQL, so only `[a-z_][a-z0-9_]*` (at most
/// 63 bytes, the `PostgreSQL` identifier limit) is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Schema(String);

impl Schema {
    /// Validate a schema name.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::InvalidSchema`] for anything but a plain
    /// lowercase identifier.
    pub fn new(name: impl Into<String>) -> Result<Self, PostgresError> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if valid_start && valid_rest && name.len() <= 63 {
            Ok(Self(name))
        } else {
            Err(PostgresError::InvalidSchema(name))
        }
    }

    /// The schema name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `schema.event_outbox`
    #[must_use]
    pub fn outbox(&self) -> String {
        self.table("event_outbox")
    }

    /// `schema.dead_letter_events`
    #[must_use]
    pub fn dead_letters(&self) -> String {
        self.table("dead_letter_events")
    }

    /// `schema.work_item_events`
    #[must_use]
    pub fn events(&self) -> String {
        self.table("work_item_events")
    }

    /// `schema.work_items`
    #[must_use]
    pub fn work_items(&self) -> String {
        self.table("work_items")
    }

    fn table(&self, table: &str) -> String {
        format!("{}.{table}", self.0)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self(DEFAULT_SCHEMA.to_string())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`PostgresError::Connection`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, PostgresError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| PostgresError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_accepts_plain_identifiers() {
        for name in ["core", "case_mgmt", "_private", "tenant42"] {
            assert!(Schema::new(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn schema_rejects_anything_that_needs_quoting() {
        for name in ["", "Core", "9lives", "core; DROP TABLE x", "a.b", "\"core\""] {
            assert!(
                matches!(Schema::new(name), Err(PostgresError::InvalidSchema(_))),
                "{name}"
            );
        }
        assert!(Schema::new("a".repeat(64)).is_err());
    }

    #[test]
    fn tables_are_schema_qualified() {
        let schema = Schema::new("ops").map_err(|e| e.to_string());
        assert_eq!(
            schema.map(|s| s.outbox()),
            Ok("ops.event_outbox".to_string())
        );
        assert_eq!(Schema::default().work_items(), "core.work_items");
    }
}
