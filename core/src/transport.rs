//! Stream transport abstraction.
//!
//! The relay pushes each outbox row to an append-only stream as a flat
//! string-keyed message. The transport is a trait so the relay can run against
//! Redis Streams in production and a scripted fake in tests.
//!
//! # Routing
//!
//! [`StreamRouter`] maps an event type to a stream by prefix. The longest
//! matching prefix wins; event types matching no prefix go to the default stream.

use crate::dead_letter::DeadLetterEntry;
use crate::outbox::OutboxEntry;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Default stream for event types with no routing prefix.
pub const DEFAULT_STREAM: &str = "events:core";

/// Default dead-letter stream.
pub const DEFAULT_DLQ_STREAM: &str = "events:dlq";

/// Default approximate length cap of every stream.
pub const DEFAULT_STREAM_MAX_LEN: usize = 10_000;

/// Errors from the stream transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport is unreachable.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Appending to a stream failed.
    #[error("Publish to {stream} failed: {reason}")]
    PublishFailed {
        /// Target stream.
        stream: String,
        /// Why it failed.
        reason: String,
    },

    /// Reading or trimming a stream failed.
    #[error("Read failed: {0}")]
    ReadFailed(String),
}

/// Field names of a stream message.
pub mod fields {
    /// Outbox row id.
    pub const EVENT_ID: &str = "event_id";
    /// Contract event type.
    pub const EVENT_TYPE: &str = "event_type";
    /// Aggregate kind.
    pub const AGGREGATE_TYPE: &str = "aggregate_type";
    /// Aggregate id.
    pub const AGGREGATE_ID: &str = "aggregate_id";
    /// Owning tenant.
    pub const TENANT_ID: &str = "tenant_id";
    /// JSON-encoded payload.
    pub const PAYLOAD: &str = "payload";
    /// Stream the event was meant for (DLQ copies only).
    pub const TARGET_STREAM: &str = "target_stream";
    /// Last delivery error (DLQ copies only).
    pub const FAILURE_REASON: &str = "failure_reason";
    /// Attempts made (DLQ copies only).
    pub const RETRY_COUNT: &str = "retry_count";
}

/// A flat string-keyed stream message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage(BTreeMap<String, String>);

impl StreamMessage {
    /// Empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The message the relay publishes for an outbox row.
    #[must_use]
    pub fn from_entry(entry: &OutboxEntry) -> Self {
        Self::new()
            .with(fields::EVENT_ID, entry.id.to_string())
            .with(fields::EVENT_TYPE, entry.event_type.clone())
            .with(fields::AGGREGATE_TYPE, entry.aggregate_type.clone())
            .with(fields::AGGREGATE_ID, entry.aggregate_id.clone())
            .with(fields::TENANT_ID, entry.tenant_id.clone())
            .with(fields::PAYLOAD, entry.payload.to_string())
    }

    /// The copy pushed to the dead-letter stream when a row is dead-lettered.
    ///
    /// Carries the original fields (with `event_id` set to the outbox row id) plus
    /// the stream it was meant for, the failure reason and the attempt count.
    #[must_use]
    pub fn from_dead_letter(entry: &DeadLetterEntry, target_stream: &str) -> Self {
        Self::new()
            .with(fields::EVENT_ID, entry.original_event_id.to_string())
            .with(fields::EVENT_TYPE, entry.event_type.clone())
            .with(fields::AGGREGATE_TYPE, entry.aggregate_type.clone())
            .with(fields::AGGREGATE_ID, entry.aggregate_id.clone())
            .with(fields::TENANT_ID, entry.tenant_id.clone())
            .with(fields::PAYLOAD, entry.payload.to_string())
            .with(fields::TARGET_STREAM, target_stream)
            .with(fields::FAILURE_REASON, entry.failure_reason.clone())
            .with(fields::RETRY_COUNT, entry.retry_count.to_string())
    }

    /// Builder-style field insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Field value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// A copy without the DLQ-only fields, i.e. the message as originally published.
    #[must_use]
    pub fn without_dead_letter_fields(&self) -> Self {
        let mut copy = self.clone();
        for key in [fields::TARGET_STREAM, fields::FAILURE_REASON, fields::RETRY_COUNT] {
            copy.0.remove(key);
        }
        copy
    }

    /// Iterate fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the message has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for StreamMessage {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Append-only streams with approximate length caps.
pub trait StreamTransport: Send + Sync {
    /// Append a message, trimming the stream to roughly `max_len` entries.
    /// Returns the transport-assigned message id.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the transport is unreachable or rejects the write.
    fn append<'a>(
        &'a self,
        stream: &'a str,
        message: &'a StreamMessage,
        max_len: usize,
    ) -> BoxFuture<'a, Result<String, TransportError>>;

    /// Read up to `count` of the oldest messages.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ReadFailed`] if the read fails.
    fn read<'a>(
        &'a self,
        stream: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<(String, StreamMessage)>, TransportError>>;

    /// Remove one message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ReadFailed`] if the delete fails.
    fn delete<'a>(&'a self, stream: &'a str, id: &'a str)
    -> BoxFuture<'a, Result<(), TransportError>>;

    /// Number of messages in a stream (0 for a missing stream).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ReadFailed`] if the query fails.
    fn len<'a>(&'a self, stream: &'a str) -> BoxFuture<'a, Result<u64, TransportError>>;
}

/// Event-type prefix routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRouter {
    routes: Vec<(String, String)>,
    default_stream: String,
}

impl Default for StreamRouter {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM)
            .route("WORKITEM_", "events:workitem")
            .route("PROCESS_", "events:process")
            .route("CASE_", "events:case")
            .route("DOCUMENT_", "events:document")
    }
}

impl StreamRouter {
    /// Router with no routes.
    #[must_use]
    pub fn new(default_stream: impl Into<String>) -> Self {
        Self {
            routes: Vec::new(),
            default_stream: default_stream.into(),
        }
    }

    /// Add a prefix route.
    #[must_use]
    pub fn route(mut self, prefix: impl Into<String>, stream: impl Into<String>) -> Self {
        self.routes.push((prefix.into(), stream.into()));
        self
    }

    /// Stream for an event type.
    #[must_use]
    pub fn stream_for(&self, event_type: &str) -> &str {
        self.routes
            .iter()
            .filter(|(prefix, _)| event_type.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(self.default_stream.as_str(), |(_, stream)| stream.as_str())
    }

    /// Every stream the router can target, default included.
    #[must_use]
    pub fn streams(&self) -> Vec<&str> {
        let mut streams: Vec<&str> = self.routes.iter().map(|(_, s)| s.as_str()).collect();
        streams.push(&self.default_stream);
        streams.sort_unstable();
        streams.dedup();
        streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxStatus;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn longest_prefix_wins() {
        let router = StreamRouter::default().route("WORKITEM_HITL_", "events:review");

        assert_eq!(router.stream_for("WORKITEM_STARTED"), "events:workitem");
        assert_eq!(router.stream_for("WORKITEM_HITL_APPROVED"), "events:review");
        assert_eq!(router.stream_for("PROCESS_INITIATED"), "events:process");
        assert_eq!(router.stream_for("USER_INVITED"), DEFAULT_STREAM);
    }

    #[test]
    fn dead_letter_copy_strips_back_to_original() {
        let entry = OutboxEntry {
            id: Uuid::new_v4(),
            event_type: "CASE_OPENED".to_string(),
            aggregate_type: "Case".to_string(),
            aggregate_id: "c1".to_string(),
            payload: json!({"k": "v"}),
            status: OutboxStatus::Pending,
            tenant_id: "t1".to_string(),
            created_at: Utc::now(),
            published_at: None,
            retry_count: 0,
            last_error: None,
        };

        let original = StreamMessage::from_entry(&entry);
        assert_eq!(original.get(fields::PAYLOAD), Some(r#"{"k":"v"}"#));

        let dead = DeadLetterEntry::from_outbox(&entry, 3, "timeout", Utc::now());
        let dlq = StreamMessage::from_dead_letter(&dead, "events:case");
        assert_eq!(dlq.get(fields::TARGET_STREAM), Some("events:case"));
        assert_eq!(dlq.without_dead_letter_fields(), original);
    }
}
