//! Event publisher: contract enforcement plus an outbox insert.
//!
//! Publishing is a pure database write into the caller's open transaction. No
//! network call happens here; the relay delivers the row later. If the contract
//! check fails, the error must abort the caller's transaction so no business
//! change commits without its event.

use crate::contract::ContractRegistry;
use crate::event::DomainEvent;
use crate::outbox::{NewOutboxEntry, OutboxEntry, OutboxError, OutboxSink};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Aggregate type recorded on WorkItem outbox rows.
pub const WORKITEM_AGGREGATE_TYPE: &str = "WorkItem";

/// One event to publish.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishRequest {
    /// Contract event type.
    pub event_type: String,
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Payload before enrichment.
    pub payload: Value,
    /// Owning tenant.
    pub tenant_id: String,
}

impl PublishRequest {
    /// Create a request.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Value,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            tenant_id: tenant_id.into(),
        }
    }

    /// The outbox request for a WorkItem event at the version it produced.
    #[must_use]
    pub fn for_workitem(event: &DomainEvent, version: i64) -> Self {
        Self::new(
            event.kind.outbox_event_type(),
            WORKITEM_AGGREGATE_TYPE,
            event.workitem_id.to_string(),
            event.outbox_payload(version),
            event.tenant_id.clone(),
        )
    }
}

/// Writes contract-validated events into an outbox sink.
///
/// Cheap to clone; the registry is shared.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    registry: Arc<ContractRegistry>,
}

impl EventPublisher {
    /// Create a publisher over a registry.
    #[must_use]
    pub const fn new(registry: Arc<ContractRegistry>) -> Self {
        Self { registry }
    }

    /// The registry used for enforcement.
    #[must_use]
    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    /// Enforce the contract and insert one `PENDING` row into `sink`.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::Contract`] if the event fails its contract; the caller must
    ///   roll back
    /// - [`OutboxError::DatabaseError`] if the insert fails
    pub async fn publish<S>(
        &self,
        sink: &mut S,
        request: PublishRequest,
        now: DateTime<Utc>,
    ) -> Result<OutboxEntry, OutboxError>
    where
        S: OutboxSink + ?Sized,
    {
        let payload = self.registry.enforce(
            &request.event_type,
            request.payload,
            &request.aggregate_id,
            now,
        )?;

        let entry = sink
            .insert(NewOutboxEntry {
                id: Uuid::new_v4(),
                event_type: request.event_type,
                aggregate_type: request.aggregate_type,
                aggregate_id: request.aggregate_id,
                payload,
                tenant_id: request.tenant_id,
                created_at: now,
            })
            .await?;

        tracing::debug!(
            event_id = %entry.id,
            event_type = %entry.event_type,
            aggregate_id = %entry.aggregate_id,
            "Event written to outbox"
        );

        Ok(entry)
    }

    /// Publish drained WorkItem events; the first produced `first_version`.
    ///
    /// # Errors
    ///
    /// Stops at the first failing event; see [`publish`](Self::publish).
    pub async fn publish_workitem_events<S>(
        &self,
        sink: &mut S,
        events: &[DomainEvent],
        first_version: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, OutboxError>
    where
        S: OutboxSink + ?Sized,
    {
        let mut entries = Vec::with_capacity(events.len());
        for (version, event) in (first_version..).zip(events) {
            entries.push(
                self.publish(sink, PublishRequest::for_workitem(event, version), now)
                    .await?,
            );
        }
        Ok(entries)
    }
}
