//! Event contract registry.
//!
//! Static mapping from event type to owning service, schema version, payload schema
//! and idempotency-key rule. [`ContractRegistry::enforce`] is the single point that
//! makes every outbox row self-describing and safely deduplicable downstream:
//!
//! - unknown event types are rejected (`NOT_REGISTERED`)
//! - a payload claiming a different `contract_version` is rejected (`VERSION_MISMATCH`)
//! - otherwise the payload gains an `idempotency_key` (an existing key is kept
//!   verbatim) and an `event_contract` metadata block
//!
//! The registry is pure: no I/O, no global state. Build one at startup and pass it
//! to the [`EventPublisher`](crate::publisher::EventPublisher).
//!
//! # Example
//!
//! ```
//! use relayflow_core::contract::ContractRegistry;
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let registry = ContractRegistry::core();
//! let enriched = registry
//!     .enforce("PROCESS_INITIATED", json!({"name": "onboarding"}), "proc-1", Utc::now())
//!     .unwrap();
//!
//! assert_eq!(enriched["idempotency_key"], json!("PROCESS_INITIATED:proc-1"));
//! assert_eq!(enriched["event_contract"]["owner_service"], json!("core"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Payload key holding the idempotency key.
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotency_key";

/// Payload key a producer may set to pin the contract version it was built against.
pub const CONTRACT_VERSION_FIELD: &str = "contract_version";

/// Payload key holding the contract metadata block.
pub const CONTRACT_METADATA_FIELD: &str = "event_contract";

/// Errors raised while enforcing an event contract.
///
/// A contract failure must abort the surrounding business transaction: an event
/// that cannot be validated never reaches the outbox.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventContractError {
    /// No contract is registered for the event type.
    #[error("Event type not registered: {0}")]
    NotRegistered(String),

    /// The payload carries a `contract_version` the registry does not agree with.
    #[error("Contract version mismatch for {event_type}: registry has v{expected}, payload has {found}")]
    VersionMismatch {
        /// The event type.
        event_type: String,
        /// Version in the registry.
        expected: u32,
        /// Version found in the payload.
        found: String,
    },

    /// The payload is not a JSON object.
    #[error("Payload for {0} must be a JSON object")]
    InvalidPayload(String),
}

impl EventContractError {
    /// Stable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotRegistered(_) => "NOT_REGISTERED",
            Self::VersionMismatch { .. } => "VERSION_MISMATCH",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
        }
    }
}

/// How the idempotency key of an event is synthesised when the producer did not
/// supply one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum IdempotencyRule {
    /// `event_type:aggregate_id`: at most one such event per aggregate.
    AggregateId,
    /// `event_type:aggregate_id:bucket` where `bucket = unix_seconds / seconds`.
    AggregateIdTimeBucket {
        /// Bucket width in seconds.
        seconds: u32,
    },
    /// `event_type:aggregate_id:v<version>` using the payload's `version` field.
    ///
    /// Falls back to [`IdempotencyRule::AggregateId`] when the payload has no version.
    AggregateVersion,
}

impl IdempotencyRule {
    /// Build the key for an event.
    #[must_use]
    pub fn key(
        self,
        event_type: &str,
        aggregate_id: &str,
        payload: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> String {
        match self {
            Self::AggregateId => format!("{event_type}:{aggregate_id}"),
            Self::AggregateIdTimeBucket { seconds } => {
                let bucket = now.timestamp().div_euclid(i64::from(seconds.max(1)));
                format!("{event_type}:{aggregate_id}:{bucket}")
            },
            Self::AggregateVersion => match payload.get("version").and_then(Value::as_i64) {
                Some(version) => format!("{event_type}:{aggregate_id}:v{version}"),
                None => format!("{event_type}:{aggregate_id}"),
            },
        }
    }
}

/// Contract for one event type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContract {
    /// The event type (e.g. `"WORKITEM_CREATED"`).
    pub event_type: String,
    /// Service that owns and publishes the event.
    pub owner_service: String,
    /// Schema version.
    pub version: u32,
    /// Identifier of the payload schema.
    pub payload_schema_id: String,
    /// Idempotency-key rule.
    pub idempotency_rule: IdempotencyRule,
}

impl EventContract {
    /// Create a version-1 contract.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        owner_service: impl Into<String>,
        idempotency_rule: IdempotencyRule,
    ) -> Self {
        let event_type = event_type.into();
        Self {
            payload_schema_id: format!("{}.v1", event_type.to_lowercase()),
            event_type,
            owner_service: owner_service.into(),
            version: 1,
            idempotency_rule,
        }
    }

    /// Set the schema version (and derived schema id).
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self.payload_schema_id = format!("{}.v{version}", self.event_type.to_lowercase());
        self
    }

    fn metadata(&self) -> Value {
        let mut block = Map::new();
        block.insert("event_type".to_string(), Value::String(self.event_type.clone()));
        block.insert(
            "owner_service".to_string(),
            Value::String(self.owner_service.clone()),
        );
        block.insert("version".to_string(), Value::from(self.version));
        block.insert(
            "payload_schema_id".to_string(),
            Value::String(self.payload_schema_id.clone()),
        );
        Value::Object(block)
    }
}

/// Lookup table of event contracts.
#[derive(Clone, Debug, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, EventContract>,
}

impl ContractRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the contracts published by the core service.
    #[must_use]
    pub fn core() -> Self {
        const WORKITEM_EVENTS: [&str; 9] = [
            "WORKITEM_CREATED",
            "WORKITEM_STARTED",
            "WORKITEM_SUBMITTED",
            "WORKITEM_COMPLETED",
            "WORKITEM_CANCELLED",
            "WORKITEM_REWORK_REQUESTED",
            "WORKITEM_HITL_APPROVED",
            "WORKITEM_HITL_REJECTED",
            "WORKITEM_REVERTED",
        ];

        let mut registry = Self::new();
        for event_type in WORKITEM_EVENTS {
            registry.register(EventContract::new(
                event_type,
                "core",
                IdempotencyRule::AggregateVersion,
            ));
        }
        registry.register(EventContract::new(
            "PROCESS_INITIATED",
            "core",
            IdempotencyRule::AggregateId,
        ));
        registry.register(EventContract::new(
            "PROCESS_COMPLETED",
            "core",
            IdempotencyRule::AggregateId,
        ));
        registry
    }

    /// Add or replace a contract.
    pub fn register(&mut self, contract: EventContract) -> &mut Self {
        self.contracts.insert(contract.event_type.clone(), contract);
        self
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, contract: EventContract) -> Self {
        self.register(contract);
        self
    }

    /// Look up a contract.
    #[must_use]
    pub fn get(&self, event_type: &str) -> Option<&EventContract> {
        self.contracts.get(event_type)
    }

    /// Number of registered contracts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    /// Whether no contract is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Validate a payload against its contract and enrich it.
    ///
    /// # Errors
    ///
    /// - [`EventContractError::NotRegistered`] for an unknown event type
    /// - [`EventContractError::InvalidPayload`] if `payload` is not an object
    /// - [`EventContractError::VersionMismatch`] if the payload's `contract_version`
    ///   disagrees with the registry
    pub fn enforce(
        &self,
        event_type: &str,
        payload: Value,
        aggregate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Value, EventContractError> {
        let contract = self
            .get(event_type)
            .ok_or_else(|| EventContractError::NotRegistered(event_type.to_string()))?;

        let Value::Object(mut payload) = payload else {
            return Err(EventContractError::InvalidPayload(event_type.to_string()));
        };

        if let Some(claimed) = payload.get(CONTRACT_VERSION_FIELD) {
            let matches = match claimed {
                Value::Number(n) => n.as_u64() == Some(u64::from(contract.version)),
                Value::String(s) => {
                    s.trim_start_matches('v').parse::<u32>().ok() == Some(contract.version)
                },
                _ => false,
            };
            if !matches {
                return Err(EventContractError::VersionMismatch {
                    event_type: event_type.to_string(),
                    expected: contract.version,
                    found: claimed.to_string(),
                });
            }
        }

        let has_key = payload
            .get(IDEMPOTENCY_KEY_FIELD)
            .is_some_and(|key| !key.is_null());
        if !has_key {
            let key = contract
                .idempotency_rule
                .key(event_type, aggregate_id, &payload, now);
            payload.insert(IDEMPOTENCY_KEY_FIELD.to_string(), Value::String(key));
        }

        payload.insert(CONTRACT_METADATA_FIELD.to_string(), contract.metadata());

        Ok(Value::Object(payload))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:10:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = ContractRegistry::core()
            .enforce("NOPE", json!({}), "a", now())
            .unwrap_err();
        assert_eq!(err.code(), "NOT_REGISTERED");
    }

    #[test]
    fn disagreeing_contract_version_is_rejected() {
        let registry = ContractRegistry::core();
        let err = registry
            .enforce("PROCESS_INITIATED", json!({"contract_version": 2}), "a", now())
            .unwrap_err();
        assert_eq!(err.code(), "VERSION_MISMATCH");

        assert!(registry
            .enforce("PROCESS_INITIATED", json!({"contract_version": "v1"}), "a", now())
            .is_ok());
    }

    #[test]
    fn existing_idempotency_key_is_kept() {
        let enriched = ContractRegistry::core()
            .enforce(
                "PROCESS_INITIATED",
                json!({"idempotency_key": "client-supplied"}),
                "a",
                now(),
            )
            .unwrap();
        assert_eq!(enriched["idempotency_key"], json!("client-supplied"));
    }

    #[test]
    fn version_rule_uses_payload_version() {
        let enriched = ContractRegistry::core()
            .enforce("WORKITEM_STARTED", json!({"version": 2}), "w1", now())
            .unwrap();
        assert_eq!(enriched["idempotency_key"], json!("WORKITEM_STARTED:w1:v2"));
        assert_eq!(enriched["event_contract"]["version"], json!(1));
    }

    #[test]
    fn time_bucket_rule() {
        let registry = ContractRegistry::new().with(EventContract::new(
            "CASE_TOUCHED",
            "cases",
            IdempotencyRule::AggregateIdTimeBucket { seconds: 300 },
        ));
        let enriched = registry.enforce("CASE_TOUCHED", json!({}), "c9", now()).unwrap();
        let bucket = now().timestamp() / 300;
        assert_eq!(
            enriched["idempotency_key"],
            json!(format!("CASE_TOUCHED:c9:{bucket}"))
        );
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let err = ContractRegistry::core()
            .enforce("PROCESS_INITIATED", json!([1, 2]), "a", now())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PAYLOAD");
    }
}
