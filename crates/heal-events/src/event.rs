//! Event envelope
//!
//! Defines the immutable message carried on the bus:
//! - Event identifiers (ULID for sortability)
//! - Correlation identifiers grouping one failure-to-resolution attempt
//! - The closed set of event types and their wire names

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Unique event identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub Ulid);

impl EventId {
    /// Generate new event ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier grouping every event of one healing attempt
///
/// Called "trace id" on the e-commerce side. An empty string is never a valid
/// correlation id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an existing identifier
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check for the empty identifier
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&CorrelationId> for CorrelationId {
    fn from(value: &CorrelationId) -> Self {
        value.clone()
    }
}

/// Event types carried on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Return-eligibility API call failed
    #[serde(rename = "return_api.failure")]
    ReturnApiFailure,
    /// Response failed schema validation
    #[serde(rename = "schema.mismatch")]
    SchemaMismatch,
    /// Root-cause diagnosis is available
    #[serde(rename = "rca.ready")]
    DiagnosisReady,
    /// A healing workflow was opened
    #[serde(rename = "heal.started")]
    HealStarted,
    /// A healing workflow entered a new stage
    #[serde(rename = "heal.progress")]
    HealProgress,
    /// Patch service produced an edit
    #[serde(rename = "patch.generated")]
    PatchGenerated,
    /// Free-form patch generation log line
    #[serde(rename = "patch.log")]
    PatchLog,
    /// Patched service was reloaded
    #[serde(rename = "reload.done")]
    ReloadDone,
    /// Applied patch was reverted
    #[serde(rename = "rollback.done")]
    RollbackDone,
    /// Replay of the failing request passed
    #[serde(rename = "verify.replay.pass")]
    VerifyReplayPass,
    /// Replay of the failing request failed
    #[serde(rename = "verify.replay.fail")]
    VerifyReplayFail,
    /// Terminal event of a healing workflow
    #[serde(rename = "heal.completed")]
    HealCompleted,
}

impl EventType {
    /// Every event type, in declaration order
    pub const ALL: [EventType; 12] = [
        EventType::ReturnApiFailure,
        EventType::SchemaMismatch,
        EventType::DiagnosisReady,
        EventType::HealStarted,
        EventType::HealProgress,
        EventType::PatchGenerated,
        EventType::PatchLog,
        EventType::ReloadDone,
        EventType::RollbackDone,
        EventType::VerifyReplayPass,
        EventType::VerifyReplayFail,
        EventType::HealCompleted,
    ];

    /// Failure-class event types (the triggers of a healing workflow)
    pub const FAILURES: [EventType; 2] = [EventType::ReturnApiFailure, EventType::SchemaMismatch];

    /// Dotted wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ReturnApiFailure => "return_api.failure",
            EventType::SchemaMismatch => "schema.mismatch",
            EventType::DiagnosisReady => "rca.ready",
            EventType::HealStarted => "heal.started",
            EventType::HealProgress => "heal.progress",
            EventType::PatchGenerated => "patch.generated",
            EventType::PatchLog => "patch.log",
            EventType::ReloadDone => "reload.done",
            EventType::RollbackDone => "rollback.done",
            EventType::VerifyReplayPass => "verify.replay.pass",
            EventType::VerifyReplayFail => "verify.replay.fail",
            EventType::HealCompleted => "heal.completed",
        }
    }

    /// Check if this event reports a detected failure
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        Self::FAILURES.contains(self)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// Event envelope
///
/// Immutable once published. `key` is the partitioning key chosen by the
/// producer (often the correlation id, sometimes an order key); only
/// `correlation_id` is used for workflow tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID
    pub id: EventId,
    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Correlation key chosen by the producer
    pub key: String,
    /// Workflow correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Type-specific payload
    #[serde(default)]
    pub payload: Value,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Rendering hint for dashboards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_hint: Option<String>,
}

impl Event {
    /// Create new event without correlation id
    #[must_use]
    pub fn new(event_type: EventType, key: impl Into<String>, payload: Value) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            key: key.into(),
            correlation_id: None,
            payload,
            timestamp: Utc::now(),
            ui_hint: None,
        }
    }

    /// Create event keyed and correlated by the same id
    #[must_use]
    pub fn for_correlation(
        event_type: EventType,
        correlation_id: impl Into<CorrelationId>,
        payload: Value,
    ) -> Self {
        let correlation_id = correlation_id.into();
        Self::new(event_type, correlation_id.as_str(), payload).with_correlation_id(correlation_id)
    }

    /// With correlation id
    #[inline]
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// With UI hint
    #[inline]
    #[must_use]
    pub fn with_ui_hint(mut self, hint: impl Into<String>) -> Self {
        self.ui_hint = Some(hint.into());
        self
    }

    /// Usable correlation id (empty ids count as absent)
    #[inline]
    #[must_use]
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref().filter(|id| !id.is_empty())
    }

    /// Look up a top-level payload field
    #[inline]
    #[must_use]
    pub fn payload_field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Look up a top-level string payload field
    #[inline]
    #[must_use]
    pub fn payload_str(&self, name: &str) -> Option<&str> {
        self.payload_field(name).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn event_type_wire_names_round_trip() {
        for event_type in EventType::ALL {
            let parsed = EventType::from_str(event_type.as_str()).unwrap();
            assert_eq!(parsed, event_type);

            let encoded = serde_json::to_value(event_type).unwrap();
            assert_eq!(encoded, json!(event_type.as_str()));
        }
        assert!(EventType::from_str("heal.unknown").is_err());
    }

    #[test]
    fn only_failure_types_are_failures() {
        assert!(EventType::ReturnApiFailure.is_failure());
        assert!(EventType::SchemaMismatch.is_failure());
        assert!(!EventType::DiagnosisReady.is_failure());
        assert!(!EventType::HealCompleted.is_failure());
    }

    #[test]
    fn empty_correlation_id_counts_as_absent() {
        let event = Event::new(EventType::SchemaMismatch, "order_1", json!({}))
            .with_correlation_id("  ");
        assert!(event.correlation_id().is_none());

        let event = event.with_correlation_id("t1");
        assert_eq!(event.correlation_id().map(CorrelationId::as_str), Some("t1"));
    }

    #[test]
    fn for_correlation_sets_key_and_id() {
        let event = Event::for_correlation(EventType::DiagnosisReady, "t9", json!({"playbook": "X"}))
            .with_ui_hint("rca_complete");

        assert_eq!(event.key, "t9");
        assert_eq!(event.correlation_id.as_ref().unwrap().as_str(), "t9");
        assert_eq!(event.payload_str("playbook"), Some("X"));
        assert_eq!(event.ui_hint.as_deref(), Some("rca_complete"));
    }

    #[test]
    fn event_serializes_type_under_wire_name() {
        let event = Event::for_correlation(EventType::HealCompleted, "t1", json!({"status": "Succeeded"}));
        let encoded = serde_json::to_value(&event).unwrap();

        assert_eq!(encoded["type"], json!("heal.completed"));
        assert_eq!(encoded["correlation_id"], json!("t1"));
        assert!(encoded.get("ui_hint").is_none());

        let decoded: Event = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn generated_correlation_ids_differ() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }
}
