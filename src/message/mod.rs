use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// One of the two independently-evolving subsystems bridged by the bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// Reasoning/template subsystem ("Subsystem R").
    Reasoning,
    /// Mathematical field-dynamics subsystem ("Subsystem D").
    Dynamics,
}

impl Subsystem {
    pub fn peer(self) -> Self {
        match self {
            Self::Reasoning => Self::Dynamics,
            Self::Dynamics => Self::Reasoning,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Dynamics => "dynamics",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of message kinds exchanged over the bus.
///
/// Handler dispatch is keyed by this enum, so an unknown kind cannot enter
/// the pipeline: deserialization of an unregistered string fails up front.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TemplateRequest,
    TemplateResponse,
    FieldUpdate,
    FieldSnapshot,
    ResonanceEvent,
    EmergenceEvent,
    ContextRequest,
    ContextResponse,
    HealthProbe,
    SyncNotification,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        Self::TemplateRequest,
        Self::TemplateResponse,
        Self::FieldUpdate,
        Self::FieldSnapshot,
        Self::ResonanceEvent,
        Self::EmergenceEvent,
        Self::ContextRequest,
        Self::ContextResponse,
        Self::HealthProbe,
        Self::SyncNotification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TemplateRequest => "template_request",
            Self::TemplateResponse => "template_response",
            Self::FieldUpdate => "field_update",
            Self::FieldSnapshot => "field_snapshot",
            Self::ResonanceEvent => "resonance_event",
            Self::EmergenceEvent => "emergence_event",
            Self::ContextRequest => "context_request",
            Self::ContextResponse => "context_response",
            Self::HealthProbe => "health_probe",
            Self::SyncNotification => "sync_notification",
        }
    }

    /// Kinds that participate in request/response correlation.
    pub fn is_correlated(self) -> bool {
        matches!(
            self,
            Self::TemplateRequest
                | Self::TemplateResponse
                | Self::ContextRequest
                | Self::ContextResponse
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority class; determines queue membership and per-tick drain order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Drain order within one tick: higher classes first.
    pub const ORDERED: [Priority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload bookkeeping carried alongside the opaque domain value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayloadMetadata {
    /// Serialized size of `data` in bytes.
    pub size: u64,
    pub format: String,
    /// Deterministic hash of the serialized `data`; recomputing it must
    /// reproduce the same value so transformation results can be cached.
    pub checksum: String,
    pub version: String,
    pub source_timestamp: DateTime<Utc>,
}

/// Opaque domain payload plus metadata and a schema identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PayloadMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl Payload {
    /// Build a payload with metadata derived from `data`.
    pub fn new(data: Value, schema: impl Into<String>) -> Self {
        let metadata = PayloadMetadata {
            size: serialized_size(&data),
            format: "json".to_string(),
            checksum: checksum_of(&data),
            version: "1".to_string(),
            source_timestamp: Utc::now(),
        };
        Self {
            data,
            metadata: Some(metadata),
            schema: Some(schema.into()),
        }
    }

    /// Payload with no metadata or schema; fails payload validation checks.
    pub fn bare(data: Value) -> Self {
        Self {
            data,
            metadata: None,
            schema: None,
        }
    }

    /// Checksum of the current `data`, independent of stale metadata.
    pub fn recompute_checksum(&self) -> String {
        checksum_of(&self.data)
    }
}

/// SHA-256 over the canonical JSON serialization of `data`.
///
/// serde_json orders object keys (BTreeMap-backed), so the serialization is
/// deterministic and the checksum is stable across processes.
pub fn checksum_of(data: &Value) -> String {
    let serialized = serde_json::to_vec(data).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    hex::encode(digest)
}

pub(crate) fn serialized_size(data: &Value) -> u64 {
    serde_json::to_vec(data).map(|v| v.len() as u64).unwrap_or(0)
}

/// Correlation and observability context attached to every message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub environment: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
}

impl Default for MessageContext {
    fn default() -> Self {
        Self {
            session_id: None,
            request_id: None,
            correlation_id: None,
            environment: "default".to_string(),
            tags: Vec::new(),
            custom_headers: HashMap::new(),
        }
    }
}

impl MessageContext {
    pub fn with_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }
}

/// Terminal processing outcome recorded in an acknowledgment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Error,
    Partial,
}

/// Per-message receipt/processing record returned to the sender.
///
/// Created at enqueue time with `received = true, processed = false`; the
/// processing loop finalizes it once all handlers for the message have run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Acknowledgment {
    pub received: bool,
    pub processed: bool,
    pub timestamp: DateTime<Utc>,
    pub processing_time_ms: u64,
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Acknowledgment {
    pub fn pending() -> Self {
        Self {
            received: true,
            processed: false,
            timestamp: Utc::now(),
            processing_time_ms: 0,
            status: AckStatus::Success,
            error_message: None,
        }
    }
}

/// Canonical envelope around any cross-subsystem data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: Subsystem,
    pub target: Subsystem,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Payload,
    pub priority: Priority,
    /// Priority string as received on the wire, preserved when it did not
    /// parse as a known class (validation warns and falls back to Normal).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_priority: Option<String>,
    #[serde(default)]
    pub context: MessageContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledgment: Option<Acknowledgment>,
}

impl Message {
    pub fn new(
        source: Subsystem,
        target: Subsystem,
        kind: MessageType,
        payload: Payload,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source,
            target,
            kind,
            payload,
            priority,
            raw_priority: None,
            context: MessageContext::default(),
            acknowledgment: None,
        }
    }

    /// Like `new`, but normalizes a raw priority string. Unknown strings
    /// fall back to Normal and are preserved for the validator to warn on.
    pub fn with_raw_priority(
        source: Subsystem,
        target: Subsystem,
        kind: MessageType,
        payload: Payload,
        raw_priority: &str,
    ) -> Self {
        let mut message = Self::new(
            source,
            target,
            kind,
            payload,
            Priority::parse(raw_priority).unwrap_or_default(),
        );
        if Priority::parse(raw_priority).is_none() {
            message.raw_priority = Some(raw_priority.to_string());
        }
        message
    }

    pub fn with_context(mut self, context: MessageContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_is_deterministic() {
        let data = json!({"b": 2, "a": 1, "nested": {"y": [1, 2, 3], "x": "s"}});
        let first = checksum_of(&data);
        let second = checksum_of(&data);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn checksum_changes_with_data() {
        assert_ne!(checksum_of(&json!({"x": 1})), checksum_of(&json!({"x": 2})));
    }

    #[test]
    fn payload_new_fills_metadata() {
        let payload = Payload::new(json!({"x": 1}), "field_v1");
        let metadata = payload.metadata.as_ref().expect("metadata");
        assert_eq!(metadata.checksum, payload.recompute_checksum());
        assert_eq!(metadata.format, "json");
        assert!(metadata.size > 0);
        assert_eq!(payload.schema.as_deref(), Some("field_v1"));
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!(Priority::parse("CRITICAL"), Some(Priority::Critical));
        assert_eq!(Priority::parse(" high "), Some(Priority::High));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn unknown_raw_priority_falls_back_to_normal() {
        let message = Message::with_raw_priority(
            Subsystem::Reasoning,
            Subsystem::Dynamics,
            MessageType::FieldUpdate,
            Payload::new(json!({}), "s1"),
            "urgent",
        );
        assert_eq!(message.priority, Priority::Normal);
        assert_eq!(message.raw_priority.as_deref(), Some("urgent"));
    }

    #[test]
    fn known_raw_priority_leaves_no_residue() {
        let message = Message::with_raw_priority(
            Subsystem::Reasoning,
            Subsystem::Dynamics,
            MessageType::FieldUpdate,
            Payload::new(json!({}), "s1"),
            "critical",
        );
        assert_eq!(message.priority, Priority::Critical);
        assert!(message.raw_priority.is_none());
    }

    #[test]
    fn json_roundtrip_keeps_envelope_shape() {
        let message = Message::new(
            Subsystem::Reasoning,
            Subsystem::Dynamics,
            MessageType::ResonanceEvent,
            Payload::new(json!({"x": 1}), "s1"),
            Priority::Normal,
        )
        .with_context(MessageContext::with_session("sess-1"));

        let encoded = serde_json::to_string(&message).expect("serialize message");
        assert!(encoded.contains("\"type\":\"resonance_event\""));
        let decoded: Message = serde_json::from_str(&encoded).expect("deserialize message");
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_kind_fails_deserialization() {
        let raw = r#"{"id":"m1","timestamp":"2026-01-01T00:00:00Z","source":"reasoning",
            "target":"dynamics","type":"mystery_event",
            "payload":{"data":{}},"priority":"normal","context":{"environment":"test"}}"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }

    #[test]
    fn subsystem_peer_flips() {
        assert_eq!(Subsystem::Reasoning.peer(), Subsystem::Dynamics);
        assert_eq!(Subsystem::Dynamics.peer(), Subsystem::Reasoning);
    }

    #[test]
    fn pending_acknowledgment_shape() {
        let ack = Acknowledgment::pending();
        assert!(ack.received);
        assert!(!ack.processed);
        assert_eq!(ack.status, AckStatus::Success);
        assert!(ack.error_message.is_none());
    }
}
