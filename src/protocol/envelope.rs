//! Message envelopes with trace and correlation IDs for agent-to-agent exchange.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{
    major_version, MessageMeta, MessageType, DEFAULT_PRIORITY, DEFAULT_TTL_SECS,
    PROTOCOL_VERSION, SUPPORTED_MAJOR_VERSION,
};
use crate::error::{Error, Result};

/// One message plus routing and integrity metadata.
///
/// The JSON form is the wire format: `version` is a dotted string, `timestamp`
/// an ISO-8601 UTC string and `signature` lowercase hex.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Unique message ID (ULID)
    pub message_id: String,
    /// Shared by every envelope of one end-to-end workflow
    pub trace_id: String,
    /// Shared by every envelope of one request/response exchange
    pub correlation_id: String,
    pub message_type: MessageType,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque to the core; always a JSON object
    pub payload: Value,
    pub meta: MessageMeta,
    /// HMAC-SHA256 over every other field, absent until signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    /// Start building an envelope of the given type.
    pub fn builder(message_type: MessageType) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type)
    }

    /// Start building a proposal.
    pub fn proposal(payload: Value) -> EnvelopeBuilder {
        EnvelopeBuilder::new(MessageType::Proposal).payload(payload)
    }

    /// Start building an optimized plan.
    pub fn optimized_plan(payload: Value) -> EnvelopeBuilder {
        EnvelopeBuilder::new(MessageType::OptimizedPlan).payload(payload)
    }

    /// Start building an error report.
    pub fn error(payload: Value) -> EnvelopeBuilder {
        EnvelopeBuilder::new(MessageType::Error).payload(payload)
    }

    /// Start a reply that stays in this exchange and goes back to the sender.
    pub fn reply(&self, message_type: MessageType, payload: Value) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type)
            .payload(payload)
            .sender(self.meta.receiver.clone())
            .receiver(self.meta.sender.clone())
            .trace_id(self.trace_id.clone())
            .correlation_id(self.correlation_id.clone())
    }

    /// Deterministic bytes covered by the signature.
    ///
    /// Every field except `signature`, encoded as JSON with object keys sorted
    /// at every level, so two equal envelopes always produce identical bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        Ok(serde_json::to_vec(&value)?)
    }

    /// Reject envelopes from an unknown major protocol version.
    pub fn check_version(&self) -> Result<()> {
        match major_version(&self.version) {
            Some(SUPPORTED_MAJOR_VERSION) => Ok(()),
            _ => Err(Error::UnsupportedVersion(self.version.clone())),
        }
    }

    /// Check if the delivery window had passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.meta.ttl == 0 {
            return false;
        }
        let ttl = Duration::seconds(i64::try_from(self.meta.ttl).unwrap_or(i64::MAX));
        now.signed_duration_since(self.timestamp) > ttl
    }

    /// Check if the delivery window has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// `(message_id, sender, timestamp)`, enough for callers to detect replays.
    pub fn replay_key(&self) -> (&str, &str, DateTime<Utc>) {
        (&self.message_id, &self.meta.sender, self.timestamp)
    }

    pub fn sender(&self) -> &str {
        &self.meta.sender
    }

    pub fn receiver(&self) -> &str {
        &self.meta.receiver
    }
}

/// Builder for creating envelopes with fluent API.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    message_type: MessageType,
    payload: Value,
    sender: String,
    receiver: String,
    ttl: u64,
    priority: i32,
    correlation_id: Option<String>,
    trace_id: Option<String>,
}

impl EnvelopeBuilder {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            payload: Value::Object(Map::new()),
            sender: String::new(),
            receiver: String::new(),
            ttl: DEFAULT_TTL_SECS,
            priority: DEFAULT_PRIORITY,
            correlation_id: None,
            trace_id: None,
        }
    }

    /// Start from a wire type name, failing on anything outside the closed set.
    pub fn parse(message_type: &str) -> Result<Self> {
        Ok(Self::new(message_type.parse()?))
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn sender(mut self, agent_id: impl Into<String>) -> Self {
        self.sender = agent_id.into();
        self
    }

    pub fn receiver(mut self, agent_id: impl Into<String>) -> Self {
        self.receiver = agent_id.into();
        self
    }

    /// Delivery window in seconds, 0 disables expiry.
    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = seconds;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Join an existing workflow instead of starting a new trace.
    pub fn trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    /// Build the envelope, assigning a fresh message ID and timestamp.
    pub fn build(self) -> Result<Envelope> {
        if self.sender.trim().is_empty() {
            return Err(Error::Validation("sender must not be empty".to_string()));
        }
        if self.receiver.trim().is_empty() {
            return Err(Error::Validation("receiver must not be empty".to_string()));
        }
        let payload = match self.payload {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(Error::Validation(format!(
                    "payload must be a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        Ok(Envelope {
            message_id: generate_id(),
            trace_id: self.trace_id.unwrap_or_else(new_trace_id),
            correlation_id: self.correlation_id.unwrap_or_else(new_trace_id),
            message_type: self.message_type,
            version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now(),
            payload,
            meta: MessageMeta {
                sender: self.sender,
                receiver: self.receiver,
                priority: self.priority,
                ttl: self.ttl,
            },
            signature: None,
        })
    }
}

fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Fresh identifier for a trace or correlation group.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
