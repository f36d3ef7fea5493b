//! Monitoring event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Event type classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskStart,
    TaskProgress,
    TaskEnd,
    TaskError,
    StateChange,
    /// An envelope was sent or received
    AgentMessage,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskStart => "task_start",
            EventType::TaskProgress => "task_progress",
            EventType::TaskEnd => "task_end",
            EventType::TaskError => "task_error",
            EventType::StateChange => "state_change",
            EventType::AgentMessage => "agent_message",
        }
    }

    /// Severity used when the producer does not pick one.
    pub fn default_severity(&self) -> Severity {
        match self {
            EventType::TaskError => Severity::Error,
            EventType::StateChange => Severity::Debug,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Error details attached to `task_error` events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventError {
    pub kind: String,
    pub message: String,
}

/// Immutable monitoring event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub trace_id: String,
    pub correlation_id: String,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        trace_id: impl Into<String>,
        correlation_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            severity: event_type.default_severity(),
            trace_id: trace_id.into(),
            correlation_id: correlation_id.into(),
            task_id: None,
            agent_id: None,
            message: message.into(),
            timestamp: Utc::now(),
            data: Map::new(),
            error: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_error(mut self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(EventError {
            kind: kind.into(),
            message: message.into(),
        });
        self
    }
}
