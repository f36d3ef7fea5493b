//! Lifecycle event helpers bound to one trace/correlation pair.

use serde_json::{json, Value};
use std::sync::Arc;

use super::bus::EventBus;
use super::types::{Event, EventType};

/// Emits task lifecycle events that all share a trace and correlation ID.
#[derive(Clone)]
pub struct Monitor {
    bus: Arc<EventBus>,
    trace_id: String,
    correlation_id: String,
}

impl Monitor {
    pub fn new(
        bus: Arc<EventBus>,
        trace_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            trace_id: trace_id.into(),
            correlation_id: correlation_id.into(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn event(&self, event_type: EventType, task_id: &str, agent_id: &str, message: String) -> Event {
        Event::new(event_type, &self.trace_id, &self.correlation_id, message)
            .with_task(task_id)
            .with_agent(agent_id)
    }

    pub fn task_start(&self, task_id: &str, agent_id: &str, message: impl Into<String>) {
        self.bus
            .emit(&self.event(EventType::TaskStart, task_id, agent_id, message.into()));
    }

    /// `progress` is clamped to 0.0..=1.0.
    pub fn task_progress(
        &self,
        task_id: &str,
        agent_id: &str,
        progress: f64,
        message: impl Into<String>,
    ) {
        let progress = progress.clamp(0.0, 1.0);
        let event = self
            .event(EventType::TaskProgress, task_id, agent_id, message.into())
            .with_data("progress", json!(progress));
        self.bus.emit(&event);
    }

    pub fn task_end(&self, task_id: &str, agent_id: &str, message: impl Into<String>) {
        self.bus
            .emit(&self.event(EventType::TaskEnd, task_id, agent_id, message.into()));
    }

    pub fn task_error(&self, task_id: &str, agent_id: &str, kind: &str, error: impl Into<String>) {
        let error = error.into();
        let event = self
            .event(
                EventType::TaskError,
                task_id,
                agent_id,
                format!("Task error: {}", error),
            )
            .with_error(kind, error);
        self.bus.emit(&event);
    }

    pub fn state_change(
        &self,
        task_id: &str,
        agent_id: &str,
        key: &str,
        old_value: Option<&Value>,
        new_value: Option<&Value>,
    ) {
        let event = self
            .event(
                EventType::StateChange,
                task_id,
                agent_id,
                format!("State changed: {}", key),
            )
            .with_data("key", json!(key))
            .with_data("old_value", old_value.cloned().unwrap_or(Value::Null))
            .with_data("new_value", new_value.cloned().unwrap_or(Value::Null));
        self.bus.emit(&event);
    }

    pub fn agent_message(
        &self,
        task_id: &str,
        agent_id: &str,
        message_type: &str,
        message: impl Into<String>,
        data: Value,
    ) {
        let event = self
            .event(EventType::AgentMessage, task_id, agent_id, message.into())
            .with_data("message_type", json!(message_type))
            .with_data("details", data);
        self.bus.emit(&event);
    }
}
