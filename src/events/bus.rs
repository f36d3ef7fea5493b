//! Synchronous fan-out event bus.
//!
//! `emit` invokes every registered listener once, in registration order,
//! before returning. Every listener runs behind its own error boundary: a
//! listener that returns `Err` or panics is logged and skipped, and delivery
//! continues with the next one.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::types::{Event, Severity};

/// Receives events from the bus.
pub trait Listener: Send + Sync {
    /// Identity used when logging failures.
    fn name(&self) -> &str;

    fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

struct FnListener<F> {
    name: String,
    callback: F,
}

impl<F> Listener for FnListener<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        (self.callback)(event)
    }
}

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out bus shared by all producers of one workflow run.
pub struct EventBus {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn Listener>)>>,
    next_id: AtomicU64,
    emitted: AtomicU64,
    failures: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            emitted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn Listener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(listener = listener.name(), "Registered event listener");
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Register a closure as a listener.
    pub fn register_fn<F>(&self, name: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_listener(Arc::new(FnListener {
            name: name.into(),
            callback,
        }))
    }

    /// Remove a listener. Returns `false` if the handle was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every listener registered at the time of the call.
    ///
    /// Returns the number of listeners that handled it without failing.
    pub fn emit(&self, event: &Event) -> usize {
        // Snapshot so listeners may (un)register from inside a callback.
        let listeners: Vec<Arc<dyn Listener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        self.emitted.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for listener in listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                listener = listener.name(),
                event_id = %event.event_id,
                event_type = %event.event_type,
                trace_id = %event.trace_id,
                correlation_id = %event.correlation_id,
                error = %failure,
                "Event listener failed"
            );
        }
        delivered
    }

    /// Total number of `emit` calls.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Total number of listener failures absorbed.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Forwards events to `tracing` at the level matching their severity.
#[derive(Debug, Default)]
pub struct TracingListener;

impl Listener for TracingListener {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        let task_id = event.task_id.as_deref().unwrap_or_default();
        let agent_id = event.agent_id.as_deref().unwrap_or_default();
        macro_rules! log_event {
            ($level:ident) => {
                tracing::$level!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    trace_id = %event.trace_id,
                    correlation_id = %event.correlation_id,
                    task_id,
                    agent_id,
                    "{}",
                    event.message
                )
            };
        }
        match event.severity {
            Severity::Debug => log_event!(debug),
            Severity::Info => log_event!(info),
            Severity::Warning => log_event!(warn),
            Severity::Error | Severity::Critical => log_event!(error),
        }
        Ok(())
    }
}

/// Keeps every event it sees, in delivery order.
#[derive(Debug, Default)]
pub struct EventRecorder {
    name: String,
    events: Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Listener for EventRecorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
