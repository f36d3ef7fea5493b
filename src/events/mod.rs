//! Observability events.
//!
//! - Monitoring event types
//! - Synchronous fan-out bus with per-listener error isolation
//! - Lifecycle helpers bound to a trace/correlation pair

pub mod bus;
pub mod monitor;
pub mod types;

pub use bus::{EventBus, EventRecorder, Listener, SubscriptionId, TracingListener};
pub use monitor::Monitor;
pub use types::{Event, EventError, EventType, Severity};
