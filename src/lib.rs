//! A2A relay library root.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod protocol;
pub mod state;
pub mod workflow;

pub use agent::{Participant, RunContext};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventType, Listener, Monitor, Severity};
pub use protocol::{sign, verify, Envelope, MessageType, Receipt, SignedEnvelope, Signer, Transport};
pub use state::{InMemoryStateStore, StateStore, StateStoreExt};
pub use workflow::{run_exchange, AssembledPlan, Workflow, WorkflowState};
