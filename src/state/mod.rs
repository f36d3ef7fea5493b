//! Shared state for intermediate results passed between agents.

pub mod store;

pub use store::{InMemoryStateStore, StateEntry, StateStore, StateStoreExt};
