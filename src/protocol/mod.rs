//! Agent-to-agent protocol.
//!
//! - Message envelopes with trace and correlation IDs
//! - HMAC-SHA256 signing over a canonical encoding
//! - In-memory addressed transport with expiry, cancellable receive and push subscribers

pub mod envelope;
pub mod signer;
pub mod transport;
pub mod types;

pub use envelope::{new_trace_id, Envelope, EnvelopeBuilder};
pub use signer::{sign, verify, SignedEnvelope, Signer};
pub use transport::{Receipt, Subscriber, SubscriberId, Transport, TransportStats};
pub use types::{MessageMeta, MessageType, PROTOCOL_VERSION};
