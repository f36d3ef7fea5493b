//! Participants: named agents bound to one workflow run's shared resources.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::events::{EventBus, Monitor};
use crate::protocol::{
    EnvelopeBuilder, MessageType, Receipt, SignedEnvelope, Signer, Transport,
};
use crate::state::{InMemoryStateStore, StateStore};

/// Shared resources of one workflow run: transport, state, bus and secret.
///
/// Built once per run and handed to every participant; there is no global.
#[derive(Clone)]
pub struct RunContext {
    pub transport: Arc<Transport>,
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<EventBus>,
    signer: Signer,
    default_ttl: u64,
    default_priority: i32,
}

impl RunContext {
    /// Fresh in-memory resources using `settings` for the secret and defaults.
    pub fn new(settings: &Settings) -> Self {
        Self {
            transport: Arc::new(Transport::with_history_limit(settings.history_limit)),
            store: Arc::new(InMemoryStateStore::new()),
            bus: Arc::new(EventBus::new()),
            signer: Signer::new(&settings.a2a_shared_secret),
            default_ttl: settings.message_ttl_secs,
            default_priority: settings.default_priority,
        }
    }

    /// Use an existing store, e.g. one with a sweeper attached.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Create a participant and register its inbound queue.
    pub fn participant(&self, agent_id: impl Into<String>) -> Participant {
        let agent_id = agent_id.into();
        self.transport.register(&agent_id);
        Participant {
            agent_id,
            ctx: self.clone(),
        }
    }
}

/// One named agent. Signs what it sends and verifies what it receives.
#[derive(Clone)]
pub struct Participant {
    agent_id: String,
    ctx: RunContext,
}

impl Participant {
    pub fn id(&self) -> &str {
        &self.agent_id
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.ctx.store
    }

    /// Start an envelope from this participant with the run's default TTL and priority.
    pub fn envelope(&self, message_type: MessageType, receiver: &str) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type)
            .sender(self.agent_id.clone())
            .receiver(receiver)
            .ttl(self.ctx.default_ttl)
            .priority(self.ctx.default_priority)
    }

    /// Build, sign and enqueue. The sender is always this participant.
    pub fn send(&self, builder: EnvelopeBuilder) -> Result<SignedEnvelope> {
        let envelope = builder.sender(self.agent_id.clone()).build()?;
        let signed = self.ctx.signer.sign(envelope)?;
        let monitor = self.monitor_for(&signed);

        if let Err(e) = self.ctx.transport.send(signed.clone()) {
            monitor.task_error(&signed.message_id, &self.agent_id, "send", e.to_string());
            return Err(e);
        }

        monitor.agent_message(
            &signed.message_id,
            &self.agent_id,
            signed.message_type.as_str(),
            format!("Sent {} to {}", signed.message_type, signed.receiver()),
            json!({"direction": "sent", "receiver": signed.receiver()}),
        );
        Ok(signed)
    }

    /// Wait for the next valid message.
    ///
    /// Messages with a bad signature or an unsupported protocol version are
    /// dropped and reported as `task_error` events; the wait then continues
    /// until `timeout`, exactly as if nothing had arrived.
    pub async fn receive(&self, timeout: Duration, cancel: &CancellationToken) -> Receipt {
        self.receive_valid(None, timeout, cancel).await
    }

    /// Like [`receive`](Self::receive), restricted to one message type.
    pub async fn receive_of_type(
        &self,
        message_type: MessageType,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Receipt {
        self.receive_valid(Some(message_type), timeout, cancel).await
    }

    async fn receive_valid(
        &self,
        filter: Option<MessageType>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Receipt {
        // No deadline when `timeout` is too large to represent.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
            let transport = &self.ctx.transport;
            let receipt = match filter {
                Some(t) => transport.receive_of_type(&self.agent_id, t, remaining, cancel).await,
                None => transport.receive(&self.agent_id, remaining, cancel).await,
            };
            let Receipt::Message(envelope) = receipt else {
                return receipt;
            };

            match self.validate(&envelope) {
                Ok(()) => {
                    self.monitor_for(&envelope).agent_message(
                        &envelope.message_id,
                        &self.agent_id,
                        envelope.message_type.as_str(),
                        format!("Received {} from {}", envelope.message_type, envelope.sender()),
                        json!({"direction": "received", "sender": envelope.sender()}),
                    );
                    return Receipt::Message(envelope);
                }
                Err((kind, reason)) => {
                    tracing::warn!(
                        message_id = %envelope.message_id,
                        sender = %envelope.sender(),
                        receiver = %self.agent_id,
                        trace_id = %envelope.trace_id,
                        correlation_id = %envelope.correlation_id,
                        reason = %reason,
                        "Dropped invalid message"
                    );
                    self.monitor_for(&envelope).task_error(
                        &envelope.message_id,
                        &self.agent_id,
                        kind,
                        reason,
                    );
                }
            }
        }
    }

    fn validate(&self, envelope: &SignedEnvelope) -> std::result::Result<(), (&'static str, String)> {
        if !self.ctx.signer.verify(envelope) {
            return Err(("signature", "signature verification failed".to_string()));
        }
        if let Err(e @ Error::UnsupportedVersion(_)) = envelope.check_version() {
            return Err(("version", e.to_string()));
        }
        Ok(())
    }

    /// Write to the shared store and emit a `state_change` event.
    pub fn put_state(
        &self,
        monitor: &Monitor,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let old = self.ctx.store.get(key);
        self.ctx.store.set(key, value.clone(), ttl)?;
        monitor.state_change(key, &self.agent_id, key, old.as_ref(), Some(&value));
        Ok(())
    }

    /// Monitor bound to an envelope's trace and correlation IDs.
    pub fn monitor_for(&self, envelope: &SignedEnvelope) -> Monitor {
        self.monitor(&envelope.trace_id, &envelope.correlation_id)
    }

    pub fn monitor(&self, trace_id: &str, correlation_id: &str) -> Monitor {
        Monitor::new(self.ctx.bus.clone(), trace_id, correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventRecorder, EventType};
    use crate::protocol::{sign, verify, Envelope};

    fn settings(secret: &str) -> Settings {
        Settings {
            a2a_shared_secret: secret.to_string(),
            ..Settings::default()
        }
    }

    const WAIT: Duration = Duration::from_millis(200);

    #[test]
    fn test_paris_proposal_end_to_end_signature() {
        let envelope = Envelope::proposal(json!({"destination": "Paris"}))
            .sender("planner")
            .receiver("optimizer")
            .build()
            .unwrap();
        let signed = sign(envelope, "abc123").unwrap();

        assert!(verify(&signed, "abc123"));
        assert!(!verify(&signed, "wrong-secret"));
    }

    #[tokio::test]
    async fn test_send_and_receive_between_participants() {
        let ctx = RunContext::new(&settings("abc123"));
        let recorder = Arc::new(EventRecorder::new("recorder"));
        ctx.bus.register_listener(recorder.clone());
        let planner = ctx.participant("planner");
        let optimizer = ctx.participant("optimizer");
        let cancel = CancellationToken::new();

        let sent = planner
            .send(
                planner
                    .envelope(MessageType::Proposal, "optimizer")
                    .payload(json!({"destination": "Paris"})),
            )
            .unwrap();

        let received = optimizer.receive(WAIT, &cancel).await.into_message().unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.payload["destination"], "Paris");

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == EventType::AgentMessage));
        assert!(events.iter().all(|e| e.trace_id == sent.trace_id));
    }

    #[tokio::test]
    async fn test_sender_cannot_be_spoofed() {
        let ctx = RunContext::new(&settings("abc123"));
        let planner = ctx.participant("planner");
        ctx.participant("optimizer");

        let sent = planner
            .send(Envelope::proposal(json!({})).sender("mallory").receiver("optimizer"))
            .unwrap();
        assert_eq!(sent.sender(), "planner");
    }

    #[tokio::test]
    async fn test_send_to_unknown_receiver_reports_error() {
        let ctx = RunContext::new(&settings("abc123"));
        let recorder = Arc::new(EventRecorder::new("recorder"));
        ctx.bus.register_listener(recorder.clone());
        let planner = ctx.participant("planner");

        let result = planner.send(planner.envelope(MessageType::Query, "ghost"));
        assert!(matches!(result, Err(Error::UnknownReceiver(_))));
        assert_eq!(recorder.events()[0].event_type, EventType::TaskError);
    }

    #[tokio::test]
    async fn test_forged_message_is_treated_as_no_message() {
        let ctx = RunContext::new(&settings("abc123"));
        let recorder = Arc::new(EventRecorder::new("recorder"));
        ctx.bus.register_listener(recorder.clone());
        let optimizer = ctx.participant("optimizer");
        let cancel = CancellationToken::new();

        let forged = Envelope::proposal(json!({"destination": "Paris"}))
            .sender("planner")
            .receiver("optimizer")
            .build()
            .unwrap();
        ctx.transport.send(sign(forged, "wrong-secret").unwrap()).unwrap();

        assert_eq!(optimizer.receive(WAIT, &cancel).await, Receipt::TimedOut);
        let errors: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::TaskError)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.as_ref().unwrap().kind, "signature");
    }

    #[tokio::test]
    async fn test_valid_message_after_forged_one_is_delivered() {
        let ctx = RunContext::new(&settings("abc123"));
        let planner = ctx.participant("planner");
        let optimizer = ctx.participant("optimizer");
        let cancel = CancellationToken::new();

        let forged = planner.envelope(MessageType::Proposal, "optimizer").build().unwrap();
        ctx.transport.send(sign(forged, "wrong-secret").unwrap()).unwrap();
        let good = planner.send(planner.envelope(MessageType::Proposal, "optimizer")).unwrap();

        let received = optimizer.receive(WAIT, &cancel).await.into_message().unwrap();
        assert_eq!(received.message_id, good.message_id);
    }

    #[tokio::test]
    async fn test_unknown_major_version_is_dropped() {
        let ctx = RunContext::new(&settings("abc123"));
        let optimizer = ctx.participant("optimizer");
        let cancel = CancellationToken::new();

        let mut future = Envelope::proposal(json!({}))
            .sender("planner")
            .receiver("optimizer")
            .build()
            .unwrap();
        future.version = "2.0".to_string();
        ctx.transport.send(ctx.signer().sign(future).unwrap()).unwrap();

        assert_eq!(optimizer.receive(WAIT, &cancel).await, Receipt::TimedOut);
    }

    #[tokio::test]
    async fn test_receive_with_unbounded_timeout() {
        let ctx = RunContext::new(&settings("abc123"));
        let planner = ctx.participant("planner");
        let optimizer = ctx.participant("optimizer");
        let cancel = CancellationToken::new();

        let sent = planner.send(planner.envelope(MessageType::Proposal, "optimizer")).unwrap();
        let received = optimizer
            .receive_of_type(MessageType::Proposal, Duration::MAX, &cancel)
            .await
            .into_message()
            .unwrap();
        assert_eq!(received.message_id, sent.message_id);
    }

    #[tokio::test]
    async fn test_put_state_emits_state_change() {
        let ctx = RunContext::new(&settings("abc123"));
        let recorder = Arc::new(EventRecorder::new("recorder"));
        ctx.bus.register_listener(recorder.clone());
        let planner = ctx.participant("planner");
        let monitor = planner.monitor("trace-1", "corr-1");

        planner.put_state(&monitor, "budget_total", json!(4700), None).unwrap();
        planner.put_state(&monitor, "budget_total", json!(5200), None).unwrap();

        assert_eq!(planner.store().get("budget_total"), Some(json!(5200)));
        let last = recorder.events().pop().unwrap();
        assert_eq!(last.event_type, EventType::StateChange);
        assert_eq!(last.data["old_value"], 4700);
    }
}
