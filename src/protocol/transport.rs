//! In-memory addressed transport between named participants.
//!
//! Each participant owns one inbound queue. A queue exists once the participant
//! calls [`Transport::register`] or first calls one of the receive methods;
//! sending to a participant without a queue fails with `UnknownReceiver`.
//! Messages are FIFO per receiver, which gives FIFO per (sender, receiver)
//! pair. No ordering holds across different senders.
//!
//! Subscribers get push delivery on top of the queue: every callback
//! registered for the receiver runs on each successful send, after the
//! envelope is enqueued. A failing or panicking callback is logged and never
//! affects the send or the other callbacks.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::signer::SignedEnvelope;
use super::types::MessageType;
use crate::error::{Error, Result};
use crate::events::bus::panic_message;

/// Default number of sent envelopes kept for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Outcome of a receive call.
#[derive(Debug, Clone, PartialEq)]
pub enum Receipt {
    /// A live message was dequeued
    Message(SignedEnvelope),
    /// Nothing arrived before the timeout
    TimedOut,
    /// The wait was cancelled; no message was consumed
    Cancelled,
}

impl Receipt {
    pub fn into_message(self) -> Option<SignedEnvelope> {
        match self {
            Receipt::Message(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Receipt::Message(_))
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub sent: u64,
    pub delivered: u64,
    pub expired: u64,
}

/// Push callback for messages sent to one participant.
pub type Subscriber = Arc<dyn Fn(&SignedEnvelope) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`Transport::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<SignedEnvelope>>,
    notify: Notify,
}

impl Inbox {
    fn queue(&self) -> MutexGuard<'_, VecDeque<SignedEnvelope>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory transport shared by all participants of one workflow run.
pub struct Transport {
    inboxes: RwLock<HashMap<String, Arc<Inbox>>>,
    history: Mutex<VecDeque<SignedEnvelope>>,
    history_limit: usize,
    subscribers: RwLock<HashMap<String, Vec<(SubscriberId, Subscriber)>>>,
    next_subscriber: AtomicU64,
    sent: AtomicU64,
    delivered: AtomicU64,
    expired: AtomicU64,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            inboxes: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit,
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Create the inbound queue for `agent_id`. Idempotent.
    pub fn register(&self, agent_id: &str) {
        self.inbox(agent_id);
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_id)
    }

    /// Registered participant IDs, sorted.
    pub fn participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Enqueue a signed envelope onto its receiver's queue.
    pub fn send(&self, envelope: SignedEnvelope) -> Result<()> {
        let receiver = envelope.receiver().to_string();
        let inbox = self
            .existing_inbox(&receiver)
            .ok_or_else(|| Error::UnknownReceiver(receiver.clone()))?;

        tracing::info!(
            message_id = %envelope.message_id,
            message_type = %envelope.message_type,
            sender = %envelope.sender(),
            receiver = %receiver,
            timestamp = %envelope.timestamp.to_rfc3339(),
            trace_id = %envelope.trace_id,
            correlation_id = %envelope.correlation_id,
            "Message sent"
        );

        self.record_history(&envelope);
        inbox.queue().push_back(envelope.clone());
        self.sent.fetch_add(1, Ordering::Relaxed);
        inbox.notify.notify_waiters();
        self.notify_subscribers(&receiver, &envelope);
        Ok(())
    }

    /// Call `callback` for every message sent to `agent_id` from now on.
    ///
    /// Registers the participant's queue if needed. Queued delivery is
    /// unaffected: the message can still be received.
    pub fn subscribe<F>(&self, agent_id: &str, callback: F) -> SubscriberId
    where
        F: Fn(&SignedEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(agent_id);
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(agent_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        tracing::info!(agent_id, "Subscribed callback");
        id
    }

    /// Remove a subscription. Returns `false` if the handle was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        for (agent_id, callbacks) in subscribers.iter_mut() {
            let before = callbacks.len();
            callbacks.retain(|(existing, _)| *existing != id);
            if callbacks.len() != before {
                tracing::info!(agent_id = %agent_id, "Unsubscribed callback");
                return true;
            }
        }
        false
    }

    fn notify_subscribers(&self, receiver: &str, envelope: &SignedEnvelope) {
        let callbacks: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(receiver)
            .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        for callback in callbacks {
            let failure = match panic::catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            tracing::error!(
                message_id = %envelope.message_id,
                receiver,
                trace_id = %envelope.trace_id,
                correlation_id = %envelope.correlation_id,
                error = %failure,
                "Subscriber callback failed"
            );
        }
    }

    /// Wait up to `timeout` for the next live message addressed to `agent_id`.
    pub async fn receive(
        &self,
        agent_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Receipt {
        self.receive_filtered(agent_id, None, timeout, cancel).await
    }

    /// Like [`receive`](Self::receive), but only takes the first message of
    /// `message_type`. Other messages keep their queue position.
    pub async fn receive_of_type(
        &self,
        agent_id: &str,
        message_type: MessageType,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Receipt {
        self.receive_filtered(agent_id, Some(message_type), timeout, cancel)
            .await
    }

    async fn receive_filtered(
        &self,
        agent_id: &str,
        filter: Option<MessageType>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Receipt {
        let inbox = self.inbox(agent_id);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            // A cancelled wait must leave the queue untouched.
            if cancel.is_cancelled() {
                tracing::debug!(agent_id, "Receive cancelled");
                return Receipt::Cancelled;
            }

            // Register interest before checking, so a send between the check
            // and the select still wakes us.
            let notified = inbox.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.take_next(agent_id, &inbox, filter) {
                return Receipt::Message(envelope);
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = &mut deadline => {
                    tracing::debug!(agent_id, ?timeout, "Receive timed out");
                    return Receipt::TimedOut;
                }
                _ = cancel.cancelled() => {
                    tracing::debug!(agent_id, "Receive cancelled");
                    return Receipt::Cancelled;
                }
            }
        }
    }

    /// Dequeue the first live match, dropping expired messages on the way.
    fn take_next(
        &self,
        agent_id: &str,
        inbox: &Inbox,
        filter: Option<MessageType>,
    ) -> Option<SignedEnvelope> {
        let now = Utc::now();
        let mut queue = inbox.queue();
        let mut i = 0;
        while i < queue.len() {
            if queue[i].is_expired_at(now) {
                if let Some(expired) = queue.remove(i) {
                    self.expired.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        message_id = %expired.message_id,
                        sender = %expired.sender(),
                        receiver = agent_id,
                        timestamp = %expired.timestamp.to_rfc3339(),
                        ttl = expired.meta.ttl,
                        trace_id = %expired.trace_id,
                        correlation_id = %expired.correlation_id,
                        "Dropped expired message"
                    );
                }
                continue;
            }
            if filter.map_or(true, |t| queue[i].message_type == t) {
                let envelope = queue.remove(i)?;
                drop(queue);
                self.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    message_id = %envelope.message_id,
                    sender = %envelope.sender(),
                    receiver = agent_id,
                    timestamp = %envelope.timestamp.to_rfc3339(),
                    trace_id = %envelope.trace_id,
                    correlation_id = %envelope.correlation_id,
                    "Message delivered"
                );
                return Some(envelope);
            }
            i += 1;
        }
        None
    }

    /// Discard everything queued for `agent_id`. Returns the number discarded.
    pub fn clear_queue(&self, agent_id: &str) -> usize {
        let Some(inbox) = self.existing_inbox(agent_id) else {
            return 0;
        };
        let mut queue = inbox.queue();
        let count = queue.len();
        queue.clear();
        tracing::info!(agent_id, count, "Cleared queue");
        count
    }

    /// Messages currently queued for `agent_id`, including not yet purged expired ones.
    pub fn queue_size(&self, agent_id: &str) -> usize {
        self.existing_inbox(agent_id)
            .map(|inbox| inbox.queue().len())
            .unwrap_or(0)
    }

    /// Most recent sent envelopes, oldest first, optionally filtered.
    pub fn history(
        &self,
        trace_id: Option<&str>,
        correlation_id: Option<&str>,
        limit: usize,
    ) -> Vec<SignedEnvelope> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<&SignedEnvelope> = history
            .iter()
            .filter(|e| trace_id.map_or(true, |t| e.trace_id == t))
            .filter(|e| correlation_id.map_or(true, |c| e.correlation_id == c))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    fn record_history(&self, envelope: &SignedEnvelope) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(envelope.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    fn existing_inbox(&self, agent_id: &str) -> Option<Arc<Inbox>> {
        self.inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    fn inbox(&self, agent_id: &str) -> Arc<Inbox> {
        if let Some(inbox) = self.existing_inbox(agent_id) {
            return inbox;
        }
        let mut inboxes = self.inboxes.write().unwrap_or_else(PoisonError::into_inner);
        inboxes
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(agent_id, "Registered inbound queue");
                Arc::new(Inbox::default())
            })
            .clone()
    }
}
