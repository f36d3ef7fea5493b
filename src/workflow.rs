//! Proposal/optimization workflow.
//!
//! A planner sends a proposal, an optimizer answers with an optimized plan,
//! and the planner assembles both from the shared store:
//!
//! ```text
//! created -> proposed -> optimizing -> optimized -> assembled
//!     \________\____________\____________\-------> errored
//! ```
//!
//! `assembled` and `errored` are terminal.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::Participant;
use crate::error::{Error, Result};
use crate::events::Monitor;
use crate::protocol::{new_trace_id, Envelope, MessageType, Receipt};
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Proposed,
    Optimizing,
    Optimized,
    Assembled,
    Errored,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Created => "created",
            WorkflowState::Proposed => "proposed",
            WorkflowState::Optimizing => "optimizing",
            WorkflowState::Optimized => "optimized",
            WorkflowState::Assembled => "assembled",
            WorkflowState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Assembled | WorkflowState::Errored)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store key holding the proposal of one exchange.
pub fn proposal_key(correlation_id: &str) -> String {
    format!("proposal:{}", correlation_id)
}

/// Store key holding the optimized plan of one exchange.
pub fn optimized_plan_key(correlation_id: &str) -> String {
    format!("optimized_plan:{}", correlation_id)
}

/// Final output of a successful exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssembledPlan {
    pub trace_id: String,
    pub correlation_id: String,
    pub proposal: Value,
    pub optimized_plan: Value,
}

/// State of one proposal/optimization exchange.
pub struct Workflow {
    trace_id: String,
    correlation_id: String,
    state: WorkflowState,
    error: Option<String>,
    monitor: Option<Monitor>,
}

impl Workflow {
    pub fn new(trace_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            correlation_id: correlation_id.into(),
            state: WorkflowState::Created,
            error: None,
            monitor: None,
        }
    }

    /// Report transitions as `state_change` events.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Why the workflow errored, if it did.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn transition(&mut self, from: WorkflowState, to: WorkflowState) -> Result<()> {
        if self.state != from {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.enter(to);
        Ok(())
    }

    fn enter(&mut self, to: WorkflowState) {
        let from = std::mem::replace(&mut self.state, to);
        tracing::debug!(
            trace_id = %self.trace_id,
            correlation_id = %self.correlation_id,
            %from,
            %to,
            "Workflow transition"
        );
        if let Some(monitor) = &self.monitor {
            monitor.state_change(
                &self.correlation_id,
                "workflow",
                "workflow_state",
                Some(&json!(from)),
                Some(&json!(to)),
            );
        }
    }

    pub fn on_proposal_sent(&mut self) -> Result<()> {
        self.transition(WorkflowState::Created, WorkflowState::Proposed)
    }

    pub fn on_proposal_received(&mut self) -> Result<()> {
        self.transition(WorkflowState::Proposed, WorkflowState::Optimizing)
    }

    pub fn on_optimized_sent(&mut self) -> Result<()> {
        self.transition(WorkflowState::Optimizing, WorkflowState::Optimized)
    }

    /// Move to `errored` and return the matching error.
    ///
    /// A workflow that is already terminal keeps its state.
    pub fn fail(&mut self, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        if self.state.is_terminal() {
            tracing::warn!(
                correlation_id = %self.correlation_id,
                state = %self.state,
                reason = %reason,
                "Failure reported on finished workflow"
            );
        } else {
            self.error = Some(reason.clone());
            self.enter(WorkflowState::Errored);
            if let Some(monitor) = &self.monitor {
                monitor.task_error(&self.correlation_id, "workflow", "workflow", reason.clone());
            }
        }
        Error::Workflow(reason)
    }

    /// Apply an incoming envelope. An `error` envelope fails the workflow.
    pub fn observe(&mut self, envelope: &Envelope) -> Result<()> {
        if envelope.message_type != MessageType::Error {
            return Ok(());
        }
        let reason = envelope
            .payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("peer reported an error")
            .to_string();
        Err(self.fail(format!("{} reported: {}", envelope.sender(), reason)))
    }

    /// Assemble once both halves are in `store`.
    ///
    /// Returns `Ok(None)` while either key is still missing.
    pub fn assemble(&mut self, store: &dyn StateStore) -> Result<Option<AssembledPlan>> {
        if self.state != WorkflowState::Optimized {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: WorkflowState::Assembled.to_string(),
            });
        }
        let Some(proposal) = store.get(&proposal_key(&self.correlation_id)) else {
            return Ok(None);
        };
        let Some(optimized_plan) = store.get(&optimized_plan_key(&self.correlation_id)) else {
            return Ok(None);
        };

        self.enter(WorkflowState::Assembled);
        Ok(Some(AssembledPlan {
            trace_id: self.trace_id.clone(),
            correlation_id: self.correlation_id.clone(),
            proposal,
            optimized_plan,
        }))
    }
}

fn lock(workflow: &Mutex<Workflow>) -> MutexGuard<'_, Workflow> {
    workflow.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one full exchange between `planner` and `optimizer`.
///
/// Both sides run concurrently on the current task. `optimize` turns the
/// proposal payload into the optimized plan; an `Err` is reported back to the
/// planner as an `error` envelope. The planner waits at most `timeout` for
/// the answer.
pub async fn run_exchange<F>(
    planner: &Participant,
    optimizer: &Participant,
    proposal: Value,
    optimize: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<AssembledPlan>
where
    F: FnOnce(&Value) -> Result<Value>,
{
    let trace_id = new_trace_id();
    let correlation_id = new_trace_id();
    let monitor = planner.monitor(&trace_id, &correlation_id);
    let workflow =
        Mutex::new(Workflow::new(&trace_id, &correlation_id).with_monitor(monitor.clone()));
    let exchange = cancel.child_token();

    let planner_side = async {
        let result = plan(planner, optimizer.id(), proposal, &workflow, &monitor, timeout, &exchange).await;
        // Stop the optimizer if the planner gave up before it answered.
        exchange.cancel();
        result
    };
    let optimizer_side = answer(optimizer, &workflow, optimize, timeout, &exchange);

    let (planned, answered) = tokio::join!(planner_side, optimizer_side);
    if let Err(e) = answered {
        tracing::warn!(
            trace_id = %trace_id,
            correlation_id = %correlation_id,
            agent_id = optimizer.id(),
            error = %e,
            "Optimizer side finished with error"
        );
    }
    planned
}

async fn plan(
    planner: &Participant,
    optimizer_id: &str,
    proposal: Value,
    workflow: &Mutex<Workflow>,
    monitor: &Monitor,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<AssembledPlan> {
    let correlation_id = monitor.correlation_id().to_string();
    monitor.task_start(&correlation_id, planner.id(), "Creating proposal");
    planner.put_state(monitor, &proposal_key(&correlation_id), proposal.clone(), None)?;

    {
        let mut wf = lock(workflow);
        let builder = planner
            .envelope(MessageType::Proposal, optimizer_id)
            .payload(proposal)
            .trace_id(monitor.trace_id())
            .correlation_id(&correlation_id);
        if let Err(e) = planner.send(builder) {
            wf.fail(e.to_string());
            return Err(e);
        }
        wf.on_proposal_sent()?;
    }
    monitor.task_progress(&correlation_id, planner.id(), 0.5, "Waiting for optimized plan");

    // No deadline when `timeout` is too large to represent.
    let deadline = Instant::now().checked_add(timeout);
    loop {
        let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
        let envelope = match planner.receive(remaining, cancel).await {
            Receipt::Message(envelope) => envelope,
            Receipt::TimedOut => {
                return Err(lock(workflow).fail("timed out waiting for optimized plan"))
            }
            Receipt::Cancelled => return Err(lock(workflow).fail("cancelled")),
        };
        if envelope.correlation_id != correlation_id {
            tracing::warn!(
                message_id = %envelope.message_id,
                correlation_id = %envelope.correlation_id,
                expected = %correlation_id,
                "Ignoring message from another exchange"
            );
            continue;
        }

        let mut wf = lock(workflow);
        wf.observe(&envelope)?;
        if envelope.message_type != MessageType::OptimizedPlan {
            continue;
        }
        if let Some(assembled) = wf.assemble(planner.store().as_ref())? {
            monitor.task_end(&correlation_id, planner.id(), "Plan assembled");
            return Ok(assembled);
        }
        return Err(wf.fail("optimized plan missing from state store"));
    }
}

async fn answer<F>(
    optimizer: &Participant,
    workflow: &Mutex<Workflow>,
    optimize: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: FnOnce(&Value) -> Result<Value>,
{
    let request = match optimizer
        .receive_of_type(MessageType::Proposal, timeout, cancel)
        .await
    {
        Receipt::Message(envelope) => envelope,
        Receipt::TimedOut => return Err(Error::Workflow("no proposal received".to_string())),
        Receipt::Cancelled => return Err(Error::Workflow("cancelled".to_string())),
    };

    let monitor = optimizer.monitor_for(&request);
    let task_id = request.correlation_id.clone();
    lock(workflow).on_proposal_received()?;
    monitor.task_start(&task_id, optimizer.id(), "Optimizing proposal");

    match optimize(&request.payload) {
        Ok(optimized) => {
            optimizer.put_state(&monitor, &optimized_plan_key(&task_id), optimized.clone(), None)?;
            let mut wf = lock(workflow);
            optimizer.send(request.reply(MessageType::OptimizedPlan, optimized))?;
            wf.on_optimized_sent()?;
            drop(wf);
            monitor.task_end(&task_id, optimizer.id(), "Optimization complete");
            Ok(())
        }
        Err(e) => {
            monitor.task_error(&task_id, optimizer.id(), "optimize", e.to_string());
            optimizer.send(request.reply(MessageType::Error, json!({"error": e.to_string()})))?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RunContext;
    use crate::config::Settings;
    use crate::events::{EventRecorder, EventType};
    use crate::state::InMemoryStateStore;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(2);

    fn context() -> RunContext {
        RunContext::new(&Settings {
            a2a_shared_secret: "abc123".to_string(),
            ..Settings::default()
        })
    }

    #[test]
    fn test_happy_path_transitions() {
        let store = InMemoryStateStore::new();
        let mut wf = Workflow::new("trace-1", "corr-1");

        wf.on_proposal_sent().unwrap();
        wf.on_proposal_received().unwrap();
        wf.on_optimized_sent().unwrap();
        assert_eq!(wf.state(), WorkflowState::Optimized);

        store.set(&proposal_key("corr-1"), json!({"destination": "Paris"}), None).unwrap();
        assert_eq!(wf.assemble(&store).unwrap(), None);
        assert_eq!(wf.state(), WorkflowState::Optimized);

        store.set(&optimized_plan_key("corr-1"), json!({"total": 900}), None).unwrap();
        let plan = wf.assemble(&store).unwrap().unwrap();
        assert_eq!(plan.proposal["destination"], "Paris");
        assert_eq!(plan.optimized_plan["total"], 900);
        assert_eq!(wf.state(), WorkflowState::Assembled);
    }

    #[test]
    fn test_out_of_order_transition_is_rejected() {
        let mut wf = Workflow::new("trace-1", "corr-1");
        let err = wf.on_optimized_sent().unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(wf.state(), WorkflowState::Created);

        let store = InMemoryStateStore::new();
        assert!(wf.assemble(&store).is_err());
    }

    #[test]
    fn test_error_envelope_moves_to_errored() {
        let mut wf = Workflow::new("trace-1", "corr-1");
        wf.on_proposal_sent().unwrap();
        wf.on_proposal_received().unwrap();

        let report = Envelope::error(json!({"error": "budget too small"}))
            .sender("optimizer")
            .receiver("planner")
            .build()
            .unwrap();
        assert!(matches!(wf.observe(&report), Err(Error::Workflow(_))));
        assert_eq!(wf.state(), WorkflowState::Errored);
        assert!(wf.error().unwrap().contains("budget too small"));

        // terminal
        assert!(wf.on_optimized_sent().is_err());
        wf.fail("again");
        assert_eq!(wf.state(), WorkflowState::Errored);
        assert!(wf.error().unwrap().contains("budget too small"));
    }

    #[test]
    fn test_transitions_are_reported() {
        let ctx = context();
        let recorder = Arc::new(EventRecorder::new("recorder"));
        ctx.bus.register_listener(recorder.clone());
        let monitor = Monitor::new(ctx.bus.clone(), "trace-1", "corr-1");

        let mut wf = Workflow::new("trace-1", "corr-1").with_monitor(monitor);
        wf.on_proposal_sent().unwrap();

        let event = &recorder.events()[0];
        assert_eq!(event.event_type, EventType::StateChange);
        assert_eq!(event.data["old_value"], "created");
        assert_eq!(event.data["new_value"], "proposed");
    }

    #[tokio::test]
    async fn test_exchange_assembles_plan() {
        let ctx = context();
        let recorder = Arc::new(EventRecorder::new("recorder"));
        ctx.bus.register_listener(recorder.clone());
        let planner = ctx.participant("planner");
        let optimizer = ctx.participant("optimizer");
        let cancel = CancellationToken::new();

        let plan = run_exchange(
            &planner,
            &optimizer,
            json!({"destination": "Paris", "budget_total": 4700}),
            |proposal| {
                let mut optimized = proposal.clone();
                optimized["budget_total"] = json!(4200);
                Ok(optimized)
            },
            WAIT,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(plan.proposal["budget_total"], 4700);
        assert_eq!(plan.optimized_plan["budget_total"], 4200);
        assert_eq!(
            ctx.store.get(&optimized_plan_key(&plan.correlation_id)),
            Some(plan.optimized_plan.clone())
        );

        let events = recorder.events();
        assert!(events.iter().all(|e| e.trace_id == plan.trace_id));
        assert!(events.iter().all(|e| e.event_type != EventType::TaskError));
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::StateChange && e.data["new_value"] == "assembled"));
    }

    #[tokio::test]
    async fn test_exchange_reports_optimizer_failure() {
        let ctx = context();
        let planner = ctx.participant("planner");
        let optimizer = ctx.participant("optimizer");
        let cancel = CancellationToken::new();

        let result = run_exchange(
            &planner,
            &optimizer,
            json!({"destination": "Paris"}),
            |_| Err(Error::Validation("budget_total is required".to_string())),
            WAIT,
            &cancel,
        )
        .await;

        match result {
            Err(Error::Workflow(reason)) => assert!(reason.contains("budget_total is required")),
            other => panic!("expected workflow error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_exchange_errors() {
        let ctx = context();
        let planner = ctx.participant("planner");
        let optimizer = ctx.participant("optimizer");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_exchange(&planner, &optimizer, json!({}), |p| Ok(p.clone()), WAIT, &cancel).await;
        assert!(matches!(result, Err(Error::Workflow(_))));
        // The optimizer gave up without taking the proposal.
        assert_eq!(ctx.transport.queue_size("optimizer"), 1);
    }

    #[tokio::test]
    async fn test_exchange_with_unbounded_timeout() {
        let ctx = context();
        let planner = ctx.participant("planner");
        let optimizer = ctx.participant("optimizer");
        let cancel = CancellationToken::new();

        let plan = run_exchange(
            &planner,
            &optimizer,
            json!({"destination": "Paris"}),
            |p| Ok(p.clone()),
            Duration::MAX,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(plan.optimized_plan["destination"], "Paris");
    }
}
