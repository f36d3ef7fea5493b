//! CLI commands for the A2A relay using clap.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::agent::RunContext;
use crate::config::Settings;
use crate::error::Error;
use crate::events::TracingListener;
use crate::protocol::{Envelope, Signer};
use crate::state::{InMemoryStateStore, StateStore};
use crate::workflow::run_exchange;

/// A2A relay - signed agent-to-agent messaging with shared state and events.
#[derive(Parser)]
#[command(name = "a2a-relay")]
#[command(version)]
#[command(about = "Signed agent-to-agent message relay", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true, env = "A2A_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a planner/optimizer exchange in-process and print the result
    Demo {
        /// Trip destination put in the proposal
        #[arg(long, default_value = "Paris")]
        destination: String,

        /// Proposed total budget
        #[arg(long, default_value_t = 4700)]
        budget: u64,
    },

    /// Sign an envelope JSON file with the configured secret
    Sign {
        file: PathBuf,
    },

    /// Check the signature of an envelope JSON file
    Verify {
        file: PathBuf,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self, settings: &Settings) -> Result<()> {
        match &self.command {
            Command::Demo { destination, budget } => cmd_demo(settings, destination, *budget).await,
            Command::Sign { file } => cmd_sign(settings, file),
            Command::Verify { file } => cmd_verify(settings, file),
        }
    }
}

// Command implementations

async fn cmd_demo(settings: &Settings, destination: &str, budget: u64) -> Result<()> {
    let cancel = CancellationToken::new();
    let store = Arc::new(InMemoryStateStore::new());
    let sweeper = settings
        .state_sweep_interval()
        .map(|interval| store.spawn_sweeper(interval, cancel.child_token()));

    let ctx = RunContext::new(settings).with_store(store as Arc<dyn StateStore>);
    ctx.bus.register_listener(Arc::new(TracingListener));
    let planner = ctx.participant("planner");
    let optimizer = ctx.participant("optimizer");

    let proposal = json!({
        "destination": destination,
        "budget_total": budget,
        "currency": "USD",
    });

    let exchange = run_exchange(
        &planner,
        &optimizer,
        proposal,
        trim_budget,
        settings.receive_timeout(),
        &cancel,
    );
    let result = tokio::select! {
        result = exchange => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            Err(Error::Workflow("interrupted".to_string()))
        }
    };

    cancel.cancel();
    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "State sweeper task failed");
        }
    }

    let assembled = result?;
    let stats = ctx.transport.stats();
    tracing::info!(
        trace_id = %assembled.trace_id,
        participants = ?ctx.transport.participants(),
        sent = stats.sent,
        delivered = stats.delivered,
        expired = stats.expired,
        events = ctx.bus.emitted(),
        "Demo exchange finished"
    );
    println!("{}", serde_json::to_string_pretty(&assembled)?);
    Ok(())
}

/// Demo optimizer: cut the budget by a tenth and record what changed.
fn trim_budget(proposal: &Value) -> crate::Result<Value> {
    let budget = proposal
        .get("budget_total")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Validation("budget_total must be a positive integer".to_string()))?;

    let trimmed = budget - budget / 10;
    let mut optimized = proposal.clone();
    optimized["budget_total"] = json!(trimmed);
    optimized["optimization_applied"] = json!([format!(
        "Reduced budget from {} to {}",
        budget, trimmed
    )]);
    Ok(optimized)
}

fn read_envelope(path: &Path) -> Result<Envelope> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not a valid envelope", path.display()))
}

fn cmd_sign(settings: &Settings, file: &Path) -> Result<()> {
    let envelope = read_envelope(file)?;
    let signed = Signer::new(&settings.a2a_shared_secret).sign(envelope)?;
    println!("{}", serde_json::to_string_pretty(&signed)?);
    Ok(())
}

fn cmd_verify(settings: &Settings, file: &Path) -> Result<()> {
    let envelope = read_envelope(file)?;
    if !Signer::new(&settings.a2a_shared_secret).verify(&envelope) {
        anyhow::bail!("Signature verification failed for {}", envelope.message_id);
    }
    println!("Signature valid for {}", envelope.message_id);
    Ok(())
}
