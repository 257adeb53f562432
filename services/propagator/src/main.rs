//! Policy propagator dry run.
//!
//! Loads a snapshot of policies and placement objects into the in-memory
//! store, runs one propagation pass and prints the resulting objects and
//! the events that were recorded.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use propagator::{
    store::{InMemoryStore, Snapshot},
    telemetry::{init_tracing, MemoryEventRecorder, RecordedEvent},
    templates::HubTemplateResolver,
    Config, PassStats, PolicyReconciler, PropagationWorker,
};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "propagator", version, about = "Run one policy propagation pass over a snapshot")]
struct Cli {
    /// JSON snapshot of the store contents
    #[arg(long, env = "PROPAGATOR_SNAPSHOT")]
    snapshot: PathBuf,

    /// Number of passes to run
    #[arg(long, default_value_t = 1)]
    passes: u32,

    /// Pretty-print the output
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Output {
    passes: Vec<PassStats>,
    objects: Snapshot,
    events: Vec<RecordedEvent>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    init_tracing(&config.log_level, config.log_json);

    let raw = std::fs::read_to_string(&cli.snapshot)
        .with_context(|| format!("reading snapshot {}", cli.snapshot.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&raw).context("parsing snapshot")?;

    let store = Arc::new(InMemoryStore::from_snapshot(snapshot)?);
    let recorder = Arc::new(MemoryEventRecorder::new());

    let reconciler = PolicyReconciler::new(
        Arc::clone(&store),
        Arc::new(HubTemplateResolver::new()),
        recorder.clone(),
        Arc::new(config),
    );
    let worker = PropagationWorker::new(reconciler);

    let mut passes = Vec::new();
    for pass in 1..=cli.passes.max(1) {
        let stats = worker.run_once().await?;
        info!(pass, ?stats, "Pass finished");
        passes.push(stats);
    }

    let output = Output {
        passes,
        objects: store.snapshot()?,
        events: recorder.events(),
    };

    let json = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{json}");

    Ok(())
}
