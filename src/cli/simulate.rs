use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::clients::memory::World;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::ledger::{JsonlLedger, LedgerReader, LedgerWriter, MemoryLedger};
use crate::pipeline::{Reconciler, RunReport, SimulatedWorld};
use crate::triggers::Event;

/// What a simulation did, printed as JSON when it finishes.
#[derive(Debug, Serialize)]
pub struct SimulationSummary {
    #[serde(flatten)]
    pub run: RunReport,
    pub assignments: usize,
    pub ledger_entries: usize,
    pub notifications: Vec<String>,
}

/// Read events from a JSON-lines file. Blank lines and `#` comments are
/// skipped.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let file = fs::File::open(path)?;
    let mut events = Vec::new();

    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(trimmed).map_err(|e| ReconcileError::EventParse {
            path: path.to_path_buf(),
            line: line_num + 1,
            reason: e.to_string(),
        })?;
        events.push(event);
    }

    Ok(events)
}

/// Replay an event file against an in-memory world. Each event is drained
/// through every stage, including completion, before the next is submitted.
pub async fn run(
    mut config: ReconcilerConfig,
    world_path: &Path,
    events_path: &Path,
    ledger_path: Option<&Path>,
) -> Result<SimulationSummary> {
    let world = World::load_from(world_path)?;
    if config.management_account_id.is_none() {
        config.management_account_id = world.management_account_id.clone();
    }
    let events = read_events(events_path)?;
    let sim = SimulatedWorld::new(&world)?;

    tracing::info!(
        events = events.len(),
        world = %world_path.display(),
        "starting simulation"
    );

    let summary = match ledger_path {
        Some(path) => replay(config, &sim, &events, Arc::new(JsonlLedger::new(path))).await?,
        None => replay(config, &sim, &events, Arc::new(MemoryLedger::new())).await?,
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary)
}

async fn replay<L>(
    config: ReconcilerConfig,
    sim: &SimulatedWorld,
    events: &[Event],
    ledger: Arc<L>,
) -> Result<SimulationSummary>
where
    L: LedgerWriter + 'static,
{
    let reconciler = Reconciler::new(config, sim.collaborators(), ledger.clone());
    let mut total = RunReport::default();

    for event in events {
        sim.apply(event);
        let running = reconciler.start();
        running.submit(event).await;
        total.absorb(&running.shutdown().await);
    }

    Ok(SimulationSummary {
        run: total,
        assignments: sim.assignment.assignment_count(),
        ledger_entries: ledger.entries()?.len(),
        notifications: sim
            .notifications
            .notifications()
            .into_iter()
            .map(|n| format!("{}: {}", n.subject, n.error_details))
            .collect(),
    })
}
