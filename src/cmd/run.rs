//! Terminal runs: `challenge-harness run` and `challenge-harness steps`.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;

use challenge_harness::config::HarnessConfig;
use challenge_harness::controller::{RunController, RunRequest};
use challenge_harness::flows::{FlowEnv, FlowKind, RunMode};
use challenge_harness::snapshot::SnapshotStore;
use challenge_harness::ui::{RunUI, UiMode};

pub fn cmd_steps(flow: &str) -> Result<()> {
    let kind: FlowKind = flow.parse()?;
    println!("{} ({} steps)", style(kind).bold(), kind.steps().len());
    for (i, step) in kind.steps().iter().enumerate() {
        println!("  {:>2}. {}", i + 1, step);
    }
    Ok(())
}

pub async fn cmd_run(
    config: &HarnessConfig,
    flow: &str,
    to_step: Option<String>,
    ui_mode: UiMode,
    verbose: bool,
) -> Result<()> {
    let kind: FlowKind = flow.parse()?;
    let mode = match to_step {
        Some(step) => RunMode::ToStep(step),
        None => RunMode::Full,
    };
    mode.validate(kind)?;

    if ui_mode != UiMode::Json {
        for warning in config.validate() {
            eprintln!("{} {}", style("warning:").yellow().bold(), warning);
        }
    }

    let env = FlowEnv::from_config(config)?;
    let snapshot_path = config.engine.snapshot_path();
    let store = SnapshotStore::open(&snapshot_path)
        .with_context(|| format!("Failed to open snapshot store at {}", snapshot_path.display()))?;
    let controller = RunController::new(Arc::new(env), Arc::new(store));

    let mut handle = controller.start(RunRequest { flow: kind, mode }).await?;
    tracing::info!(run_id = %handle.run_id, flow = %kind, "running in terminal");

    let ui = RunUI::new(kind.as_str(), kind.steps().len(), ui_mode, verbose);
    let mut cancelling = false;
    loop {
        tokio::select! {
            event = handle.events.recv() => {
                match event {
                    Some(event) => ui.handle_event(&event),
                    None => break,
                }
            }
            signal = tokio::signal::ctrl_c(), if !cancelling => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                cancelling = true;
                controller.cancel();
                eprintln!("{}", style("Cancelling run...").yellow());
            }
        }
    }

    let summary = ui.finish();
    match summary.outcome.as_deref() {
        Some("completed" | "stopped" | "cancelled") => Ok(()),
        Some(outcome) => anyhow::bail!("Run {} ({} step(s) failed)", outcome, summary.steps_failed),
        None => anyhow::bail!("Run ended without reporting an outcome"),
    }
}
