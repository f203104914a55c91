//! Last-run snapshot commands: `challenge-harness snapshot`.

use anyhow::{Context, Result};

use challenge_harness::config::HarnessConfig;
use challenge_harness::snapshot::SnapshotStore;

use super::super::SnapshotCommands;

pub fn cmd_snapshot(config: &HarnessConfig, command: Option<SnapshotCommands>) -> Result<()> {
    let path = config.engine.snapshot_path();
    let store = SnapshotStore::open(&path)
        .with_context(|| format!("Failed to open snapshot store at {}", path.display()))?;

    match command {
        None | Some(SnapshotCommands::Show) => {
            let snapshot = store.current();
            if snapshot.run_id.is_none() {
                println!("No run snapshot at {}", path.display());
                return Ok(());
            }
            let json = serde_json::to_string_pretty(&snapshot)
                .context("Failed to serialize snapshot")?;
            println!("{}", json);
        }
        Some(SnapshotCommands::Reset) => {
            store.reset()?;
            println!("Snapshot cleared ({})", path.display());
        }
    }
    Ok(())
}
