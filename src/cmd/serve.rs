//! HTTP/WebSocket server command: `challenge-harness serve`.

use std::sync::Arc;

use anyhow::{Context, Result};

use challenge_harness::config::HarnessConfig;
use challenge_harness::controller::RunController;
use challenge_harness::flows::FlowEnv;
use challenge_harness::server::{shutdown_signal, start_server};
use challenge_harness::snapshot::SnapshotStore;

pub async fn cmd_serve(config: &HarnessConfig, port: Option<u16>) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let mut server = config.server.clone();
    if let Some(port) = port {
        server.port = port;
    }

    let env = FlowEnv::from_config(config)?;
    let snapshot_path = config.engine.snapshot_path();
    let store = SnapshotStore::open(&snapshot_path)
        .with_context(|| format!("Failed to open snapshot store at {}", snapshot_path.display()))?;
    let controller = Arc::new(RunController::new(Arc::new(env), Arc::new(store)));

    start_server(controller, &server, shutdown_signal()).await
}
