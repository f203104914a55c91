use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use challenge_harness::config::HarnessConfig;
use challenge_harness::ui::UiMode;

mod cmd;

#[derive(Parser)]
#[command(name = "challenge-harness")]
#[command(
    version,
    about = "Drives challenges through their full lifecycle against a live platform"
)]
pub struct Cli {
    /// Path to harness.toml (defaults to $HARNESS_CONFIG, then ./harness.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write process logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a flow in the terminal (Ctrl+C cancels)
    Run {
        /// standard, first2finish, topgear, topgear-late or design
        flow: String,

        /// Stop right after this step completes
        #[arg(long)]
        to_step: Option<String>,

        /// UI output mode
        #[arg(long, value_enum, default_value_t = UiMode::Full)]
        ui: UiMode,
    },
    /// List a flow's steps in order
    Steps { flow: String },
    /// Serve the HTTP/WebSocket surface
    Serve {
        /// Port to serve on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Inspect or clear the last run's snapshot
    Snapshot {
        #[command(subcommand)]
        command: Option<SnapshotCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a commented default harness.toml
    Init {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum SnapshotCommands {
    /// Print the last run's snapshot
    Show,
    /// Delete the snapshot
    Reset,
}

/// Console logs go to stderr (warnings only unless verbose); the daily file
/// under the log directory gets everything `RUST_LOG` lets through.
fn init_tracing(log_dir: &Path, verbose: bool, json: bool) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_level = if verbose { LevelFilter::INFO } else { LevelFilter::WARN };

    let file = std::fs::create_dir_all(log_dir)
        .map_err(|e| e.to_string())
        .and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("harness")
                .filename_suffix("log")
                .build(log_dir)
                .map_err(|e| e.to_string())
        });
    let (file_writer, guard, file_error) = match file {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    let file_layer = file_writer.map(|writer| {
        if json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed()
        }
    });
    let console_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_level)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(console_level)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!(log_dir = %log_dir.display(), error = %e, "file logging disabled");
    }
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let config_path = HarnessConfig::resolve_path(cli.config.as_deref());

    // `config` subcommands must work even when the file is broken.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_path, command.clone());
    }

    let config = HarnessConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let _guard = init_tracing(&config.engine.log_dir(), cli.verbose, cli.log_json);
    tracing::debug!(config = %config_path.display(), "configuration loaded");

    match &cli.command {
        Commands::Run { flow, to_step, ui } => {
            cmd::cmd_run(&config, flow, to_step.clone(), *ui, cli.verbose).await?;
        }
        Commands::Steps { flow } => cmd::cmd_steps(flow)?,
        Commands::Serve { port } => cmd::cmd_serve(&config, *port).await?,
        Commands::Snapshot { command } => cmd::cmd_snapshot(&config, command.clone())?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
