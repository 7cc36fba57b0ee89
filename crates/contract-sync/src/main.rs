//! CLI entry point for contract-sync.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use contract_sync_app::SyncConfig;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

mod replay;

/// Inspect the client-side sync core against recorded push streams.
#[derive(Parser, Debug)]
#[command(
    name = "contract-sync",
    version,
    about = "contract-sync: cache, request coordination and realtime conflict handling"
)]
struct Cli {
    /// Directory the configuration is discovered from (defaults to current).
    #[arg(long)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed recorded push events through the consumer and print the result as JSON.
    Replay {
        /// Push events, one JSON object per line.
        #[arg(long)]
        events: PathBuf,
        /// JSON array of local writes pending before the first event.
        #[arg(long)]
        mutations: Option<PathBuf>,
    },

    /// Print the effective configuration.
    Config,
}

fn main() -> Result<()> {
    let Cli { dir, cmd } = Cli::parse();
    install_tracing();

    let dir = dir.unwrap_or_else(|| PathBuf::from("."));
    let config = SyncConfig::load(&dir)?;
    execute_command(config, cmd)
}

fn execute_command(config: SyncConfig, command: Command) -> Result<()> {
    match command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Replay { events, mutations } => {
            let events = replay::read_events(&events)?;
            let mutations = match mutations {
                Some(path) => replay::read_mutations(&path)?,
                None => Vec::new(),
            };
            let report = tokio::runtime::Runtime::new()
                .context("failed to start tokio runtime")?
                .block_on(replay::replay(config, events, mutations))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn install_tracing() {
    // RUST_LOG overrides the INFO default; stdout stays reserved for command output.
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
