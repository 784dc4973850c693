//! CLI entrypoint: loads a plugin, runs a campaign against a target, and
//! prints findings as they're discovered.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use fuzzcore::config::Config;
use fuzzcore::control::Engine;
use fuzzcore::session::FuzzingStrategy;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fuzzcore", version = fuzzcore::VERSION, about = "Structure-aware, stateful network-protocol fuzzer")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a fuzzing campaign against a target until interrupted.
    Run {
        #[arg(long)]
        plugin: String,
        #[arg(long)]
        endpoint: String,
        #[arg(long, value_enum, default_value = "random")]
        strategy: StrategyArg,
        #[arg(long)]
        target_state: Option<String>,
    },
    /// Send one payload to a target and print the response as hex.
    OneShot {
        #[arg(long)]
        plugin: String,
        #[arg(long)]
        endpoint: SocketAddr,
        #[arg(long)]
        payload_hex: String,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum StrategyArg {
    Random,
    BreadthFirst,
    DepthFirst,
    Targeted,
}

impl From<StrategyArg> for FuzzingStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Random => FuzzingStrategy::Random,
            StrategyArg::BreadthFirst => FuzzingStrategy::BreadthFirst,
            StrategyArg::DepthFirst => FuzzingStrategy::DepthFirst,
            StrategyArg::Targeted => FuzzingStrategy::Targeted,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let engine = Engine::new(config)?;

    match cli.command {
        Command::Run {
            plugin,
            endpoint,
            strategy,
            target_state,
        } => {
            let session_id = engine
                .create_session(&plugin, endpoint, strategy.into(), target_state)
                .await?;
            tracing::info!(session_id = %session_id, "session created");
            engine.start_session(&session_id).await?;
            tokio::signal::ctrl_c().await?;
            engine.stop_session(&session_id).await?;
            let findings = engine.list_findings(&session_id).await?;
            println!("{} findings recorded", findings.len());
        }
        Command::OneShot {
            plugin,
            endpoint,
            payload_hex,
        } => {
            let payload = hex::decode(payload_hex.trim())?;
            let response = engine.execute_one_off(&plugin, endpoint, payload).await?;
            println!("{}", hex::encode(response));
        }
    }
    Ok(())
}
