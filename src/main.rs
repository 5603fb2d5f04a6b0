use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cinder_chain::config::NodeConfig;
use cinder_chain::crypto::{generate_keypair, save_keypair};
use cinder_chain::errors::ChainError;
use cinder_chain::node::Node;

#[derive(Parser)]
#[command(author, version, about = "Full node for the cinder proof-of-work chain")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
    /// Generate a new Ed25519 keypair for the miner wallet
    Keygen {
        #[arg(short, long, default_value = "keys/miner.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Start { config } => start_node(config).await,
        Commands::GenerateConfig { path } => generate_config(path),
        Commands::Keygen { path } => keygen(path),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "node terminated with error");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn start_node(config_path: PathBuf) -> Result<(), ChainError> {
    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        let config = NodeConfig::default();
        config.save(&config_path)?;
        config
    };

    let node = Node::new(config)?;
    let node_task = tokio::spawn(node.start());

    tokio::select! {
        joined = node_task => match joined {
            Ok(result) => result,
            Err(err) => Err(ChainError::Fatal(format!("node task aborted: {err}"))),
        },
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}

fn generate_config(path: PathBuf) -> Result<(), ChainError> {
    let config = NodeConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf) -> Result<(), ChainError> {
    let keypair = generate_keypair();
    save_keypair(&path, &keypair)?;
    info!(?path, "generated miner keypair");
    Ok(())
}
