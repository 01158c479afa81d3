#![forbid(unsafe_code)]
//! ForkLedger network node

use clap::Parser;
use forkledger::config::load_config;
use forkledger::node::Node;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the node configuration file
    #[arg(long, default_value = "forkledger.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        "Starting ForkLedger node {} on port {}",
        config.node.name,
        config.node.listen_port
    );

    let node = Node::init(config)?;
    node.start().await?;
    Ok(())
}
