use std::path::PathBuf;

use arp::app::App;
use arp::config::StaticConfig;
use clap::{Parser, Subcommand};
use tracing::info;

/// ARP - Another Reverse Proxy
///
/// A dynamic reverse proxy with service discovery and plugin support for
/// advanced routing capabilities.
#[derive(Parser)]
#[command(name = "arp", version)]
struct Cli {
    /// Path to the bootstrap configuration file
    #[arg(
        short = 'c',
        long = "config",
        env = "ARP_CONFIG",
        default_value = "./static.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = cli.command {
        println!("arp {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Static config failures are fatal: exit code 1 before anything binds.
    let config = StaticConfig::load(&cli.config)?;
    init_logging(&config.log_level);
    info!(path = %cli.config.display(), "Configuration loaded");

    App::new(config).run().await
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("arp={level}"))),
        )
        .init();
}
