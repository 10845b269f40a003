//! Resource discovery engine - main entry point

use clap::{Parser, Subcommand};
use resource_discovery::config::DiscoveryConfig;
use resource_discovery::observability::{init_default_logging, metrics};
use resource_discovery::DiscoveryRuntime;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["discovery.toml", "config/discovery.toml"];

/// Edge device discovery and lifecycle orchestration
#[derive(Parser)]
#[command(name = "resource-discovery")]
#[command(about = "Onboards edge devices over a message broker and tracks their health")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DISCOVERY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the discovery engine until SIGINT or SIGTERM
    Run,
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!(
        "Starting resource discovery v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_engine(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DiscoveryConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DiscoveryConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DiscoveryConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    let config = DiscoveryConfig::default();
    config.validate()?;
    Ok(config)
}

async fn run_engine(config: DiscoveryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let runtime = DiscoveryRuntime::from_config(config)?;
    runtime.start();

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    runtime.shutdown().await;
    let snapshot = metrics().snapshot();
    info!(
        messages_received = snapshot.messages_received,
        messages_published = snapshot.messages_published,
        devices_discovered = snapshot.devices_discovered,
        "Final counters"
    );
    Ok(())
}

fn handle_config_command(
    config: DiscoveryConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
