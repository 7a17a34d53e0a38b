//! fpm-probe - PHP-FPM endpoint discovery
//!
//! Entry point for the fpm-probe binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fpm_probe::cli::{self, ConfigCommand};
use fpm_probe::Network;

/// fpm-probe - find a running PHP-FPM and describe it
#[derive(Parser)]
#[command(name = "fpm-probe")]
#[command(author = "VeloServe Team")]
#[command(version = fpm_probe::VERSION)]
#[command(about = "Detects a running PHP-FPM endpoint and the PHP runtime behind it", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the FPM endpoint (default)
    Detect,
    /// Report the PHP version and extensions behind FPM
    Php {
        /// Endpoint network (tcp or unix); must match the address, derived from it if omitted
        #[arg(long, requires = "address")]
        network: Option<Network>,
        /// Endpoint to use instead of detecting one
        #[arg(long)]
        address: Option<String>,
    },
    /// Dump the configuration of an FPM process
    Dump {
        /// PID of the FPM master process
        pid: u32,
    },
    /// List the addresses tried during detection
    Candidates,
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("fpm_probe={}", log_level).into()
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = || cli::load_settings(cli.config.as_deref());

    match cli.command {
        Some(Commands::Detect) | None => cli::handle_detect(settings()?, cli.json)?,
        Some(Commands::Php { network, address }) => {
            cli::handle_php(settings()?, network, address, cli.json)?
        }
        Some(Commands::Dump { pid }) => cli::handle_dump(settings()?, pid, cli.json)?,
        Some(Commands::Candidates) => cli::handle_candidates(&settings()?, cli.json)?,
        Some(Commands::Config { command }) => {
            cli::handle_config_command(cli.config.as_deref(), command)?
        }
    }

    Ok(())
}
