//! CLI Module
//!
//! Command handlers behind the `fpm-probe` binary. Reports go to stdout,
//! logs to stderr.

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use std::path::Path;

use crate::config::ProbeConfig;
use crate::detect::{dump, process, Detector, FpmConfig, Network, SystemProcesses};
use crate::php::{self, StagedScripts};

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate configuration file
    Validate,
    /// Show default configuration
    ShowDefault,
}

/// Load settings, falling back to defaults when the file is absent
pub fn load_settings(path: Option<&Path>) -> Result<ProbeConfig> {
    match path {
        Some(path) if path.exists() => {
            tracing::debug!("Loading configuration from {:?}", path);
            ProbeConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        Some(path) => {
            tracing::debug!("{:?} not found, using default configuration", path);
            Ok(ProbeConfig::default())
        }
        None => Ok(ProbeConfig::default()),
    }
}

/// Detect the endpoint and print it
pub fn handle_detect(settings: ProbeConfig, json: bool) -> Result<()> {
    let config = Detector::new(settings).detect()?;
    print_config(&config, json)
}

/// Resolve an endpoint (or take the given one) and introspect PHP behind it
pub fn handle_php(
    settings: ProbeConfig,
    network: Option<Network>,
    address: Option<String>,
    json: bool,
) -> Result<()> {
    let mut config = match address {
        Some(address) => {
            let network = network.unwrap_or_else(|| Network::from_address(&address));
            let mut config = FpmConfig::with_endpoint(network, address)?;
            Detector::new(settings.clone()).prober().probe(&mut config)?;
            config
        }
        None => Detector::new(settings.clone()).detect()?,
    };

    let staged = match settings.scripts_dir {
        Some(ref dir) => StagedScripts::stage(dir),
        None => StagedScripts::temporary(),
    }
    .context("staging introspection scripts")?;

    php::detect_php_infos_with(&mut config, staged.dir(), &settings)?;
    print_config(&config, json)
}

/// Dump and print the configuration of a specific FPM process
pub fn handle_dump(settings: ProbeConfig, pid: u32, json: bool) -> Result<()> {
    let process = process::find(&SystemProcesses, pid)
        .map_err(|_| anyhow!("no process with pid {}", pid))?;

    let mut config = FpmConfig::default();
    let raw = dump::extract(
        &process,
        &mut config,
        &settings.dump_flag,
        settings.dump_timeout(),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&raw)?);
    } else {
        for (key, value) in &raw {
            println!("{} = {}", key, value);
        }
    }
    Ok(())
}

/// Print the effective candidate table
pub fn handle_candidates(settings: &ProbeConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&settings.candidates)?);
    } else {
        for candidate in &settings.candidates {
            println!("{:<5} {}", candidate.network, candidate.address);
        }
    }
    Ok(())
}

/// Handle configuration commands
pub fn handle_config_command(config_path: Option<&Path>, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Validate => {
            let Some(config_path) = config_path.filter(|p| p.exists()) else {
                println!("Configuration file not found, using defaults.");
                println!("Configuration is valid.");
                return Ok(());
            };

            println!("Validating configuration: {:?}", config_path);
            match ProbeConfig::load(config_path) {
                Ok(_) => println!("✓ Configuration is valid."),
                Err(e) => {
                    println!("✗ Configuration error: {}", e);
                    return Err(anyhow!("Invalid configuration"));
                }
            }
        }
        ConfigCommand::ShowDefault => {
            let defaults = toml::to_string_pretty(&ProbeConfig::default())?;
            println!("# fpm-probe configuration\n");
            println!("{}", defaults);
        }
    }
    Ok(())
}

fn print_config(config: &FpmConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    let ids = config.resolve_ids().unwrap_or_default();
    let network = config.listen_network.map(|n| n.as_str()).unwrap_or("-");

    println!("listen:         {} ({})", config.listen_address, network);
    println!("php user:       {}", account(&config.php_user, ids.php_uid));
    println!("php group:      {}", account(&config.php_group, ids.php_gid));
    println!("listen owner:   {}", account(&config.listen_owner, ids.listen_uid));
    println!("listen group:   {}", account(&config.listen_group, ids.listen_gid));
    if let Some(ref version) = config.php_version {
        println!("php version:    {}", version);
    }
    if let Some(ref extensions) = config.php_extensions {
        println!("extensions:     {}", extensions.join(", "));
    }
    Ok(())
}

fn account(name: &Option<String>, id: Option<u32>) -> String {
    match (name, id) {
        (Some(name), Some(id)) => format!("{} ({})", name, id),
        (Some(name), None) => name.clone(),
        (None, _) => "-".to_string(),
    }
}
