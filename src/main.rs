//! drishti-vrd - VR tracking-device daemon
//!
//! Serves tracker, battery, and HMD display state to VR applications over a
//! versioned TCP protocol. Everything runs on one dispatch thread; device
//! drivers publish from their own threads through the device manager.

use drishti_vrd::devices::{DeviceManager, SimulatedDriver};
use drishti_vrd::server::VrDeviceServer;
use drishti_vrd::{Config, Error, Result};
use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

/// Parse config path from command line arguments.
///
/// Supports:
/// - `drishti-vrd <path>` (positional)
/// - `drishti-vrd --config <path>` (flag-based)
/// - `drishti-vrd -c <path>` (short flag)
///
/// Defaults to `/etc/drishti-vrd.toml`; the second element says whether the
/// path was named explicitly.
fn parse_config_path() -> (String, bool) {
    let args: Vec<String> = env::args().collect();

    // Look for --config or -c flag
    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return (args[i + 1].clone(), true);
        }
    }

    // Fall back to first positional argument (if it doesn't start with -)
    if args.len() > 1 && !args[1].starts_with('-') {
        return (args[1].clone(), true);
    }

    // Default path
    ("/etc/drishti-vrd.toml".to_string(), false)
}

/// Load the configuration named on the command line. A missing file is only
/// an error when the path was given explicitly; otherwise the built-in
/// simulator devices are used.
fn load_config() -> Result<(Config, Option<String>)> {
    let (path, explicit) = parse_config_path();
    if explicit || Path::new(&path).exists() {
        let config = Config::from_file(&path)?;
        Ok((config, Some(path)))
    } else {
        Ok((Config::simulator_defaults(), None))
    }
}

fn main() {
    // The logger takes its default level from the config, so load it first.
    // Failures here go to stderr directly.
    let (config, config_path) = match load_config() {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("drishti-vrd: {err}");
            process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.logging.level),
    )
    .init();

    log::info!("drishti-vrd v{} starting...", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => log::info!("Using config: {}", path),
        None => log::info!("No config file found, using built-in simulator devices"),
    }

    if let Err(err) = run(&config) {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn run(config: &Config) -> Result<()> {
    let manager = Arc::new(DeviceManager::from_config(config)?);
    if let Some(simulation) = &config.simulation {
        manager.set_driver(Box::new(SimulatedDriver::new(
            simulation.clone(),
            manager.update_sink(),
        )));
    }

    let mut server = VrDeviceServer::bind(&config.network.bind_address, manager)?;

    // Set up shutdown signal handler
    let handle = server.handle();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        if handle.stop().is_err() {
            log::warn!("Dispatcher already shut down");
        }
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!("drishti-vrd running. Press Ctrl-C to stop.");
    server.run()?;

    log::info!("drishti-vrd stopped");
    Ok(())
}
