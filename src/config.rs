//! Configuration for the drishti-vrd daemon
//!
//! Loads configuration from a TOML file: the listening address, the virtual
//! device table the server advertises, and (optionally) the simulated driver
//! settings used for hardware-free operation.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Virtual input devices advertised to clients, in declaration order.
    /// Global tracker/button/valuator/feature index spaces are the
    /// concatenation of the per-device counts.
    pub devices: Vec<DeviceConfig>,
    /// When present, the simulated tracking driver is attached.
    #[serde(default)]
    pub simulation: Option<SimulationConfig>,
}

/// Network configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// TCP bind address for the device server
    ///
    /// Examples:
    /// - `0.0.0.0:8555` - Bind to all interfaces on port 8555
    /// - `127.0.0.1:8555` - Localhost only
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One virtual input device
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Device name shown in the descriptor list
    pub name: String,
    /// Number of 6-DOF trackers on this device
    #[serde(default = "default_trackers")]
    pub trackers: u16,
    /// Number of buttons
    #[serde(default)]
    pub buttons: u16,
    /// Number of analog valuators
    #[serde(default)]
    pub valuators: u16,
    /// Whether the device's first tracker carries a display configuration
    #[serde(default)]
    pub hmd: bool,
    /// Number of remote power-off features
    #[serde(default)]
    pub power_features: u16,
    /// Number of haptic actuators
    #[serde(default)]
    pub haptic_features: u16,
}

fn default_trackers() -> u16 {
    1
}

/// Simulated driver configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Tracker update rate in Hz
    #[serde(default = "default_update_rate")]
    pub update_rate_hz: f32,
    /// Seed for the motion jitter (0 = random each run)
    #[serde(default)]
    pub random_seed: u64,
    /// Radius of the simulated tracker orbit in meters
    #[serde(default = "default_orbit_radius")]
    pub orbit_radius: f32,
}

fn default_update_rate() -> f32 {
    60.0
}

fn default_orbit_radius() -> f32 {
    1.2
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            update_rate_hz: default_update_rate(),
            random_seed: 0,
            orbit_radius: default_orbit_radius(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Default configuration: a simulated three-device rig (headset plus two
    /// controllers). Suitable for development; deployments should use a
    /// proper TOML configuration file.
    pub fn simulator_defaults() -> Self {
        Self {
            network: NetworkConfig {
                bind_address: "0.0.0.0:8555".to_string(),
            },
            logging: LoggingConfig::default(),
            devices: vec![
                DeviceConfig {
                    name: "Head".to_string(),
                    trackers: 1,
                    buttons: 0,
                    valuators: 0,
                    hmd: true,
                    power_features: 1,
                    haptic_features: 0,
                },
                DeviceConfig {
                    name: "Controller Left".to_string(),
                    trackers: 1,
                    buttons: 6,
                    valuators: 3,
                    hmd: false,
                    power_features: 1,
                    haptic_features: 1,
                },
                DeviceConfig {
                    name: "Controller Right".to_string(),
                    trackers: 1,
                    buttons: 6,
                    valuators: 3,
                    hmd: false,
                    power_features: 1,
                    haptic_features: 1,
                },
            ],
            simulation: Some(SimulationConfig::default()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::simulator_defaults()
    }
}
