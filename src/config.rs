//! Node configuration using Figment
//!
//! A node is configured from:
//! 1. a TOML file (`config/node.toml` by default)
//! 2. environment variables prefixed with `PQN_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use pqn_stack::config::NodeConfig;
//!
//! let config = NodeConfig::load()?;
//! println!("Serving {} on port {}", config.node.name, config.node.port);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::device::registry::DeviceConfig;
use crate::device::BusyPolicy;
use crate::error::{PqnError, PqnResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Config file used when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "config/node.toml";

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// `[node]`: the local device server
    #[serde(default)]
    pub node: ServerSettings,
    /// `[logging]`
    #[serde(default)]
    pub logging: LoggingConfig,
    /// `[client]`: calls to other servers
    #[serde(default)]
    pub client: ClientConfig,
    /// Server name to `host:port`
    #[serde(default)]
    pub directory: BTreeMap<String, String>,
    /// `[[devices]]` hosted by this node
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// The device server hosted by this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Name reported to clients
    #[serde(default = "default_name")]
    pub name: String,
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connections silent this long are closed
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Handling of calls to a busy device
    #[serde(default)]
    pub busy_policy: BusyPolicy,
}

impl ServerSettings {
    /// `host:port` to listen on
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
            idle_timeout: default_idle_timeout(),
            busy_policy: BusyPolicy::default(),
        }
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

/// Outgoing calls to other servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-call deadline
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Bound on opening a connection
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "pqn-node".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

impl NodeConfig {
    /// Load from `config/node.toml` and the environment.
    ///
    /// Example: `PQN_NODE__PORT=6000` overrides `[node] port`.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path. A missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(NodeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PQN_").split("__"))
            .extract()
    }

    /// [`load_from`](Self::load_from) followed by [`validate`](Self::validate).
    pub fn load_validated<P: AsRef<Path>>(path: P) -> PqnResult<Self> {
        let config = Self::load_from(path)?;
        config.validate().map_err(PqnError::Configuration)?;
        Ok(config)
    }

    /// Check values serde cannot: log settings, names and driver settings
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        if self.node.name.trim().is_empty() {
            return Err("Node name cannot be empty".to_string());
        }

        if self.client.timeout.is_zero() {
            return Err("Client timeout must be positive".to_string());
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err("Device name cannot be empty".to_string());
            }
            if device.name.contains(':') {
                return Err(format!("Device name '{}' must not contain ':'", device.name));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(format!("Duplicate device name: {}", device.name));
            }
            device
                .driver
                .validate()
                .map_err(|e| format!("Device '{}': {}", device.name, e))?;
        }

        Ok(())
    }

    /// Enabled device entries, in file order.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled)
    }
}
