//! Configuration module
//!
//! Handles loading and saving Harmony configuration, and the environment
//! variables clients use to find their server.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::binding::PullMode;
use crate::network::DEFAULT_MAX_FRAME_SIZE;
use crate::protocol::DEFAULT_PORT;
use crate::session::{strategy_by_name, SearchStrategy};

/// Environment variable naming the server host
pub const HOST_ENV: &str = "HARMONY_S_HOST";

/// Environment variable naming the server port
pub const PORT_ENV: &str = "HARMONY_S_PORT";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("Environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Unknown search strategy: {0}")]
    UnknownStrategy(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this host
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Read timeout in ms, 0 to wait forever
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Largest accepted frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    30_000
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Size of the client id pool
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,
    /// Search strategy name
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_max_clients() -> u32 {
    1024
}

fn default_strategy() -> String {
    "hold".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            strategy: default_strategy(),
        }
    }
}

impl ServerConfig {
    /// Instantiate the configured search strategy
    pub fn strategy(&self) -> ConfigResult<Box<dyn SearchStrategy>> {
        strategy_by_name(&self.strategy)
            .ok_or_else(|| ConfigError::UnknownStrategy(self.strategy.clone()))
    }
}

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host, used when neither the command line nor the environment names one
    pub host: Option<String>,
    /// How server values reach the live variables
    #[serde(default)]
    pub mode: PullMode,
    /// Application name sent at registration (default: host name)
    pub app_name: Option<String>,
}

/// Where a client should connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
}

/// Read the server location from `HARMONY_S_HOST` and `HARMONY_S_PORT`
pub fn server_from_env() -> ConfigResult<ServerTarget> {
    server_from_lookup(|name| std::env::var(name).ok())
}

/// Same as [`server_from_env`] with a custom variable source
pub fn server_from_lookup<F>(lookup: F) -> ConfigResult<ServerTarget>
where
    F: Fn(&str) -> Option<String>,
{
    let host = lookup(HOST_ENV)
        .filter(|h| !h.is_empty())
        .ok_or(ConfigError::MissingEnv(HOST_ENV))?;
    let raw_port = lookup(PORT_ENV).ok_or(ConfigError::MissingEnv(PORT_ENV))?;
    let port = raw_port.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: PORT_ENV,
        value: raw_port.clone(),
    })?;
    Ok(ServerTarget { host, port })
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("harmony/config.toml")),
            Some(PathBuf::from("./harmony.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Runtime network settings, with an optional port override
    pub fn net_config(&self, port: Option<u16>) -> crate::network::NetworkConfig {
        let mut net = crate::network::NetworkConfig::new(port.unwrap_or(self.network.port))
            .with_max_clients(self.server.max_clients);
        if let Some(bind) = &self.network.bind_address {
            net = net.with_bind_address(bind.clone());
        }
        net.connect_timeout_ms = self.network.connect_timeout_ms;
        net.read_timeout_ms = self.network.read_timeout_ms;
        net.max_frame_size = self.network.max_frame_size;
        net
    }

    /// Server a client should use
    ///
    /// Command-line values win, then the environment, then this file. An
    /// explicit host ignores the environment entirely.
    pub fn client_target<F>(
        &self,
        host: Option<String>,
        port: Option<u16>,
        lookup: F,
    ) -> ServerTarget
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = match host {
            Some(_) => None,
            None => match server_from_lookup(lookup) {
                Ok(target) => Some(target),
                Err(e) => {
                    tracing::debug!("{}; using configured server", e);
                    None
                }
            },
        };

        let port = port
            .or_else(|| env.as_ref().map(|t| t.port))
            .unwrap_or(self.network.port);
        let host = host
            .or_else(|| env.map(|t| t.host))
            .or_else(|| self.client.host.clone())
            .unwrap_or_else(|| "localhost".to_string());
        ServerTarget { host, port }
    }

    /// Application name a client registers under
    pub fn app_name(&self) -> String {
        self.client
            .app_name
            .clone()
            .unwrap_or_else(|| self.general.name.clone())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "tuning-node".to_string(),
            verbose: false,
        },
        client: ClientConfig {
            host: Some("localhost".to_string()),
            mode: PullMode::Signal,
            app_name: Some("gemm".to_string()),
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
