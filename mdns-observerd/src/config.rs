use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use mdns_observer::{ObserverConfig, TransportConfig};
use shared::protocol::ALL;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    /// Listener names: hostnames, instances, service types or wildcards
    #[serde(default = "default_watch")]
    pub watch: Vec<String>,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Re-send PTR questions this often; 0 asks once at startup
    #[serde(default)]
    pub interval_secs: u64,
    /// Service types to ask for besides those named in `watch`
    #[serde(default)]
    pub service_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_watch() -> Vec<String> {
    vec![ALL.to_string()]
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            service_types: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}
