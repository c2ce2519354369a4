//! Configuration management.
//!
//! weft configuration comes from:
//! - Environment variables (WEFT_*)
//! - Config file (~/.config/weft/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Engine scheduling configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Capability backend endpoints
    #[serde(default)]
    pub backends: BackendsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Engine scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on concurrently executing node attempts across all runs
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Event sink buffer capacity before events are dropped
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_workers() -> usize {
    16
}

fn default_event_buffer() -> usize {
    1024
}

/// Capability backend endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Model serving endpoint
    #[serde(default = "default_model_endpoint")]
    pub model_endpoint: String,

    /// Tool/MCP execution service endpoint
    #[serde(default = "default_tool_endpoint")]
    pub tool_endpoint: String,

    /// RPA driver endpoint
    #[serde(default = "default_rpa_endpoint")]
    pub rpa_endpoint: String,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            model_endpoint: default_model_endpoint(),
            tool_endpoint: default_tool_endpoint(),
            rpa_endpoint: default_rpa_endpoint(),
        }
    }
}

fn default_model_endpoint() -> String {
    std::env::var("WEFT_MODEL_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:3000/api/chat".to_string())
}

fn default_tool_endpoint() -> String {
    std::env::var("WEFT_TOOL_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:3100/api/tools/execute".to_string())
}

fn default_rpa_endpoint() -> String {
    std::env::var("WEFT_RPA_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:3200/api/rpa/execute".to_string())
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("weft"))
            .unwrap_or_else(|| PathBuf::from(".weft"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("weft"))
            .unwrap_or_else(|| PathBuf::from(".weft"))
    }

    /// Resolved database path (configured path or the default location).
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("weft.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("WEFT_SERVER_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Ok(host) = std::env::var("WEFT_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(path) = std::env::var("WEFT_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(workers) = std::env::var("WEFT_WORKERS") {
            if let Ok(parsed) = workers.parse::<usize>() {
                self.engine.workers = parsed.max(1);
            }
        }
        if let Ok(endpoint) = std::env::var("WEFT_MODEL_ENDPOINT") {
            self.backends.model_endpoint = endpoint;
        }
        if let Ok(endpoint) = std::env::var("WEFT_TOOL_ENDPOINT") {
            self.backends.tool_endpoint = endpoint;
        }
        if let Ok(endpoint) = std::env::var("WEFT_RPA_ENDPOINT") {
            self.backends.rpa_endpoint = endpoint;
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server = server;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(backends) = partial.backends {
            self.backends = backends;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    engine: Option<EngineConfig>,
    backends: Option<BackendsConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert!(config.engine.workers >= 1);
        assert!(config.engine.event_buffer >= 1);
    }

    #[test]
    fn partial_toml_overrides_only_named_sections() {
        let mut config = Config::default();
        let partial: PartialConfig = toml::from_str(
            r#"
[engine]
workers = 4
"#,
        )
        .unwrap();
        config.apply_partial(partial);
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.server.port, 8080);
    }
}
