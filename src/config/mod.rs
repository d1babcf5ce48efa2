/// Configuration management for the Kairo engine
///
/// Handles server configuration, storage location, and runtime limits.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Execution limits applied to every run
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Storage for workflows, credentials and run history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `kairo.db` (default: "data")
    pub data_dir: String,
}

impl DatabaseConfig {
    /// SQLite connection URL inside the data directory
    pub fn sqlite_url(&self) -> String {
        format!("sqlite://{}/kairo.db?mode=rwc", self.data_dir)
    }
}

/// Engine-wide execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-invocation timeout when a node sets none
    pub node_timeout_ms: u64,
    /// Timeout for on-error webhook and dead-letter deliveries
    pub webhook_timeout_ms: u64,
    /// Upper bound for "unlimited" fan-out concurrency
    pub max_parallelism: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: env_or("KAIRO_NODE_TIMEOUT_MS", 30_000),
            webhook_timeout_ms: env_or("KAIRO_WEBHOOK_TIMEOUT_MS", 10_000),
            max_parallelism: env_or("KAIRO_MAX_PARALLELISM", 64usize).max(1),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("KAIRO_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("KAIRO_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("KAIRO_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig::default(),
        }
    }
}
