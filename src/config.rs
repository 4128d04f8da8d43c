use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the tunnel server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address for the public listener and tunnel listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub host: String,

    /// Port for the admin/metrics API (default: 0 = disabled)
    #[serde(default)]
    pub admin_port: u16,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Maximum client connections registered per tunnel (default: 10)
    #[serde(default = "default_max_conn_count")]
    pub max_conn_count: usize,

    /// Time a new tunnel reservation waits for its first client connection
    /// before being reaped, in milliseconds (default: 5000)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl ServerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_port > 0
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            host: default_bind_address(),
            admin_port: 0,
            pid_file: None,
            max_conn_count: default_max_conn_count(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_max_conn_count() -> usize {
    10
}

fn default_grace_period_ms() -> u64 {
    5000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_conn_count == 0 {
            anyhow::bail!("'max_conn_count' must be greater than 0");
        }
        if self.server.grace_period_ms == 0 {
            anyhow::bail!("'grace_period_ms' must be greater than 0");
        }
        Ok(())
    }
}
