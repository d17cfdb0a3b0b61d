//! Runtime configuration.
//!
//! Handles parsing and management of ionet.toml configuration files. Every
//! knob has a production default; embedding applications typically construct
//! [`Config`] in code and only ship a toml file when operators need to tune
//! timeouts.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default cap on a decoded WebSocket message: 8 MiB.
pub const DEFAULT_MAX_PACKET: usize = 8 * 1024 * 1024;

/// Idle timeout once a peer is trusted (handshake completed): 5 minutes.
pub const TRUST_TIMEOUT_MS: u64 = 300_000;

/// Idle timeout for unauthenticated peers: 5 seconds.
pub const UNTRUST_TIMEOUT_MS: u64 = 5_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching ionet.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum decoded WebSocket message size in bytes.
    pub max_packet: usize,

    /// Idle timeout (ms) applied once the security/WebSocket handshake
    /// completes.
    pub trust_timeout_ms: u64,

    /// Idle timeout (ms) applied to peers that have not completed a
    /// handshake.
    pub untrust_timeout_ms: u64,

    /// RPC settings.
    pub rpc: RpcConfig,
}

/// RPC invocation timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Default invocation timeout (ms) when the caller does not supply one.
    pub default_timeout_ms: u64,

    /// Floor applied to caller-supplied timeouts (ms).
    pub min_timeout_ms: u64,

    /// Interval (ms) of the pending-invocation timeout sweep.
    pub sweep_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet: DEFAULT_MAX_PACKET,
            trust_timeout_ms: TRUST_TIMEOUT_MS,
            untrust_timeout_ms: UNTRUST_TIMEOUT_MS,
            rpc: RpcConfig::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            min_timeout_ms: 1_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join("ionet.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Err(ConfigError::NotFound("ionet.toml".to_string()));
            }
        }
    }

    pub fn trust_timeout(&self) -> Duration {
        Duration::from_millis(self.trust_timeout_ms)
    }

    pub fn untrust_timeout(&self) -> Duration {
        Duration::from_millis(self.untrust_timeout_ms)
    }
}

impl RpcConfig {
    /// Clamp a caller-supplied timeout to the configured floor; `None` uses
    /// the default.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let floor = Duration::from_millis(self.min_timeout_ms);
        match requested {
            Some(t) if t < floor => floor,
            Some(t) => t,
            None => Duration::from_millis(self.default_timeout_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.max_packet, 8 * 1024 * 1024);
        assert_eq!(config.trust_timeout_ms, 300_000);
        assert_eq!(config.untrust_timeout_ms, 5_000);
        assert_eq!(config.rpc.default_timeout_ms, 10_000);
    }

    #[test]
    fn timeout_floor() {
        let rpc = RpcConfig::default();
        assert_eq!(
            rpc.effective_timeout(Some(Duration::from_millis(10))),
            Duration::from_millis(1_000)
        );
        assert_eq!(
            rpc.effective_timeout(Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(rpc.effective_timeout(None), Duration::from_secs(10));
    }

    #[test]
    fn parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            max_packet = 1024

            [rpc]
            default_timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.max_packet, 1024);
        assert_eq!(config.rpc.default_timeout_ms, 5_000);
        // untouched fields keep their defaults
        assert_eq!(config.untrust_timeout_ms, 5_000);
        assert_eq!(config.rpc.sweep_interval_ms, 1_000);
    }
}
