use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tradebridge_brokers_common::BackoffPolicy;

/// Upper bound for every `*_ms` timeout setting (one day).
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Errors raised while loading or validating the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),
    #[error("Refusing to bind non-loopback address {0} without allow_remote")]
    RemoteNotAllowed(IpAddr),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Top-level configuration, usually read from `bridge.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub retry: RetryConfig,
    pub brokers: BrokersConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on. Loopback unless `allow_remote` is set.
    pub bind: String,
    pub port: u16,
    pub allow_remote: bool,
    pub max_connections: usize,
    /// Longest accepted unterminated line.
    pub max_line_bytes: usize,
    /// Time a new connection has to deliver its first complete message.
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Broker used when a message omits `broker`.
    pub default_broker: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5500,
            allow_remote: false,
            max_connections: 64,
            max_line_bytes: tradebridge_terminal::DEFAULT_MAX_LINE_BYTES,
            handshake_timeout_ms: 30_000,
            idle_timeout_ms: 120_000,
            shutdown_grace_ms: 10_000,
            default_broker: Some("EXNESS".to_string()),
        }
    }
}

impl ServerConfig {
    /// Resolve the listening address, enforcing the loopback-by-default rule.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.bind.clone()))?;
        if !ip.is_loopback() && !self.allow_remote {
            return Err(ConfigError::RemoteNotAllowed(ip));
        }
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Randomize each delay between `base_delay_ms` and its exponential value.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokersConfig {
    /// Broker credentials file (JSON or TOML).
    pub config_path: PathBuf,
    pub call_timeout_ms: u64,
    /// Default per-broker cap on concurrent outbound calls.
    pub max_concurrent_calls: usize,
}

impl Default for BrokersConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/brokers.json"),
            call_timeout_ms: 10_000,
            max_concurrent_calls: 4,
        }
    }
}

impl BrokersConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Directory for the daily audit files.
    pub dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("logs"),
        }
    }
}

impl BridgeConfig {
    /// Load from a TOML file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BridgeConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be > 0".into()));
        }
        if self.server.max_line_bytes == 0 {
            return Err(ConfigError::Invalid("server.max_line_bytes must be > 0".into()));
        }
        if self.brokers.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid("brokers.call_timeout_ms must be > 0".into()));
        }
        let timeouts = [
            ("server.handshake_timeout_ms", self.server.handshake_timeout_ms),
            ("server.idle_timeout_ms", self.server.idle_timeout_ms),
            ("server.shutdown_grace_ms", self.server.shutdown_grace_ms),
            ("brokers.call_timeout_ms", self.brokers.call_timeout_ms),
            ("retry.max_delay_ms", self.retry.max_delay_ms),
        ];
        for (key, value) in timeouts {
            if value > MAX_TIMEOUT_MS {
                return Err(ConfigError::Invalid(format!(
                    "{} must be at most {}",
                    key, MAX_TIMEOUT_MS
                )));
            }
        }
        Ok(())
    }
}
