use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};
use tradebridge_core::{BridgeError, BrokerConfig, Secret};

/// Broker name → validated entry. Swapped as a whole on reload.
pub type BrokerMap = HashMap<String, Arc<BrokerConfig>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read broker config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse broker config: {0}")]
    Parse(String),
    #[error("Broker {broker}: missing required field `{field}`")]
    MissingField { broker: String, field: &'static str },
    #[error("Broker {broker}: `{field}` still holds a placeholder value")]
    Placeholder { broker: String, field: &'static str },
    #[error("Broker {broker}: invalid api_url ({reason})")]
    InvalidUrl { broker: String, reason: String },
    #[error("No broker config source to reload from")]
    NoSource,
}

/// Why a broker name could not be routed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("Broker {0} not configured")]
    NotFound(String),
    #[error("Broker {0} is disabled")]
    Disabled(String),
}

impl From<LookupError> for BridgeError {
    fn from(err: LookupError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from a file extension. Anything but `.toml` is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

/// One entry of the broker file, before validation.
#[derive(Debug, Deserialize)]
struct BrokerEntry {
    account_id: Option<String>,
    api_key: Option<Secret>,
    api_secret: Option<Secret>,
    api_url: Option<String>,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    demo: bool,
    max_concurrent_calls: Option<usize>,
    timeout_secs: Option<u64>,
}

fn is_placeholder(value: &str) -> bool {
    value.trim().to_ascii_uppercase().starts_with("YOUR_")
}

fn required_text(
    broker: &str,
    field: &'static str,
    value: Option<String>,
) -> Result<String, RegistryError> {
    let value = value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RegistryError::MissingField {
            broker: broker.to_string(),
            field,
        })?;
    if is_placeholder(&value) {
        return Err(RegistryError::Placeholder {
            broker: broker.to_string(),
            field,
        });
    }
    Ok(value.trim().to_string())
}

fn required_secret(
    broker: &str,
    field: &'static str,
    value: Option<Secret>,
) -> Result<Secret, RegistryError> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RegistryError::MissingField {
            broker: broker.to_string(),
            field,
        })?;
    if is_placeholder(value.expose()) {
        return Err(RegistryError::Placeholder {
            broker: broker.to_string(),
            field,
        });
    }
    Ok(value)
}

impl BrokerEntry {
    fn into_config(self, name: &str) -> Result<BrokerConfig, RegistryError> {
        if !self.enabled {
            // Disabled entries are kept so lookups can say "disabled" rather
            // than "not configured"; their fields are never used.
            return Ok(BrokerConfig {
                name: name.to_string(),
                account_id: self.account_id.unwrap_or_default(),
                api_key: self.api_key.unwrap_or_else(|| Secret::new("")),
                api_secret: self.api_secret.unwrap_or_else(|| Secret::new("")),
                api_url: self.api_url.unwrap_or_default(),
                enabled: false,
                demo: self.demo,
                max_concurrent_calls: self.max_concurrent_calls,
                timeout: self.timeout_secs.map(Duration::from_secs),
            });
        }

        let account_id = required_text(name, "account_id", self.account_id)?;
        let api_key = required_secret(name, "api_key", self.api_key)?;
        let api_secret = required_secret(name, "api_secret", self.api_secret)?;
        let api_url = required_text(name, "api_url", self.api_url)?;

        let parsed = url::Url::parse(&api_url).map_err(|e| RegistryError::InvalidUrl {
            broker: name.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RegistryError::InvalidUrl {
                broker: name.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        if parsed.scheme() == "http" && !self.demo {
            warn!(broker = %name, "Broker endpoint is not using HTTPS");
        }

        Ok(BrokerConfig {
            name: name.to_string(),
            account_id,
            api_key,
            api_secret,
            api_url: api_url.trim_end_matches('/').to_string(),
            enabled: true,
            demo: self.demo,
            max_concurrent_calls: self.max_concurrent_calls.filter(|n| *n > 0),
            timeout: self.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
        })
    }
}

/// Parse and validate a broker config document.
///
/// Parse errors only carry a position, never the offending text, since that
/// text may be a credential.
pub fn parse_brokers(text: &str, format: ConfigFormat) -> Result<BrokerMap, RegistryError> {
    let entries: HashMap<String, BrokerEntry> = match format {
        ConfigFormat::Json => serde_json::from_str(text).map_err(|e| {
            RegistryError::Parse(format!(
                "{:?} error at line {}, column {}",
                e.classify(),
                e.line(),
                e.column()
            ))
        })?,
        ConfigFormat::Toml => toml::from_str(text).map_err(|e| {
            RegistryError::Parse(match e.span() {
                Some(span) => format!("invalid TOML at bytes {}..{}", span.start, span.end),
                None => "invalid TOML".to_string(),
            })
        })?,
    };

    let mut brokers = BrokerMap::with_capacity(entries.len());
    for (name, entry) in entries {
        let name = name.trim().to_string();
        let config = entry.into_config(&name)?;
        if config.enabled {
            info!(broker = %name, demo = config.demo, "Loaded broker");
        } else {
            info!(broker = %name, "Broker is disabled");
        }
        brokers.insert(name, Arc::new(config));
    }
    Ok(brokers)
}

/// Read and validate a broker config file.
pub fn load_broker_file(path: &Path) -> Result<BrokerMap, RegistryError> {
    let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_brokers(&text, ConfigFormat::from_path(path))
}

/// Read-mostly broker registry.
///
/// Lookups clone an `Arc` under a short read lock; reloads build the new map
/// off-lock and swap it in, so readers never see a partial update.
pub struct BrokerRegistry {
    brokers: RwLock<Arc<BrokerMap>>,
    source: Option<PathBuf>,
}

impl BrokerRegistry {
    pub fn new(brokers: BrokerMap) -> Self {
        Self {
            brokers: RwLock::new(Arc::new(brokers)),
            source: None,
        }
    }

    /// Load from a file and remember it for later reloads.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let brokers = load_broker_file(&path)?;
        Ok(Self {
            brokers: RwLock::new(Arc::new(brokers)),
            source: Some(path),
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Current config set. Cheap; holds no lock after return.
    pub fn snapshot(&self) -> Arc<BrokerMap> {
        match self.brokers.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Resolve a broker that may be used for routing.
    pub fn lookup(&self, name: &str) -> Result<Arc<BrokerConfig>, LookupError> {
        let snapshot = self.snapshot();
        match snapshot.get(name) {
            None => Err(LookupError::NotFound(name.to_string())),
            Some(config) if !config.enabled => Err(LookupError::Disabled(name.to_string())),
            Some(config) => Ok(Arc::clone(config)),
        }
    }

    /// Atomically replace the whole config set.
    pub fn replace(&self, brokers: BrokerMap) {
        let next = Arc::new(brokers);
        match self.brokers.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Re-read the source file. On failure the previous set stays active.
    pub fn reload(&self) -> Result<usize, RegistryError> {
        let path = self.source.as_deref().ok_or(RegistryError::NoSource)?;
        let brokers = load_broker_file(path)?;
        let enabled = brokers.values().filter(|b| b.enabled).count();
        self.replace(brokers);
        info!(path = %path.display(), enabled, "Broker configuration reloaded");
        Ok(enabled)
    }

    /// Sorted names of all configured brokers, enabled or not.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn enabled_count(&self) -> usize {
        self.snapshot().values().filter(|b| b.enabled).count()
    }

    /// Every non-empty secret currently loaded, for log redaction.
    pub fn secrets(&self) -> Vec<String> {
        self.snapshot()
            .values()
            .flat_map(|b| b.secrets().map(str::to_string))
            .filter(|s| !s.trim().is_empty())
            .collect()
    }
}
