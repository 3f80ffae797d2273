use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tradebridge_brokers_common::{BrokerRegistry, ExecutionClient, RegistryError, SimulatedBroker};
use tradebridge_brokers_rest::{RestBroker, RestBrokerConfig};
use tradebridge_core::BrokerApi;

use crate::audit::AuditLogger;
use crate::config::BridgeConfig;

/// Shared state accessible by every session task.
pub struct BridgeState {
    pub config: BridgeConfig,
    pub client: ExecutionClient,
    pub audit: Arc<AuditLogger>,
}

impl BridgeState {
    pub fn new(
        config: BridgeConfig,
        registry: Arc<BrokerRegistry>,
        live: Arc<dyn BrokerApi>,
        demo: Arc<dyn BrokerApi>,
        audit: AuditLogger,
    ) -> Self {
        let client = ExecutionClient::new(
            registry,
            live,
            demo,
            config.retry.policy(),
            config.brokers.call_timeout(),
            config.brokers.max_concurrent_calls,
        );
        let audit = Arc::new(audit);
        audit.add_secrets(client.registry().secrets());
        Self {
            config,
            client,
            audit,
        }
    }

    /// Wire up the production adapters from configuration.
    pub fn from_config(config: BridgeConfig) -> anyhow::Result<Self> {
        let path = config.brokers.config_path.clone();
        let registry = BrokerRegistry::from_file(&path)
            .with_context(|| format!("loading broker config {}", path.display()))?;
        if registry.enabled_count() == 0 {
            warn!(path = %path.display(), "No enabled brokers configured");
        }

        let live = RestBroker::new(RestBrokerConfig::default())
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let audit = if config.audit.enabled {
            AuditLogger::daily(&config.audit.dir)?
        } else {
            AuditLogger::disabled()
        };

        info!(brokers = ?registry.names(), "Broker registry loaded");
        Ok(Self::new(
            config,
            Arc::new(registry),
            Arc::new(live),
            Arc::new(SimulatedBroker::demo()),
            audit,
        ))
    }

    pub fn registry(&self) -> &Arc<BrokerRegistry> {
        self.client.registry()
    }

    /// Re-read the broker file. On failure the current set stays live.
    pub fn reload_brokers(&self) -> Result<usize, RegistryError> {
        let count = self.registry().reload()?;
        self.audit.add_secrets(self.registry().secrets());
        Ok(count)
    }
}
