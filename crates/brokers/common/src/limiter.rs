use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tradebridge_core::{BrokerConfig, BrokerError};

/// Per-broker cap on concurrent outbound calls.
///
/// Each broker name gets its own semaphore so a slow broker only exhausts its
/// own slots.
pub struct BrokerLimiter {
    default_limit: usize,
    slots: Mutex<HashMap<String, (usize, Arc<Semaphore>)>>,
}

impl BrokerLimiter {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit: default_limit.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn limit_for(&self, config: &BrokerConfig) -> usize {
        config.max_concurrent_calls.unwrap_or(self.default_limit).max(1)
    }

    fn semaphore_for(&self, config: &BrokerConfig) -> Arc<Semaphore> {
        let limit = self.limit_for(config);
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = slots
            .entry(config.name.clone())
            .or_insert_with(|| (limit, Arc::new(Semaphore::new(limit))));
        // A reload changed the cap. Calls holding old permits drain naturally.
        if entry.0 != limit {
            *entry = (limit, Arc::new(Semaphore::new(limit)));
        }
        Arc::clone(&entry.1)
    }

    /// Wait for a slot on this broker.
    pub async fn acquire(&self, config: &BrokerConfig) -> Result<OwnedSemaphorePermit, BrokerError> {
        self.semaphore_for(config)
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::Internal(format!("limiter for {} closed", config.name)))
    }

    /// Free slots for a broker, if it has been used yet.
    pub fn available(&self, broker: &str) -> Option<usize> {
        let slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.get(broker).map(|(_, s)| s.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{parse_brokers, ConfigFormat};
    use std::time::Duration;

    fn brokers() -> crate::registry::BrokerMap {
        parse_brokers(
            r#"{
                "SLOW": {"account_id": "1", "api_key": "k", "api_secret": "s", "api_url": "https://slow.example", "enabled": true, "max_concurrent_calls": 1},
                "FAST": {"account_id": "2", "api_key": "k", "api_secret": "s", "api_url": "https://fast.example", "enabled": true}
            }"#,
            ConfigFormat::Json,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_slow_broker_does_not_starve_others() {
        let brokers = brokers();
        let limiter = BrokerLimiter::new(4);

        let _held = limiter.acquire(&brokers["SLOW"]).await.unwrap();
        assert_eq!(limiter.available("SLOW"), Some(0));

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire(&brokers["SLOW"])).await;
        assert!(blocked.is_err());

        let fast = limiter.acquire(&brokers["FAST"]).await;
        assert!(fast.is_ok());
        assert_eq!(limiter.available("FAST"), Some(3));
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let brokers = brokers();
        let limiter = BrokerLimiter::new(2);
        {
            let _permit = limiter.acquire(&brokers["SLOW"]).await.unwrap();
            assert_eq!(limiter.available("SLOW"), Some(0));
        }
        assert_eq!(limiter.available("SLOW"), Some(1));
    }
}
