use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use tradebridge_core::*;
use uuid::Uuid;

use crate::limiter::BrokerLimiter;
use crate::registry::BrokerRegistry;
use crate::retry::BackoffPolicy;

/// Outcome of a possibly-retried broker call.
#[derive(Debug)]
pub struct CallReport<T> {
    pub result: Result<T, BridgeError>,
    /// Attempts actually sent to the broker.
    pub attempts: u32,
    /// Failures of earlier attempts that were retried.
    pub retried: Vec<BrokerError>,
}

impl<T> CallReport<T> {
    fn failed(err: BridgeError) -> Self {
        Self {
            result: Err(err),
            attempts: 0,
            retried: Vec::new(),
        }
    }
}

/// Routes calls to the right adapter and applies timeout, concurrency and
/// retry rules.
pub struct ExecutionClient {
    registry: Arc<BrokerRegistry>,
    live: Arc<dyn BrokerApi>,
    demo: Arc<dyn BrokerApi>,
    limiter: BrokerLimiter,
    policy: BackoffPolicy,
    call_timeout: Duration,
}

impl ExecutionClient {
    pub fn new(
        registry: Arc<BrokerRegistry>,
        live: Arc<dyn BrokerApi>,
        demo: Arc<dyn BrokerApi>,
        policy: BackoffPolicy,
        call_timeout: Duration,
        max_concurrent_calls: usize,
    ) -> Self {
        Self {
            registry,
            live,
            demo,
            limiter: BrokerLimiter::new(max_concurrent_calls),
            policy,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<BrokerRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &BrokerLimiter {
        &self.limiter
    }

    /// Resolve a routable broker or fail with a config error.
    pub fn resolve(&self, broker: &str) -> Result<Arc<BrokerConfig>, BridgeError> {
        Ok(self.registry.lookup(broker)?)
    }

    fn adapter_for(&self, config: &BrokerConfig) -> &Arc<dyn BrokerApi> {
        if config.demo {
            &self.demo
        } else {
            &self.live
        }
    }

    /// Execute a trade. The idempotency key is fixed here, once, and reused
    /// by every retry.
    pub async fn execute_trade(&self, broker: &str, request: &TradeRequest) -> CallReport<TradeReceipt> {
        let config = match self.resolve(broker) {
            Ok(config) => config,
            Err(e) => return CallReport::failed(e),
        };
        let key = request
            .client_ref
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let api: &dyn BrokerApi = self.adapter_for(&config).as_ref();

        let config_ref: &BrokerConfig = &config;
        let key_ref: &str = &key;
        self.call_with_retry(config_ref, "execute_trade", move || {
            api.execute_trade(config_ref, request, key_ref)
        })
        .await
    }

    pub async fn account_info(&self, broker: &str) -> CallReport<AccountInfo> {
        let config = match self.resolve(broker) {
            Ok(config) => config,
            Err(e) => return CallReport::failed(e),
        };
        let api: &dyn BrokerApi = self.adapter_for(&config).as_ref();

        let config_ref: &BrokerConfig = &config;
        self.call_with_retry(config_ref, "account_info", move || api.account_info(config_ref))
            .await
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        config: &BrokerConfig,
        operation: &'static str,
        call: F,
    ) -> CallReport<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let timeout = config.timeout.unwrap_or(self.call_timeout);

        // Waiting for a slot counts against the same budget as one attempt.
        let _permit = match tokio::time::timeout(timeout, self.limiter.acquire(config)).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(e)) => return CallReport::failed(e.into()),
            Err(_) => {
                warn!(broker = %config.name, operation, "No free call slot before timeout");
                return CallReport::failed(BridgeError::Network(format!(
                    "broker {} is at its concurrency limit",
                    config.name
                )));
            }
        };

        let mut retried = Vec::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(broker = %config.name, operation, attempt, "Calling broker");

            let outcome = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout(timeout)),
            };

            let e = match outcome {
                Ok(value) => {
                    return CallReport {
                        result: Ok(value),
                        attempts: attempt,
                        retried,
                    }
                }
                // Broker text can echo request headers back at us.
                Err(e) => e.redacted(&config.secrets()),
            };

            let delay = if e.is_retryable() {
                self.policy.delay_for(attempt)
            } else {
                None
            };
            match delay {
                Some(delay) => {
                    warn!(
                        broker = %config.name,
                        operation,
                        attempt,
                        error = %e,
                        "Broker call failed, retrying in {:?}",
                        delay
                    );
                    retried.push(e);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    if e.is_retryable() {
                        warn!(broker = %config.name, operation, attempt, error = %e, "Retries exhausted");
                    }
                    return CallReport {
                        result: Err(e.into()),
                        attempts: attempt,
                        retried,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{parse_brokers, ConfigFormat};
    use crate::simulated::{SimulatedBroker, SimulatedStep};
    use rust_decimal_macros::dec;

    const BROKERS: &str = r#"{
        "EXNESS": {"account_id": "1", "api_key": "k", "api_secret": "s", "api_url": "https://api.exness.example", "enabled": true},
        "PAPER": {"account_id": "2", "api_key": "k", "api_secret": "s", "api_url": "https://paper.example", "enabled": true, "demo": true},
        "OFF": {"enabled": false}
    }"#;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: true,
        }
    }

    fn client(live: Arc<SimulatedBroker>, demo: Arc<SimulatedBroker>) -> ExecutionClient {
        let registry = Arc::new(BrokerRegistry::new(
            parse_brokers(BROKERS, ConfigFormat::Json).unwrap(),
        ));
        ExecutionClient::new(registry, live, demo, policy(), Duration::from_millis(100), 4)
    }

    fn gold(client_ref: Option<&str>) -> TradeRequest {
        TradeRequest {
            symbol: "XAUUSD".into(),
            side: Side::Sell,
            lots: dec!(0.10),
            price: None,
            client_ref: client_ref.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_timeouts_then_success_executes_once() {
        let live = Arc::new(SimulatedBroker::scripted([
            SimulatedStep::ExecuteThenStall(Duration::from_secs(5)),
            SimulatedStep::Stall(Duration::from_secs(5)),
        ]));
        let client = client(Arc::clone(&live), Arc::new(SimulatedBroker::demo()));

        let report = client.execute_trade("EXNESS", &gold(None)).await;
        let receipt = report.result.unwrap();
        assert!(!receipt.order_id.is_empty());
        assert_eq!(report.attempts, 3);
        assert!(report.attempts <= client.policy().max_attempts);
        assert_eq!(report.retried.len(), 2);
        assert!(report
            .retried
            .iter()
            .all(|e| matches!(e, BrokerError::Timeout(_))));

        let executed = live.executed_orders();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].order_id, receipt.order_id);
    }

    #[tokio::test]
    async fn test_client_ref_is_the_idempotency_key() {
        let live = Arc::new(SimulatedBroker::demo());
        let client = client(Arc::clone(&live), Arc::new(SimulatedBroker::demo()));

        client.execute_trade("EXNESS", &gold(Some("ea-123"))).await.result.unwrap();
        assert_eq!(live.executed_orders()[0].idempotency_key, "ea-123");
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let live = Arc::new(SimulatedBroker::scripted([SimulatedStep::Reject {
            code: "INSUFFICIENT_FUNDS".into(),
            message: "insufficient funds".into(),
        }]));
        let client = client(Arc::clone(&live), Arc::new(SimulatedBroker::demo()));

        let report = client.execute_trade("EXNESS", &gold(None)).await;
        assert_eq!(report.attempts, 1);
        assert_eq!(live.calls(), 1);
        match report.result {
            Err(BridgeError::BrokerRejected { code, .. }) => assert_eq!(code, "INSUFFICIENT_FUNDS"),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_network_failures_exhaust_budget() {
        let live = Arc::new(SimulatedBroker::scripted(
            std::iter::repeat(SimulatedStep::Fail("503 Service Unavailable".into())).take(5),
        ));
        let client = client(Arc::clone(&live), Arc::new(SimulatedBroker::demo()));

        let report = client.execute_trade("EXNESS", &gold(None)).await;
        assert!(matches!(report.result, Err(BridgeError::Network(_))));
        assert_eq!(report.attempts, 3);
        assert_eq!(live.calls(), 3);
        assert!(live.executed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_broker_text_is_scrubbed_of_credentials() {
        const WITH_KEYS: &str = r#"{
            "EXNESS": {"account_id": "1", "api_key": "live-key-42", "api_secret": "live-secret-42", "api_url": "https://api.exness.example", "enabled": true}
        }"#;
        let live = Arc::new(SimulatedBroker::scripted(
            std::iter::repeat(SimulatedStep::Fail("echo X-API-Key: live-key-42 sig live-secret-42".into())).take(3),
        ));
        let registry = Arc::new(BrokerRegistry::new(
            parse_brokers(WITH_KEYS, ConfigFormat::Json).unwrap(),
        ));
        let client = ExecutionClient::new(
            registry,
            live,
            Arc::new(SimulatedBroker::demo()),
            policy(),
            Duration::from_millis(100),
            4,
        );

        let report = client.execute_trade("EXNESS", &gold(None)).await;
        let err = report.result.unwrap_err();
        for text in std::iter::once(err.to_string())
            .chain(std::iter::once(err.client_message()))
            .chain(report.retried.iter().map(|e| e.to_string()))
        {
            assert!(!text.contains("live-key-42"), "{}", text);
            assert!(!text.contains("live-secret-42"), "{}", text);
        }
        assert_eq!(report.retried.len(), 2);
        assert!(err.client_message().contains("X-API-Key: ***"));
    }

    #[tokio::test]
    async fn test_demo_brokers_route_to_simulator() {
        let live = Arc::new(SimulatedBroker::demo());
        let demo = Arc::new(SimulatedBroker::demo());
        let client = client(Arc::clone(&live), Arc::clone(&demo));

        client.execute_trade("PAPER", &gold(None)).await.result.unwrap();
        assert_eq!(demo.calls(), 1);
        assert_eq!(live.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_are_config_errors() {
        let live = Arc::new(SimulatedBroker::demo());
        let client = client(Arc::clone(&live), Arc::new(SimulatedBroker::demo()));

        for broker in ["NOPE", "OFF"] {
            let report = client.account_info(broker).await;
            assert!(matches!(report.result, Err(BridgeError::Config(_))));
            assert_eq!(report.attempts, 0);
        }
        assert_eq!(live.calls(), 0);
    }
}
