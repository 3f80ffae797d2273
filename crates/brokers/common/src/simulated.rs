use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};
use tradebridge_core::*;

/// Scripted behaviour for one call to the simulated broker.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedStep {
    /// Execute the trade and answer immediately.
    Accept,
    /// Decline with a business error.
    Reject { code: String, message: String },
    /// Fail before reaching the broker (connection refused, 503, ...).
    Fail(String),
    /// Hang for the given time, then execute. Nothing happens server-side
    /// if the caller gives up first.
    Stall(Duration),
    /// Execute server-side, then hang before answering. Models a response
    /// lost after the broker already filled the order.
    ExecuteThenStall(Duration),
}

/// Configuration for the simulated broker.
#[derive(Debug, Clone)]
pub struct SimulatedBrokerConfig {
    /// Prefix for generated order ids.
    pub order_prefix: String,
    /// Latency added to every answered call.
    pub latency: Duration,
    /// Balance reported by `account_info`.
    pub balance: Decimal,
    pub currency: String,
}

impl Default for SimulatedBrokerConfig {
    fn default() -> Self {
        Self {
            order_prefix: "DEMO".to_string(),
            latency: Duration::ZERO,
            balance: Decimal::new(10_000, 0),
            currency: "USD".to_string(),
        }
    }
}

/// An order the simulated broker actually executed.
#[derive(Debug, Clone)]
pub struct ExecutedOrder {
    pub order_id: String,
    pub broker: String,
    pub request: TradeRequest,
    pub idempotency_key: String,
    pub executed_at: DateTime<Utc>,
}

#[derive(Default)]
struct SimulatedState {
    calls: usize,
    sequence: u64,
    executed: Vec<ExecutedOrder>,
    /// Idempotency key → order id.
    by_key: HashMap<String, String>,
}

/// In-process broker used for `demo` brokers and tests.
///
/// Accepts everything unless a script says otherwise, and honours
/// idempotency keys the way a real execution venue should.
pub struct SimulatedBroker {
    config: SimulatedBrokerConfig,
    script: Mutex<VecDeque<SimulatedStep>>,
    state: Mutex<SimulatedState>,
}

impl SimulatedBroker {
    pub fn new(config: SimulatedBrokerConfig) -> Self {
        Self {
            config,
            script: Mutex::new(VecDeque::new()),
            state: Mutex::new(SimulatedState::default()),
        }
    }

    /// Demo-mode broker: accepts all trades with `DEMO_` order ids.
    pub fn demo() -> Self {
        Self::new(SimulatedBrokerConfig::default())
    }

    /// Broker that plays `steps` in order, then accepts.
    pub fn scripted(steps: impl IntoIterator<Item = SimulatedStep>) -> Self {
        let broker = Self::demo();
        broker.push_steps(steps);
        broker
    }

    pub fn push_steps(&self, steps: impl IntoIterator<Item = SimulatedStep>) {
        self.lock_script().extend(steps);
    }

    /// Total calls received, including ones that failed or stalled.
    pub fn calls(&self) -> usize {
        self.lock_state().calls
    }

    pub fn executed_orders(&self) -> Vec<ExecutedOrder> {
        self.lock_state().executed.clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<SimulatedStep>> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Count the call and take the next scripted step.
    fn next_step(&self) -> SimulatedStep {
        self.lock_state().calls += 1;
        self.lock_script().pop_front().unwrap_or(SimulatedStep::Accept)
    }

    /// Execute once per idempotency key.
    fn execute(&self, config: &BrokerConfig, request: &TradeRequest, key: &str) -> TradeReceipt {
        let mut state = self.lock_state();
        if let Some(order_id) = state.by_key.get(key) {
            info!(broker = %config.name, order_id = %order_id, "Replayed idempotency key, not re-executing");
            return TradeReceipt {
                order_id: order_id.clone(),
                message: Some("Duplicate request, order already executed".to_string()),
                duplicate: true,
            };
        }

        state.sequence += 1;
        let now = Utc::now();
        let order_id = format!(
            "{}_{}_{}",
            self.config.order_prefix,
            now.timestamp_millis(),
            state.sequence
        );
        state.by_key.insert(key.to_string(), order_id.clone());
        state.executed.push(ExecutedOrder {
            order_id: order_id.clone(),
            broker: config.name.clone(),
            request: request.clone(),
            idempotency_key: key.to_string(),
            executed_at: now,
        });
        warn!(
            broker = %config.name,
            symbol = %request.symbol,
            side = request.side.as_str(),
            lots = %request.lots,
            "DEMO MODE: trade simulated, nothing sent to the broker"
        );

        TradeReceipt {
            order_id,
            message: Some("Trade executed successfully (DEMO MODE)".to_string()),
            duplicate: false,
        }
    }
}

#[async_trait]
impl BrokerApi for SimulatedBroker {
    async fn execute_trade(
        &self,
        config: &BrokerConfig,
        request: &TradeRequest,
        idempotency_key: &str,
    ) -> Result<TradeReceipt, BrokerError> {
        match self.next_step() {
            SimulatedStep::Accept => {
                tokio::time::sleep(self.config.latency).await;
                Ok(self.execute(config, request, idempotency_key))
            }
            SimulatedStep::Reject { code, message } => Err(BrokerError::Rejected { code, message }),
            SimulatedStep::Fail(reason) => Err(BrokerError::Network(reason)),
            SimulatedStep::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.execute(config, request, idempotency_key))
            }
            SimulatedStep::ExecuteThenStall(delay) => {
                let receipt = self.execute(config, request, idempotency_key);
                tokio::time::sleep(delay).await;
                Ok(receipt)
            }
        }
    }

    async fn account_info(&self, config: &BrokerConfig) -> Result<AccountInfo, BrokerError> {
        match self.next_step() {
            SimulatedStep::Reject { code, message } => return Err(BrokerError::Rejected { code, message }),
            SimulatedStep::Fail(reason) => return Err(BrokerError::Network(reason)),
            SimulatedStep::Stall(delay) | SimulatedStep::ExecuteThenStall(delay) => {
                tokio::time::sleep(delay).await
            }
            SimulatedStep::Accept => tokio::time::sleep(self.config.latency).await,
        }

        Ok(AccountInfo {
            account_id: config.account_id.clone(),
            broker: config.name.clone(),
            status: "connected".to_string(),
            balance: Some(self.config.balance),
            equity: Some(self.config.balance),
            currency: Some(self.config.currency.clone()),
        })
    }
}
