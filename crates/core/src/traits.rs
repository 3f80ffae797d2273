use crate::models::*;
use async_trait::async_trait;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Broker Trait
// ---------------------------------------------------------------------------

/// Errors that can occur during a single outbound broker call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    /// Connection refused, reset, DNS failure, or a 5xx from the broker.
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    /// The broker explicitly declined the request (insufficient funds, invalid symbol, ...).
    #[error("Rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    /// Malformed broker payload or a bug on our side.
    #[error("Broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Only transport-class failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Network(_) | BrokerError::Timeout(_))
    }

    /// Mask every occurrence of `secrets` in the error text with `***`.
    pub fn redacted(self, secrets: &[&str]) -> Self {
        let mut secrets: Vec<&str> = secrets.iter().copied().filter(|s| !s.is_empty()).collect();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        let scrub = |text: String| {
            secrets
                .iter()
                .fold(text, |acc, secret| acc.replace(*secret, "***"))
        };
        match self {
            BrokerError::Network(msg) => BrokerError::Network(scrub(msg)),
            BrokerError::Timeout(after) => BrokerError::Timeout(after),
            BrokerError::Rejected { code, message } => BrokerError::Rejected {
                code: scrub(code),
                message: scrub(message),
            },
            BrokerError::Internal(msg) => BrokerError::Internal(scrub(msg)),
        }
    }
}

/// An adapter that can execute trades against one family of broker APIs.
///
/// Adapters are stateless with respect to routing: the broker entry is passed
/// on every call so a registry reload takes effect immediately.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Submit a trade. `idempotency_key` is identical across retries of the
    /// same request so the broker can recognise a replay.
    async fn execute_trade(
        &self,
        config: &BrokerConfig,
        request: &TradeRequest,
        idempotency_key: &str,
    ) -> Result<TradeReceipt, BrokerError>;

    /// Fetch the account summary.
    async fn account_info(&self, config: &BrokerConfig) -> Result<AccountInfo, BrokerError>;
}
