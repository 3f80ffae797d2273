use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

use crate::errors::BridgeError;

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// An opaque credential. Never printed, never serialized in clear.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value. Only broker adapters should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

// ---------------------------------------------------------------------------
// Broker configuration
// ---------------------------------------------------------------------------

/// A validated broker entry, owned by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerConfig {
    pub name: String,
    pub account_id: String,
    pub api_key: Secret,
    pub api_secret: Secret,
    /// Base endpoint URL (e.g. "https://api.exness.example/v1").
    pub api_url: String,
    pub enabled: bool,
    /// Served by the in-process simulated broker instead of the REST API.
    pub demo: bool,
    /// Per-broker cap on concurrent outbound calls.
    pub max_concurrent_calls: Option<usize>,
    /// Per-broker override of the call timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl BrokerConfig {
    /// Secret values that must never reach a log sink.
    pub fn secrets(&self) -> [&str; 2] {
        [self.api_key.expose(), self.api_secret.expose()]
    }
}

// ---------------------------------------------------------------------------
// Trading
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Decode the terminal's numeric order type (0 = buy, 1 = sell).
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// A validated trade instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub symbol: String,
    pub side: Side,
    pub lots: Decimal,
    pub price: Option<Decimal>,
    /// Client-supplied order reference, used as the idempotency key.
    pub client_ref: Option<String>,
}

impl TradeRequest {
    /// Check the invariants a request must satisfy before it can be routed.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.symbol.trim().is_empty() {
            return Err(BridgeError::Validation("symbol must not be empty".into()));
        }
        if self.lots <= Decimal::ZERO {
            return Err(BridgeError::Validation("lots must be greater than 0".into()));
        }
        if let Some(price) = self.price {
            if price <= Decimal::ZERO {
                return Err(BridgeError::Validation("price must be greater than 0".into()));
            }
        }
        Ok(())
    }
}

/// What a broker returns for an accepted trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeReceipt {
    pub order_id: String,
    pub message: Option<String>,
    /// The broker recognised the idempotency key from an earlier attempt.
    #[serde(default)]
    pub duplicate: bool,
}

/// Account summary returned by `account_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub broker: String,
    pub status: String,
    #[serde(default, with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    pub balance: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    pub equity: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Canonical error codes sent back to the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProtocolError,
    ValidationError,
    ConfigError,
    NetworkError,
    BrokerRejected,
    InternalError,
    ServerBusy,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::BrokerRejected => "BROKER_REJECTED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ServerBusy => "SERVER_BUSY",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    BrokerRejected,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::BrokerRejected => "broker_rejected",
            Outcome::Error => "error",
        }
    }
}

/// Normalized result of one dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub outcome: Outcome,
    pub order_id: Option<String>,
    pub message: String,
    pub error_code: Option<ErrorCode>,
}

impl TradeResult {
    pub fn success(order_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            order_id: Some(order_id.into()),
            message: message.into(),
            error_code: None,
        }
    }

    pub fn failure(err: &BridgeError) -> Self {
        let outcome = match err {
            BridgeError::BrokerRejected { .. } => Outcome::BrokerRejected,
            _ => Outcome::Error,
        };
        Self {
            outcome,
            order_id: None,
            message: err.client_message(),
            error_code: Some(err.code()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(lots: Decimal) -> TradeRequest {
        TradeRequest {
            symbol: "XAUUSD".into(),
            side: Side::Buy,
            lots,
            price: Some(dec!(2050.50)),
            client_ref: None,
        }
    }

    #[test]
    fn test_secret_never_formats_value() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "***");
        assert_eq!(format!("{}", secret), "***");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"***\"");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_trade_validation() {
        assert!(trade(dec!(0.01)).validate().is_ok());
        assert!(matches!(
            trade(Decimal::ZERO).validate(),
            Err(BridgeError::Validation(_))
        ));
        assert!(matches!(
            trade(dec!(-1)).validate(),
            Err(BridgeError::Validation(_))
        ));

        let mut blank = trade(dec!(1));
        blank.symbol = "  ".into();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_side_codes() {
        assert_eq!(Side::from_code(0), Some(Side::Buy));
        assert_eq!(Side::from_code(1), Some(Side::Sell));
        assert_eq!(Side::from_code(2), None);
    }

    #[test]
    fn test_failure_result_hides_internal_detail() {
        let result = TradeResult::failure(&BridgeError::Internal("pool poisoned at 0x1f".into()));
        assert_eq!(result.outcome, Outcome::Error);
        assert_eq!(result.error_code, Some(ErrorCode::InternalError));
        assert!(!result.message.contains("0x1f"));

        let rejected = TradeResult::failure(&BridgeError::BrokerRejected {
            code: "INSUFFICIENT_FUNDS".into(),
            message: "insufficient funds".into(),
        });
        assert_eq!(rejected.outcome, Outcome::BrokerRejected);
        assert_eq!(rejected.error_code, Some(ErrorCode::BrokerRejected));
    }
}
