use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tradebridge_core::{AccountInfo, BridgeError, ErrorCode, Side, TradeRequest, TradeResult};

/// Actions the terminal may request. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Ping,
    Trade,
    AccountInfo,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::Trade => "trade",
            Action::AccountInfo => "account_info",
        }
    }
}

impl FromStr for Action {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(Action::Ping),
            "trade" => Ok(Action::Trade),
            "account_info" => Ok(Action::AccountInfo),
            other => Err(BridgeError::Protocol(format!("Unknown action: {}", other))),
        }
    }
}

/// Request as it appears on the wire, before the action tag is checked.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    action: Option<String>,
    broker: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// A decoded request from the terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub action: Action,
    /// Target broker. `None` means the server default applies.
    pub broker: Option<String>,
    pub data: Option<Value>,
}

/// Trade payload fields as sent by the EA. Everything is optional so that a
/// missing field is reported as a validation failure, not a parse failure.
#[derive(Debug, Deserialize)]
struct TradeData {
    symbol: Option<String>,
    #[serde(rename = "type")]
    order_type: Option<i64>,
    lots: Option<Decimal>,
    price: Option<Decimal>,
    client_ref: Option<String>,
}

/// Parse one line into an envelope. Any failure here is a protocol error.
pub fn parse_envelope(line: &str) -> Result<Envelope, BridgeError> {
    let raw: RawEnvelope = serde_json::from_str(line)
        .map_err(|e| BridgeError::Protocol(format!("Invalid JSON format: {}", e)))?;

    let action = raw
        .action
        .ok_or_else(|| BridgeError::Protocol("missing field: action".to_string()))?
        .parse::<Action>()?;

    let broker = raw
        .broker
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty());

    Ok(Envelope {
        action,
        broker,
        data: raw.data,
    })
}

impl Envelope {
    /// Extract and validate the trade payload.
    pub fn trade_request(&self) -> Result<TradeRequest, BridgeError> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| BridgeError::Validation("trade requires a data object".to_string()))?;

        let data: TradeData = serde_json::from_value(data)
            .map_err(|e| BridgeError::Validation(format!("invalid trade data: {}", e)))?;

        let symbol = data
            .symbol
            .ok_or_else(|| BridgeError::Validation("missing field: symbol".to_string()))?;
        let code = data
            .order_type
            .ok_or_else(|| BridgeError::Validation("missing field: type".to_string()))?;
        let side = Side::from_code(code).ok_or_else(|| {
            BridgeError::Validation(format!("type must be 0 (buy) or 1 (sell), got {}", code))
        })?;
        let lots = data
            .lots
            .ok_or_else(|| BridgeError::Validation("missing field: lots".to_string()))?;

        let request = TradeRequest {
            symbol: symbol.trim().to_string(),
            side,
            lots,
            price: data.price,
            client_ref: data.client_ref.filter(|r| !r.trim().is_empty()),
        };
        request.validate()?;
        Ok(request)
    }
}

/// Response sent back to the terminal, one per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
}

impl Response {
    pub fn pong() -> Self {
        Self {
            success: true,
            order_id: None,
            message: Some("pong".to_string()),
            error_code: None,
            account: None,
        }
    }

    pub fn account(info: AccountInfo) -> Self {
        Self {
            success: true,
            order_id: None,
            message: None,
            error_code: None,
            account: Some(info),
        }
    }

    pub fn error(err: &BridgeError) -> Self {
        Self::from(&TradeResult::failure(err))
    }

    pub fn busy() -> Self {
        Self {
            success: false,
            order_id: None,
            message: Some("server at connection capacity".to_string()),
            error_code: Some(ErrorCode::ServerBusy),
            account: None,
        }
    }
}

impl From<&TradeResult> for Response {
    fn from(result: &TradeResult) -> Self {
        Self {
            success: result.is_success(),
            order_id: result.order_id.clone(),
            message: Some(result.message.clone()),
            error_code: result.error_code,
            account: None,
        }
    }
}
