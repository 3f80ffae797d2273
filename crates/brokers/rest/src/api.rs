use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tradebridge_core::{AccountInfo, BrokerConfig, Side, TradeRequest};

/// Body of `POST {api_url}/orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayload {
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub lots: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub client_ref: String,
}

impl OrderPayload {
    pub fn new(config: &BrokerConfig, request: &TradeRequest, idempotency_key: &str) -> Self {
        Self {
            account_id: config.account_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            lots: request.lots,
            price: request.price,
            client_ref: idempotency_key.to_string(),
        }
    }
}

/// Successful (or replayed) order acknowledgement.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub order_id: Option<String>,
    pub message: Option<String>,
}

/// Error body. Brokers disagree on field names, so accept the common ones.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(alias = "error_code")]
    pub code: Option<String>,
    #[serde(alias = "error")]
    pub message: Option<String>,
}

/// Body of `GET {api_url}/accounts/{account_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountPayload {
    pub account_id: Option<String>,
    pub status: Option<String>,
    pub balance: Option<Decimal>,
    pub equity: Option<Decimal>,
    pub currency: Option<String>,
}

impl AccountPayload {
    pub fn into_info(self, config: &BrokerConfig) -> AccountInfo {
        AccountInfo {
            account_id: self.account_id.unwrap_or_else(|| config.account_id.clone()),
            broker: config.name.clone(),
            status: self.status.unwrap_or_else(|| "connected".to_string()),
            balance: self.balance,
            equity: self.equity,
            currency: self.currency,
        }
    }
}
