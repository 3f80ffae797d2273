use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info};
use tradebridge_core::*;

use crate::api::*;

type HmacSha256 = Hmac<Sha256>;

/// HTTP client settings shared by every broker served over REST.
#[derive(Debug, Clone)]
pub struct RestBrokerConfig {
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
}

impl Default for RestBrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 4,
            user_agent: concat!("tradebridge/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Broker adapter speaking a signed JSON REST API.
///
/// Timeouts and retries are applied by the caller; this type performs exactly
/// one HTTP request per call and classifies the outcome.
pub struct RestBroker {
    http: reqwest::Client,
}

impl RestBroker {
    pub fn new(config: RestBrokerConfig) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| BrokerError::Internal(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self { http })
    }

    async fn send(
        &self,
        config: &BrokerConfig,
        method: Method,
        path: &str,
        body: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> Result<(StatusCode, String), BrokerError> {
        let url = format!("{}{}", config.api_url, path);
        let signed_path = url::Url::parse(&url)
            .map_err(|e| BrokerError::Internal(format!("invalid broker URL: {}", e)))?
            .path()
            .to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = sign(
            config.api_secret.expose(),
            &timestamp,
            method.as_str(),
            &signed_path,
            &body,
        )?;

        let mut request = self
            .http
            .request(method, &url)
            .header("X-API-Key", config.api_key.expose())
            .header("X-Timestamp", &timestamp)
            .header("X-Signature", signature)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;
        debug!(broker = %config.name, %status, "Broker responded");
        Ok((status, text))
    }
}

/// HMAC-SHA256 over `timestamp + method + path + body`, hex encoded.
pub fn sign(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<String, BrokerError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BrokerError::Internal("invalid signing key".to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn classify_transport(err: reqwest::Error) -> BrokerError {
    if err.is_builder() {
        BrokerError::Internal(format!("request build failed: {}", err))
    } else if err.is_timeout() {
        BrokerError::Network(format!("request timed out: {}", err))
    } else {
        BrokerError::Network(err.to_string())
    }
}

/// Map a non-success HTTP answer onto the broker error classes.
fn classify_status(status: StatusCode, body: &str) -> BrokerError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return BrokerError::Network(format!("HTTP {}", status));
    }

    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "AUTH_FAILED".to_string(),
        _ => parsed.code.unwrap_or_else(|| "REJECTED".to_string()),
    };
    let message = parsed.message.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request rejected")
            .to_string()
    });
    BrokerError::Rejected { code, message }
}

fn parse_ack(body: &str) -> Result<(String, Option<String>), BrokerError> {
    let ack: OrderAck = serde_json::from_str(body)
        .map_err(|e| BrokerError::Internal(format!("malformed order acknowledgement: {}", e)))?;
    let order_id = ack
        .order_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BrokerError::Internal("order acknowledgement without order_id".to_string()))?;
    Ok((order_id, ack.message))
}

#[async_trait]
impl BrokerApi for RestBroker {
    async fn execute_trade(
        &self,
        config: &BrokerConfig,
        request: &TradeRequest,
        idempotency_key: &str,
    ) -> Result<TradeReceipt, BrokerError> {
        let payload = OrderPayload::new(config, request, idempotency_key);
        let body = serde_json::to_vec(&payload)
            .map_err(|e| BrokerError::Internal(format!("order serialization failed: {}", e)))?;

        let (status, text) = self
            .send(config, Method::POST, "/orders", body, Some(idempotency_key))
            .await?;

        if status.is_success() {
            let (order_id, message) = parse_ack(&text)?;
            info!(broker = %config.name, order_id = %order_id, "Order accepted");
            return Ok(TradeReceipt {
                order_id,
                message,
                duplicate: false,
            });
        }

        // 409 carrying an order id means the key was already executed.
        if status == StatusCode::CONFLICT {
            if let Ok((order_id, message)) = parse_ack(&text) {
                info!(broker = %config.name, order_id = %order_id, "Broker recognised replayed order");
                return Ok(TradeReceipt {
                    order_id,
                    message,
                    duplicate: true,
                });
            }
        }

        Err(classify_status(status, &text))
    }

    async fn account_info(&self, config: &BrokerConfig) -> Result<AccountInfo, BrokerError> {
        let path = format!("/accounts/{}", config.account_id);
        let (status, text) = self.send(config, Method::GET, &path, Vec::new(), None).await?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        let payload: AccountPayload = serde_json::from_str(&text)
            .map_err(|e| BrokerError::Internal(format!("malformed account payload: {}", e)))?;
        Ok(payload.into_info(config))
    }
}
