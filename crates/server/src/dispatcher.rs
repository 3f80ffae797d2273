use tracing::{debug, error, info};
use tradebridge_core::{BridgeError, TradeRequest, TradeResult};
use tradebridge_terminal::{parse_envelope, Action, Envelope, Response};

use crate::session::Session;
use crate::state::BridgeState;

/// Message returned for every successful trade.
pub const TRADE_OK_MESSAGE: &str = "Trade executed successfully";

/// Routes decoded requests for one session.
pub struct Dispatcher<'a> {
    state: &'a BridgeState,
}

impl<'a> Dispatcher<'a> {
    pub fn new(state: &'a BridgeState) -> Self {
        Self { state }
    }

    /// Handle one raw line. Always yields exactly one response.
    pub async fn handle_line(&self, session: &mut Session, line: &str) -> Response {
        match parse_envelope(line) {
            Ok(envelope) => self.dispatch(session, envelope).await,
            Err(e) => {
                debug!(session_id = session.id(), error = %e, "Unparseable message");
                self.record_failure(session, "unknown", None, &e);
                Response::error(&e)
            }
        }
    }

    pub async fn dispatch(&self, session: &mut Session, envelope: Envelope) -> Response {
        let broker = envelope
            .broker
            .clone()
            .or_else(|| self.state.config.server.default_broker.clone());

        match envelope.action {
            Action::Ping => self.ping(session, broker.as_deref()),
            Action::Trade => self.trade(session, &envelope, broker.as_deref()).await,
            Action::AccountInfo => self.account_info(session, broker.as_deref()).await,
        }
    }

    fn ping(&self, session: &mut Session, broker: Option<&str>) -> Response {
        session.touch();
        // A ping may establish the binding, but never fails because of it.
        let unbound = session.bound_broker().is_none();
        if let (true, Some(name)) = (unbound, broker) {
            if self.state.client.resolve(name).is_ok() && session.bind(name).is_ok() {
                info!(session_id = session.id(), broker = name, "Session bound by ping");
            }
        }
        let response = Response::pong();
        self.state.audit.command(
            session.id(),
            Action::Ping.as_str(),
            broker,
            &TradeResult::success("", "pong"),
            None,
            "pong",
        );
        response
    }

    /// Check the session binding and broker availability, then bind.
    fn route(&self, session: &mut Session, broker: Option<&str>) -> Result<String, BridgeError> {
        let name =
            broker.ok_or_else(|| BridgeError::Config("No broker specified".to_string()))?;
        if let Some(bound) = session.bound_broker() {
            if bound != name {
                return Err(BridgeError::Config(format!(
                    "Session is bound to broker {}, not {}",
                    bound, name
                )));
            }
        }
        self.state.client.resolve(name)?;
        session.bind(name)?;
        Ok(name.to_string())
    }

    async fn trade(&self, session: &mut Session, envelope: &Envelope, broker: Option<&str>) -> Response {
        // Validation comes first so a malformed order never touches routing.
        let request = match envelope.trade_request() {
            Ok(request) => request,
            Err(e) => return self.fail(session, Action::Trade, broker, &e, None, ""),
        };
        let detail = describe(&request);

        let name = match self.route(session, broker) {
            Ok(name) => name,
            Err(e) => return self.fail(session, Action::Trade, broker, &e, None, &detail),
        };

        let report = self.state.client.execute_trade(&name, &request).await;
        for (i, e) in report.retried.iter().enumerate() {
            self.state
                .audit
                .retry(session.id(), Action::Trade.as_str(), &name, i as u32 + 1, e);
        }

        match report.result {
            Ok(receipt) => {
                info!(
                    session_id = session.id(),
                    broker = %name,
                    order_id = %receipt.order_id,
                    attempts = report.attempts,
                    duplicate = receipt.duplicate,
                    "Trade executed"
                );
                let result = TradeResult::success(receipt.order_id, TRADE_OK_MESSAGE);
                let detail = if receipt.duplicate {
                    format!("{} (duplicate)", detail)
                } else {
                    detail
                };
                self.state.audit.command(
                    session.id(),
                    Action::Trade.as_str(),
                    Some(&name),
                    &result,
                    Some(report.attempts),
                    detail,
                );
                Response::from(&result)
            }
            Err(e) => self.fail(
                session,
                Action::Trade,
                Some(&name),
                &e,
                Some(report.attempts),
                &detail,
            ),
        }
    }

    async fn account_info(&self, session: &mut Session, broker: Option<&str>) -> Response {
        let name = match self.route(session, broker) {
            Ok(name) => name,
            Err(e) => return self.fail(session, Action::AccountInfo, broker, &e, None, ""),
        };

        let report = self.state.client.account_info(&name).await;
        for (i, e) in report.retried.iter().enumerate() {
            self.state
                .audit
                .retry(session.id(), Action::AccountInfo.as_str(), &name, i as u32 + 1, e);
        }

        match report.result {
            Ok(info) => {
                self.state.audit.command(
                    session.id(),
                    Action::AccountInfo.as_str(),
                    Some(&name),
                    &TradeResult::success("", "account info"),
                    Some(report.attempts),
                    format!("account {}", info.account_id),
                );
                Response::account(info)
            }
            Err(e) => self.fail(
                session,
                Action::AccountInfo,
                Some(&name),
                &e,
                Some(report.attempts),
                "",
            ),
        }
    }

    fn fail(
        &self,
        session: &Session,
        action: Action,
        broker: Option<&str>,
        err: &BridgeError,
        attempts: Option<u32>,
        detail: &str,
    ) -> Response {
        let audit = &self.state.audit;
        let error = audit.redact(&err.to_string());
        if let BridgeError::Internal(_) = err {
            error!(session_id = session.id(), action = action.as_str(), %error, "Internal failure");
        } else {
            info!(session_id = session.id(), action = action.as_str(), %error, "Command failed");
        }
        let mut result = TradeResult::failure(err);
        result.message = audit.redact(&result.message);
        let detail = if detail.is_empty() {
            error
        } else {
            format!("{}: {}", detail, error)
        };
        self.state
            .audit
            .command(session.id(), action.as_str(), broker, &result, attempts, detail);
        Response::from(&result)
    }

    /// Audit a failure that happened before an action could be determined.
    pub fn record_failure(&self, session: &Session, action: &str, broker: Option<&str>, err: &BridgeError) {
        self.state.audit.command(
            session.id(),
            action,
            broker,
            &TradeResult::failure(err),
            None,
            err.to_string(),
        );
    }
}

fn describe(request: &TradeRequest) -> String {
    let mut text = format!("{} {} {}", request.side.as_str(), request.lots, request.symbol);
    if let Some(price) = request.price {
        text.push_str(&format!(" @ {}", price));
    }
    if let Some(client_ref) = &request.client_ref {
        text.push_str(&format!(" ref={}", client_ref));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::config::BridgeConfig;
    use serde_json::json;
    use std::sync::Arc;
    use tradebridge_brokers_common::{
        parse_brokers, BrokerRegistry, ConfigFormat, SimulatedBroker, SimulatedStep,
    };
    use tradebridge_core::ErrorCode;

    fn state(live: Arc<SimulatedBroker>) -> BridgeState {
        let brokers = parse_brokers(
            r#"{
                "EXNESS": {"account_id": "1", "api_key": "key-exness", "api_secret": "secret-exness", "api_url": "https://api.exness.example", "enabled": true},
                "OTHER": {"account_id": "2", "api_key": "key-other", "api_secret": "secret-other", "api_url": "https://api.other.example", "enabled": true}
            }"#,
            ConfigFormat::Json,
        )
        .unwrap();
        BridgeState::new(
            BridgeConfig::default(),
            Arc::new(BrokerRegistry::new(brokers)),
            live,
            Arc::new(SimulatedBroker::demo()),
            AuditLogger::memory(),
        )
    }

    fn session() -> Session {
        Session::new(9, "127.0.0.1:50000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_ping_binds_known_broker() {
        let state = state(Arc::new(SimulatedBroker::demo()));
        let dispatcher = Dispatcher::new(&state);
        let mut session = session();

        let response = dispatcher
            .handle_line(&mut session, r#"{"action":"ping","broker":"EXNESS"}"#)
            .await;
        assert_eq!(response, Response::pong());
        assert_eq!(session.bound_broker(), Some("EXNESS"));
    }

    #[tokio::test]
    async fn test_ping_with_unknown_broker_still_pongs() {
        let state = state(Arc::new(SimulatedBroker::demo()));
        let dispatcher = Dispatcher::new(&state);
        let mut session = session();

        let response = dispatcher
            .handle_line(&mut session, r#"{"action":"ping","broker":"NOPE"}"#)
            .await;
        assert!(response.success);
        assert_eq!(session.bound_broker(), None);
    }

    #[tokio::test]
    async fn test_invalid_trade_does_not_bind() {
        let live = Arc::new(SimulatedBroker::demo());
        let state = state(Arc::clone(&live));
        let dispatcher = Dispatcher::new(&state);
        let mut session = session();

        let line = json!({"action": "trade", "broker": "EXNESS", "data": {"symbol": "", "type": 0, "lots": 1}});
        let response = dispatcher.handle_line(&mut session, &line.to_string()).await;
        assert_eq!(response.error_code, Some(ErrorCode::ValidationError));
        assert_eq!(session.bound_broker(), None);
        assert_eq!(live.calls(), 0);

        let line = json!({"action": "trade", "broker": "EXNESS", "data": {"symbol": "XAUUSD", "type": 2, "lots": 1}});
        let response = dispatcher.handle_line(&mut session, &line.to_string()).await;
        assert_eq!(response.error_code, Some(ErrorCode::ValidationError));
    }

    #[tokio::test]
    async fn test_every_command_is_audited() {
        let state = state(Arc::new(SimulatedBroker::demo()));
        let dispatcher = Dispatcher::new(&state);
        let mut session = session();

        dispatcher.handle_line(&mut session, "not json").await;
        dispatcher
            .handle_line(&mut session, r#"{"action":"account_info","broker":"EXNESS"}"#)
            .await;
        dispatcher
            .handle_line(
                &mut session,
                r#"{"action":"trade","broker":"EXNESS","data":{"symbol":"EURUSD","type":1,"lots":0.2,"client_ref":"ea-77"}}"#,
            )
            .await;

        let records = state.audit.records();
        let actions: Vec<&str> = records.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(actions, ["unknown", "account_info", "trade"]);
        assert_eq!(records[0].error_code, Some(ErrorCode::ProtocolError));
        assert_eq!(records[2].outcome, "success");
        assert_eq!(records[2].detail, "sell 0.2 EURUSD ref=ea-77");
        assert!(records.iter().all(|r| r.session_id == 9));
    }

    #[tokio::test]
    async fn test_rejection_text_is_redacted() {
        let live = Arc::new(SimulatedBroker::scripted([SimulatedStep::Reject {
            code: "AUTH_FAILED".into(),
            message: "signature secret-exness does not match key-exness".into(),
        }]));
        let state = state(live);
        let dispatcher = Dispatcher::new(&state);
        let mut session = session();

        let line = json!({"action": "trade", "broker": "EXNESS", "data": {"symbol": "EURUSD", "type": 0, "lots": 1}});
        let response = dispatcher.handle_line(&mut session, &line.to_string()).await;
        assert_eq!(response.error_code, Some(ErrorCode::BrokerRejected));
        assert_eq!(
            response.message.as_deref(),
            Some("signature *** does not match ***")
        );

        let records = state.audit.records();
        assert!(records.iter().all(|r| !r.detail.contains("key-exness")));
        assert!(records.iter().all(|r| !r.detail.contains("secret-exness")));
    }
}
