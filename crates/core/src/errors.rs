use crate::models::ErrorCode;
use crate::traits::BrokerError;

/// Error taxonomy for a single dispatched command.
///
/// Only `Network` is retried (inside the broker client). Everything else is
/// terminal for the request that produced it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Broker rejected ({code}): {message}")]
    BrokerRejected { code: String, message: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Protocol(_) => ErrorCode::ProtocolError,
            BridgeError::Validation(_) => ErrorCode::ValidationError,
            BridgeError::Config(_) => ErrorCode::ConfigError,
            BridgeError::Network(_) => ErrorCode::NetworkError,
            BridgeError::BrokerRejected { .. } => ErrorCode::BrokerRejected,
            BridgeError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// The message the terminal sees. Internal detail stays in the logs.
    pub fn client_message(&self) -> String {
        match self {
            BridgeError::Internal(_) => "internal error".to_string(),
            BridgeError::BrokerRejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<BrokerError> for BridgeError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Network(msg) => BridgeError::Network(msg),
            BrokerError::Timeout(after) => {
                BridgeError::Network(format!("broker call timed out after {:?}", after))
            }
            BrokerError::Rejected { code, message } => BridgeError::BrokerRejected { code, message },
            BrokerError::Internal(msg) => BridgeError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_broker_errors_map_to_taxonomy() {
        let timeout: BridgeError = BrokerError::Timeout(Duration::from_secs(3)).into();
        assert_eq!(timeout.code(), ErrorCode::NetworkError);

        let rejected: BridgeError = BrokerError::Rejected {
            code: "INVALID_SYMBOL".into(),
            message: "unknown symbol".into(),
        }
        .into();
        assert_eq!(rejected.code(), ErrorCode::BrokerRejected);
        assert_eq!(rejected.client_message(), "unknown symbol");
    }

    #[test]
    fn test_internal_message_is_generic() {
        let err = BridgeError::Internal("join error: task 17 panicked".into());
        assert_eq!(err.client_message(), "internal error");
    }
}
