//! TCP bridge between MetaTrader terminals and broker execution APIs.

pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod listener;
pub mod session;
pub mod state;

pub use audit::{AuditLogger, AuditRecord};
pub use config::{BridgeConfig, ConfigError};
pub use listener::{DrainReport, Listener};
pub use session::{CloseReason, Session, SessionState};
pub use state::BridgeState;

use std::future::Future;
use std::sync::Arc;

/// Start the bridge and serve until `shutdown` resolves.
pub async fn start_server<F>(state: Arc<BridgeState>, shutdown: F) -> anyhow::Result<DrainReport>
where
    F: Future<Output = ()>,
{
    let listener = Listener::bind(state).await?;
    Ok(listener.run(shutdown).await)
}
