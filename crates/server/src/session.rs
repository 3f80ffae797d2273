use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tradebridge_core::BridgeError;
use tradebridge_terminal::{encode_response, LineDecoder, Response};

use crate::dispatcher::Dispatcher;
use crate::state::BridgeState;

const READ_CHUNK: usize = 4096;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline used when a configured timeout does not fit in an `Instant`.
const FAR_FUTURE_SECS: u64 = 365 * 24 * 60 * 60;

/// Lifecycle of one terminal connection. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connected,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HandshakeTimeout,
    IdleTimeout,
    ClientClosed,
    ReadFailed,
    WriteFailed,
    Shutdown,
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    peer: SocketAddr,
    state: SessionState,
    bound_broker: Option<String>,
    opened_at: Instant,
    last_activity: Instant,
    messages: u64,
    close_reason: Option<CloseReason>,
}

impl Session {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer,
            state: SessionState::Connected,
            bound_broker: None,
            opened_at: now,
            last_activity: now,
            messages: 0,
            close_reason: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bound_broker(&self) -> Option<&str> {
        self.bound_broker.as_deref()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn advance(&mut self, next: SessionState) -> bool {
        if next > self.state {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Bind to a broker. A session binds once; later commands must target
    /// the same broker.
    pub fn bind(&mut self, broker: &str) -> Result<(), BridgeError> {
        match &self.bound_broker {
            Some(bound) if bound == broker => Ok(()),
            Some(bound) => Err(BridgeError::Config(format!(
                "Session is bound to broker {}, not {}",
                bound, broker
            ))),
            None if self.state >= SessionState::Closing => {
                Err(BridgeError::Internal("session is closing".to_string()))
            }
            None => {
                self.bound_broker = Some(broker.to_string());
                self.advance(SessionState::Active);
                Ok(())
            }
        }
    }

    /// Start closing. The first reason recorded wins.
    pub fn begin_close(&mut self, reason: CloseReason) {
        if self.advance(SessionState::Closing) {
            self.close_reason = Some(reason);
        }
    }

    pub fn finish_close(&mut self) {
        if self.state < SessionState::Closing {
            self.begin_close(CloseReason::ClientClosed);
        }
        self.advance(SessionState::Closed);
    }

    /// When the connection must produce its next bytes. Until the first
    /// complete message arrives the handshake deadline applies.
    fn read_deadline(&self, handshake: Duration, idle: Duration) -> (Instant, CloseReason) {
        let (from, after, reason) = if self.messages == 0 {
            (self.opened_at, handshake, CloseReason::HandshakeTimeout)
        } else {
            (self.last_activity, idle, CloseReason::IdleTimeout)
        };
        let deadline = from
            .checked_add(after)
            .unwrap_or_else(|| from + Duration::from_secs(FAR_FUTURE_SECS));
        (deadline, reason)
    }
}

/// Drive one connection until it closes. Messages are handled strictly in
/// arrival order and each gets exactly one response line.
pub async fn serve_connection<S>(
    stream: S,
    mut session: Session,
    state: Arc<BridgeState>,
    mut shutdown: watch::Receiver<bool>,
) -> Session
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let settings = &state.config.server;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = LineDecoder::new(settings.max_line_bytes);
    let mut chunk = vec![0u8; READ_CHUNK];
    let dispatcher = Dispatcher::new(&state);

    'session: loop {
        while let Some(frame) = decoder.next_frame() {
            session.messages += 1;
            let response = match frame {
                Ok(line) => dispatcher.handle_line(&mut session, &line).await,
                Err(e) => {
                    let err = BridgeError::from(e);
                    warn!(session_id = session.id, error = %err, "Rejected frame");
                    dispatcher.record_failure(&session, "unknown", None, &err);
                    Response::error(&err)
                }
            };

            if let Err(e) = write_response(&mut writer, &response).await {
                warn!(session_id = session.id, error = %e, "Write failed, closing session");
                session.begin_close(CloseReason::WriteFailed);
                break 'session;
            }

            // In-flight work is done; stop before picking up anything new.
            if *shutdown.borrow() {
                session.begin_close(CloseReason::Shutdown);
                break 'session;
            }
        }

        if *shutdown.borrow() {
            session.begin_close(CloseReason::Shutdown);
            break;
        }

        let (deadline, on_expiry) =
            session.read_deadline(settings.handshake_timeout(), settings.idle_timeout());

        tokio::select! {
            _ = shutdown.changed() => {
                session.begin_close(CloseReason::Shutdown);
                break;
            }
            read = tokio::time::timeout_at(deadline.into(), reader.read(&mut chunk)) => match read {
                Err(_) => {
                    info!(session_id = session.id, reason = ?on_expiry, "Session timed out");
                    session.begin_close(on_expiry);
                    break;
                }
                Ok(Ok(0)) => {
                    if decoder.has_partial() {
                        debug!(session_id = session.id, "Discarding unterminated trailing data");
                    }
                    session.begin_close(CloseReason::ClientClosed);
                    break;
                }
                Ok(Ok(n)) => {
                    decoder.push(&chunk[..n]);
                    session.touch();
                }
                Ok(Err(e)) => {
                    warn!(session_id = session.id, error = %e, "Read failed");
                    session.begin_close(CloseReason::ReadFailed);
                    break;
                }
            }
        }
    }

    let _ = tokio::time::timeout(WRITE_TIMEOUT, writer.shutdown()).await;
    session.finish_close();
    session
}

async fn write_response<W>(writer: &mut W, response: &Response) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_response(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    match tokio::time::timeout(WRITE_TIMEOUT, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "response write timed out",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(1, "127.0.0.1:40000".parse().unwrap())
    }

    #[test]
    fn test_bind_moves_to_active() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Connected);
        s.bind("EXNESS").unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.bound_broker(), Some("EXNESS"));
        s.bind("EXNESS").unwrap();
    }

    #[test]
    fn test_bind_is_sticky() {
        let mut s = session();
        s.bind("EXNESS").unwrap();
        let err = s.bind("OTHER").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        assert_eq!(s.bound_broker(), Some("EXNESS"));
    }

    #[test]
    fn test_deadline_survives_huge_timeouts() {
        let mut s = session();
        let (deadline, reason) = s.read_deadline(Duration::MAX, Duration::from_secs(1));
        assert_eq!(reason, CloseReason::HandshakeTimeout);
        assert!(deadline > Instant::now() + Duration::from_secs(60 * 60));

        s.messages = 1;
        let (deadline, reason) = s.read_deadline(Duration::from_secs(1), Duration::from_millis(u64::MAX));
        assert_eq!(reason, CloseReason::IdleTimeout);
        assert!(deadline > s.last_activity());
    }

    #[test]
    fn test_state_never_reverts() {
        let mut s = session();
        s.begin_close(CloseReason::IdleTimeout);
        s.begin_close(CloseReason::Shutdown);
        assert_eq!(s.state(), SessionState::Closing);
        assert_eq!(s.close_reason(), Some(CloseReason::IdleTimeout));

        assert!(s.bind("EXNESS").is_err());
        assert_eq!(s.state(), SessionState::Closing);

        s.finish_close();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(!s.advance(SessionState::Active));
    }

    #[test]
    fn test_finish_without_reason_counts_as_client_close() {
        let mut s = session();
        s.finish_close();
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.close_reason(), Some(CloseReason::ClientClosed));
    }
}
