use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tradebridge_terminal::{encode_response, Response};

use crate::session::{serve_connection, Session};
use crate::state::BridgeState;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// How the shutdown drain went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Sessions still running when the grace period ran out.
    pub forced: usize,
    /// Connections accepted over the listener's lifetime.
    pub accepted: u64,
}

impl DrainReport {
    pub fn clean(&self) -> bool {
        self.forced == 0
    }
}

/// Decrements the live-session gauge when the session task ends, aborted or not.
struct GaugeGuard(Arc<AtomicUsize>);

impl GaugeGuard {
    fn enter(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(gauge))
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accepts terminal connections and runs one task per session.
pub struct Listener {
    listener: TcpListener,
    state: Arc<BridgeState>,
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl Listener {
    pub async fn bind(state: Arc<BridgeState>) -> anyhow::Result<Self> {
        let addr = state.config.server.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!("Bridge listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            state,
            active: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Live session gauge. Stays valid after `run` consumes the listener.
    pub fn active_sessions(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active)
    }

    /// Serve until `shutdown` resolves, then stop accepting and drain.
    pub async fn run<F>(self, shutdown: F) -> DrainReport
    where
        F: Future<Output = ()>,
    {
        let Listener {
            listener,
            state,
            active,
            next_id,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(state.config.server.max_connections));
        let mut sessions = JoinSet::new();
        let mut accepted = 0u64;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                conn = listener.accept() => match conn {
                    Ok((stream, peer)) => {
                        accepted += 1;
                        let _ = stream.set_nodelay(true);
                        match Arc::clone(&slots).try_acquire_owned() {
                            Ok(permit) => {
                                let id = next_id.fetch_add(1, Ordering::Relaxed);
                                let state = Arc::clone(&state);
                                let stop = stop_rx.clone();
                                let gauge = GaugeGuard::enter(&active);
                                sessions.spawn(async move {
                                    let _permit = permit;
                                    let _gauge = gauge;
                                    info!(session_id = id, %peer, "Terminal connected");
                                    let session = serve_connection(stream, Session::new(id, peer), state, stop).await;
                                    info!(
                                        session_id = id,
                                        reason = ?session.close_reason(),
                                        messages = session.messages(),
                                        "Terminal disconnected"
                                    );
                                });
                            }
                            Err(_) => {
                                warn!(%peer, "Connection limit reached, rejecting");
                                // Not a session: kept out of the drain count.
                                tokio::spawn(reject_busy(stream));
                            }
                        }
                    }
                    Err(e) => {
                        // Usually fd exhaustion; give it a moment to clear.
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        let live = sessions.len();
        info!(sessions = live, "Shutting down, draining sessions");

        let grace = state.config.server.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        let forced = match drained {
            Ok(()) => 0,
            Err(_) => {
                let forced = sessions.len();
                warn!(forced, "Grace period expired, aborting sessions");
                sessions.abort_all();
                while sessions.join_next().await.is_some() {}
                forced
            }
        };

        info!(accepted, forced, "Listener stopped");
        DrainReport { forced, accepted }
    }
}

/// Tell an over-limit client why it is being dropped.
async fn reject_busy(mut stream: TcpStream) {
    if let Ok(bytes) = encode_response(&Response::busy()) {
        let _ = tokio::time::timeout(REJECT_WRITE_TIMEOUT, async {
            stream.write_all(&bytes).await?;
            stream.shutdown().await
        })
        .await;
    }
}
