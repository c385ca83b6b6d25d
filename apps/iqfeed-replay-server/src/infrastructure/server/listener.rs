//! Server Listener
//!
//! Accepts client sockets and spawns one [`Connection`] per client. Every
//! connection shares the server's [`ConnectionContext`] (store, clock and
//! pacing) and a child of the server's cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{Connection, ConnectionContext};
use crate::domain::protocol::Message;
use crate::infrastructure::iqfeed::{FeedCodec, LineCodec};
use crate::infrastructure::metrics::{self, RejectReason};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// =============================================================================
// Stats
// =============================================================================

/// Connection counters shared with the health endpoint.
#[derive(Debug, Default)]
pub struct ServerStats {
    active: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl ServerStats {
    /// Connected clients.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Connections accepted since start.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections turned away since start.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Bound address while the listener is accepting.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Whether the listener is accepting.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.local_addr.read().is_some()
    }

    fn open(self: &Arc<Self>) -> ActiveGuard {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_connection_accepted();
        metrics::set_active_connections(active);
        ActiveGuard {
            stats: Arc::clone(self),
        }
    }
}

/// Decrements the active count when a connection task ends, however it ends.
struct ActiveGuard {
    stats: Arc<ServerStats>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let active = self.stats.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_active_connections(active);
    }
}

// =============================================================================
// Server
// =============================================================================

/// Listener errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Could not bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Could not read the bound address.
    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// The feed emulator's TCP server.
#[derive(Debug)]
pub struct ReplayServer {
    context: Arc<ConnectionContext>,
    max_connections: usize,
    stats: Arc<ServerStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ReplayServer {
    /// Create a server. `max_connections` of 0 means unlimited.
    #[must_use]
    pub fn new(
        context: ConnectionContext,
        max_connections: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context: Arc::new(context),
            max_connections,
            stats: Arc::new(ServerStats::default()),
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Shared connection counters.
    #[must_use]
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Bind `addr` and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Bind` if the address cannot be bound.
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve_listener(listener).await
    }

    /// Serve an already-bound listener until cancelled, then wait for every
    /// session to drain.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::LocalAddr` if the listener's address cannot be read.
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;
        *self.stats.local_addr.write() = Some(local_addr);
        tracing::info!(
            addr = %local_addr,
            max_connections = self.max_connections,
            speed = self.context.pacer.speed(),
            on_end = self.context.pacer.on_end().as_str(),
            store = self.context.store.name(),
            "Replay server listening"
        );

        let mut incoming = TcpListenerStream::new(listener);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                next = incoming.next() => match next {
                    Some(Ok(socket)) => self.admit(socket),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                        metrics::record_connection_rejected(RejectReason::AcceptError);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    None => break,
                },
            }
        }

        drop(incoming);
        *self.stats.local_addr.write() = None;

        self.tracker.close();
        tracing::info!(sessions = self.stats.active(), "Waiting for sessions to drain");
        self.tracker.wait().await;
        tracing::info!("Replay server stopped");
        Ok(())
    }

    fn admit(&self, socket: TcpStream) {
        let peer = socket.peer_addr().ok();
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(peer = ?peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let active = self.stats.active();
        if self.max_connections > 0 && active >= self.max_connections {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::record_connection_rejected(RejectReason::ServerBusy);
            tracing::warn!(
                peer = ?peer,
                active,
                limit = self.max_connections,
                "Connection limit reached, rejecting client"
            );
            self.tracker.spawn(reject_busy(socket));
            return;
        }

        let guard = self.stats.open();
        let connection = Connection::new(peer, Arc::clone(&self.context));
        tracing::info!(peer = ?peer, session_id = %connection.id(), "Client connected");

        let cancel = self.cancel.child_token();
        self.tracker.spawn(async move {
            let _guard = guard;
            if let Err(e) = connection.run(socket, cancel).await {
                tracing::debug!(error = %e, "Session ended on socket error");
            }
        });
    }
}

/// Tell a client the server is full, then hang up.
async fn reject_busy(socket: TcpStream) {
    let mut sink = FramedWrite::new(socket, LineCodec::default());
    let line = FeedCodec::new().encode(&Message::ServerBusy);

    let result = match sink.send(line).await {
        Ok(()) => sink.close().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Failed to send server busy");
    }
}
