//! Client Connection
//!
//! Drives one accepted socket through
//! `Connecting -> Active -> Draining -> Closed`.
//!
//! The connection task reads command lines and wakes the
//! [`ReplaySession`] when replay output is due. A separate writer task owns
//! the socket's write half and drains the [`OutboundQueue`], so a slow
//! client never blocks replay or other connections. Commands from a client
//! that stops reading are left unread until its replies drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::outbound::{OutboundQueue, run_writer};
use crate::application::ports::HistoryStore;
use crate::application::services::{Directive, DisconnectReason, ReplaySession};
use crate::domain::replay::{Clock, Pacer};
use crate::infrastructure::config::ConnectionSettings;
use crate::infrastructure::iqfeed::{FeedCodec, LineCodec, ParseError, RawLine};
use crate::infrastructure::metrics;

/// Dependencies shared by every connection on a server.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Replay pacing.
    pub pacer: Pacer,
    /// Shared history store.
    pub store: Arc<dyn HistoryStore>,
    /// Server clock.
    pub clock: Arc<dyn Clock>,
    /// Per-connection settings.
    pub settings: ConnectionSettings,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, nothing processed yet.
    Connecting,
    /// Reading commands and replaying records.
    Active,
    /// No more commands; flushing queued output.
    Draining,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// State name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

/// Connection errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Reading from the socket failed.
    #[error("socket read failed: {0}")]
    Read(#[source] std::io::Error),

    /// Writing to the socket failed.
    #[error("socket write failed: {0}")]
    Write(#[source] std::io::Error),

    /// The writer task panicked or was cancelled.
    #[error("writer task failed: {0}")]
    Writer(String),
}

/// What happened on a finished connection.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Session identifier used in logs.
    pub id: Uuid,
    /// Why the session ended.
    pub reason: DisconnectReason,
    /// Lines written to the client.
    pub lines_written: u64,
    /// Record lines evicted because the client fell behind.
    pub records_dropped: u64,
    /// Subscriptions discarded at close.
    pub subscriptions_closed: usize,
}

/// One client connection.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    peer: Option<SocketAddr>,
    context: Arc<ConnectionContext>,
    state: SessionState,
}

impl Connection {
    /// Create a connection for an accepted socket.
    #[must_use]
    pub fn new(peer: Option<SocketAddr>, context: Arc<ConnectionContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            context,
            state: SessionState::Connecting,
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the socket until the client leaves, misbehaves, or `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the socket failed. The session is closed
    /// and its subscriptions released either way.
    pub async fn run<S>(
        self,
        stream: S,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let span = tracing::info_span!("session", session_id = %self.id, peer = ?self.peer);
        self.serve(stream, cancel).instrument(span).await
    }

    async fn serve<S>(
        mut self,
        stream: S,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let started = Instant::now();
        let settings = self.context.settings;
        let codec = FeedCodec::new();

        let (read_half, write_half) = tokio::io::split(stream);
        let queue = Arc::new(OutboundQueue::new(settings.queue_capacity));
        let writer_queue = Arc::clone(&queue);
        let mut writer: JoinHandle<Result<u64, std::io::Error>> = tokio::spawn(
            async move { run_writer(&writer_queue, write_half, codec).await }.in_current_span(),
        );
        let mut lines = FramedRead::new(read_half, LineCodec::new(settings.max_line_length));

        let mut session = ReplaySession::new(
            self.context.pacer,
            Arc::clone(&self.context.store),
            Arc::clone(&self.context.clock),
            settings.session,
        );
        queue.extend(session.take_outbox());
        self.transition(SessionState::Active);

        let mut writer_result = None;
        let mut read_error = None;

        let reason = loop {
            session.tick().await;
            queue.extend(session.take_outbox());
            if queue.is_overflowed() {
                tracing::warn!(queued = queue.len(), "Client stopped reading, closing");
                break DisconnectReason::Fault;
            }
            let pause = self.pause(&session, settings.poll_interval);
            let reading = queue.accepts_commands();

            tokio::select! {
                biased;

                () = cancel.cancelled() => break DisconnectReason::Shutdown,

                result = &mut writer => {
                    writer_result = Some(result);
                    break DisconnectReason::Fault;
                }

                line = lines.next(), if reading => {
                    let directive = match line {
                        None => Directive::Disconnect(DisconnectReason::HalfClosed),
                        Some(Err(e)) => {
                            read_error = Some(e);
                            Directive::Disconnect(DisconnectReason::Fault)
                        }
                        Some(Ok(RawLine::Text(text))) if text.trim().is_empty() => Directive::Continue,
                        Some(Ok(RawLine::Text(text))) => match codec.decode(&text) {
                            Ok(command) => {
                                metrics::record_command(command.name());
                                session.handle(command).await
                            }
                            Err(e) => {
                                metrics::record_protocol_error();
                                session.reject(e.to_string())
                            }
                        },
                        Some(Ok(RawLine::Oversized)) => {
                            metrics::record_protocol_error();
                            let limit = settings.max_line_length;
                            session.reject(ParseError::LineTooLong { limit }.to_string())
                        }
                    };
                    queue.extend(session.take_outbox());

                    if let Directive::Disconnect(reason) = directive {
                        break reason;
                    }
                }

                () = tokio::time::sleep(pause) => {}
            }
        };

        self.transition(SessionState::Draining);
        tracing::debug!(reason = reason.as_str(), "Session draining");
        queue.extend(session.take_outbox());
        queue.close();
        let subscriptions_closed = session.close();

        let writer_result = match writer_result {
            Some(result) => Some(result),
            None => match tokio::time::timeout(settings.drain_timeout, &mut writer).await {
                Ok(result) => Some(result),
                Err(_) => {
                    tracing::warn!(
                        pending = queue.len(),
                        "Drain timed out, discarding queued output"
                    );
                    writer.abort();
                    None
                }
            },
        };

        self.transition(SessionState::Closed);
        metrics::record_session_closed(reason, started.elapsed());

        let summary = SessionSummary {
            id: self.id,
            reason,
            lines_written: 0,
            records_dropped: queue.dropped_total(),
            subscriptions_closed,
        };

        if let Some(e) = read_error {
            tracing::info!(reason = reason.as_str(), error = %e, "Session closed after read error");
            return Err(SessionError::Read(e));
        }

        let summary = match writer_result {
            Some(Ok(Ok(lines_written))) => SessionSummary {
                lines_written,
                ..summary
            },
            Some(Ok(Err(e))) => {
                tracing::info!(reason = reason.as_str(), error = %e, "Session closed after write error");
                return Err(SessionError::Write(e));
            }
            Some(Err(e)) => return Err(SessionError::Writer(e.to_string())),
            None => summary,
        };

        tracing::info!(
            reason = reason.as_str(),
            lines_written = summary.lines_written,
            records_dropped = summary.records_dropped,
            subscriptions = subscriptions_closed,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Session closed"
        );

        Ok(summary)
    }

    /// How long to sleep before the next replay tick.
    fn pause(&self, session: &ReplaySession, poll_interval: Duration) -> Duration {
        let now = self.context.clock.now();
        session
            .next_wake()
            .map_or(poll_interval, |at| {
                at.saturating_duration_since(now).min(poll_interval)
            })
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = self.state.as_str(), to = next.as_str(), "Session state");
        self.state = next;
    }
}
