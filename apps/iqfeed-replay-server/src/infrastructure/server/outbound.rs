//! Outbound Queue and Writer
//!
//! Each connection queues lines for a dedicated writer task. The queue is
//! bounded for record lines only: when it is full the oldest queued record
//! is evicted, and the writer announces the loss with a single
//! `S,GAP,<n>` ahead of the next batch. Status lines are never evicted;
//! instead the connection stops reading commands once
//! [`STATUS_LINE_LIMIT`] of them are waiting, and a queue that still
//! overflows (heartbeats to a client that never reads) is marked
//! overflowed so the connection can be closed.

use std::collections::VecDeque;
use std::io;

use futures_util::SinkExt;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use tokio_util::codec::FramedWrite;

use crate::application::services::Outbound;
use crate::domain::protocol::Message;
use crate::infrastructure::iqfeed::{FeedCodec, LineCodec};
use crate::infrastructure::metrics;

/// Queued status lines at which the connection stops reading commands.
pub const STATUS_LINE_LIMIT: usize = 64;

/// Queued status lines beyond which the queue gives up on the client.
const STATUS_LINE_HARD_LIMIT: usize = STATUS_LINE_LIMIT * 2;

#[derive(Debug, Default)]
struct QueueState {
    lines: VecDeque<Outbound>,
    records: usize,
    statuses: usize,
    overflowed: bool,
    dropped: u64,
    dropped_total: u64,
    closed: bool,
}

/// Bounded per-connection output queue.
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` record lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue one line, evicting the oldest record if the queue is full.
    ///
    /// Returns `false` if the queue has been closed or has overflowed.
    pub fn push(&self, item: Outbound) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed || state.overflowed {
                return false;
            }

            if item.is_droppable() {
                if state.records >= self.capacity {
                    if let Some(oldest) = state.lines.iter().position(Outbound::is_droppable) {
                        state.lines.remove(oldest);
                        state.records -= 1;
                    }
                    state.dropped += 1;
                    state.dropped_total += 1;
                    metrics::record_records_dropped(1);
                }
                state.records += 1;
            } else if state.statuses >= STATUS_LINE_HARD_LIMIT {
                state.overflowed = true;
                return false;
            } else {
                state.statuses += 1;
            }
            state.lines.push_back(item);
        }

        self.notify.notify_one();
        true
    }

    /// Queue several lines in order.
    pub fn extend(&self, items: impl IntoIterator<Item = Outbound>) {
        for item in items {
            if !self.push(item) {
                break;
            }
        }
    }

    /// Stop accepting lines. Lines already queued are still delivered.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Lines waiting for the writer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().lines.len()
    }

    /// Whether nothing is waiting for the writer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether few enough status lines are waiting to accept more commands.
    #[must_use]
    pub fn accepts_commands(&self) -> bool {
        let state = self.state.lock();
        !state.overflowed && state.statuses < STATUS_LINE_LIMIT
    }

    /// Whether a status line was refused because the client stopped reading.
    #[must_use]
    pub fn is_overflowed(&self) -> bool {
        self.state.lock().overflowed
    }

    /// Records evicted over the queue's lifetime.
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.state.lock().dropped_total
    }

    /// Take everything queued, prefixed by a gap notice if records were
    /// evicted since the last batch. Waits while the queue is empty;
    /// returns `None` once it is closed and drained.
    pub async fn next_batch(&self) -> Option<Vec<Outbound>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(batch) = state.take_batch() {
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`next_batch`](Self::next_batch).
    pub fn try_batch(&self) -> Option<Vec<Outbound>> {
        self.state.lock().take_batch()
    }
}

impl QueueState {
    fn take_batch(&mut self) -> Option<Vec<Outbound>> {
        if self.lines.is_empty() && self.dropped == 0 {
            return None;
        }

        let mut batch = Vec::with_capacity(self.lines.len() + 1);
        if self.dropped > 0 {
            batch.push(Outbound::Status(Message::Gap {
                dropped: std::mem::take(&mut self.dropped),
            }));
        }
        batch.extend(self.lines.drain(..));
        self.records = 0;
        self.statuses = 0;
        Some(batch)
    }
}

/// Write queued lines to `writer` until the queue is closed and drained,
/// then shut the writer down.
///
/// # Errors
///
/// Returns the first I/O error from the socket.
pub async fn run_writer<W>(
    queue: &OutboundQueue,
    writer: W,
    codec: FeedCodec,
) -> Result<u64, io::Error>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LineCodec::default());
    let mut written = 0u64;

    while let Some(batch) = queue.next_batch().await {
        for item in batch {
            let message = item.message();
            if matches!(message, Message::Gap { .. }) {
                metrics::record_gap();
            }
            metrics::record_line_sent(message.name());
            sink.feed(codec.encode(message)).await?;
            written += 1;
        }
        sink.flush().await?;
    }

    sink.close().await?;
    Ok(written)
}
