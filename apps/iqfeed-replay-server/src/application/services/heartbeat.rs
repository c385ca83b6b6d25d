//! Heartbeat Schedule
//!
//! Decides when a connection owes the client a synthetic line: a `T`
//! timestamp while timestamps are switched on, or a `S,SERVER CONNECTED`
//! keepalive once the connection has been quiet for too long.

use std::time::{Duration, Instant};

/// Heartbeat intervals.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Quiet time after which a keepalive is sent (zero disables).
    pub keepalive_interval: Duration,
    /// Interval between `T` timestamp lines (zero disables).
    pub timestamp_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(5),
            timestamp_interval: Duration::from_secs(1),
        }
    }
}

/// A heartbeat line that is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a `T` timestamp line.
    Timestamp,
    /// Send a keepalive status line.
    Keepalive,
}

/// Per-connection heartbeat state.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    timestamps: bool,
    last_output: Instant,
    next_timestamp: Instant,
}

impl Heartbeat {
    /// Create a heartbeat with timestamps switched off.
    #[must_use]
    pub const fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            timestamps: false,
            last_output: now,
            next_timestamp: now,
        }
    }

    /// Whether `T` lines are switched on.
    #[must_use]
    pub const fn timestamps_enabled(&self) -> bool {
        self.timestamps
    }

    /// Switch `T` lines on or off. Switching on sends one immediately.
    pub fn set_timestamps(&mut self, enabled: bool, now: Instant) {
        self.timestamps = enabled;
        self.next_timestamp = now;
    }

    /// Note that a line was written to the client.
    pub fn record_output(&mut self, now: Instant) {
        self.last_output = now;
    }

    /// Collect the heartbeat lines due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<HeartbeatEvent> {
        let mut events = Vec::new();

        if self.timestamp_active() && now >= self.next_timestamp {
            events.push(HeartbeatEvent::Timestamp);
            self.next_timestamp = now + self.config.timestamp_interval;
            self.last_output = now;
        }

        if !self.config.keepalive_interval.is_zero()
            && now.saturating_duration_since(self.last_output) >= self.config.keepalive_interval
        {
            events.push(HeartbeatEvent::Keepalive);
            self.last_output = now;
        }

        events
    }

    /// The next instant at which `poll` will return something.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let timestamp = self.timestamp_active().then_some(self.next_timestamp);
        let keepalive = (!self.config.keepalive_interval.is_zero())
            .then(|| self.last_output + self.config.keepalive_interval);

        match (timestamp, keepalive) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn timestamp_active(&self) -> bool {
        self.timestamps && !self.config.timestamp_interval.is_zero()
    }
}
