//! Pacer
//!
//! Translates wall time elapsed since a subscription's origin into a
//! position within its record sequence.
//!
//! # Algorithm
//!
//! For elapsed wall time `e` and speed multiplier `m`, a record is due
//! once `(timestamp - anchor) <= e * m`. The anchor starts at the first
//! record's timestamp and only moves when a watch is refreshed or a loop
//! lap begins. Speed `0` freezes replay at the origin.
//!
//! `due` is lazy: it walks forward from the cursor and stops at the first
//! record that is not yet due, so nothing beyond the next record is ever
//! looked at.

use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, TimeDelta};

use crate::domain::market_data::Record;
use crate::domain::subscription::Subscription;

// =============================================================================
// End-of-data Policy
// =============================================================================

/// What happens when replay passes the last record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndOfDataPolicy {
    /// Start over from the first record, continuing in time order.
    Loop,
    /// Stop and report end of data once.
    #[default]
    Hold,
}

impl EndOfDataPolicy {
    /// Parse a policy name, ignoring case.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "loop" => Some(Self::Loop),
            "hold" => Some(Self::Hold),
            _ => None,
        }
    }

    /// Get the policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Loop => "loop",
            Self::Hold => "hold",
        }
    }
}

/// Pacer construction error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PacerError {
    /// Speed was negative, NaN or infinite.
    #[error("replay speed must be finite and non-negative, got {0}")]
    InvalidSpeed(f64),
}

// =============================================================================
// Pacer
// =============================================================================

/// Replay pacing shared by every subscription on a server.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    speed: f64,
    on_end: EndOfDataPolicy,
}

impl Pacer {
    /// Create a pacer.
    ///
    /// # Errors
    ///
    /// Returns `PacerError::InvalidSpeed` unless `speed` is finite and `>= 0`.
    pub fn new(speed: f64, on_end: EndOfDataPolicy) -> Result<Self, PacerError> {
        if !speed.is_finite() || speed < 0.0 {
            return Err(PacerError::InvalidSpeed(speed));
        }
        Ok(Self { speed, on_end })
    }

    /// Speed multiplier.
    #[must_use]
    pub const fn speed(&self) -> f64 {
        self.speed
    }

    /// End-of-data policy.
    #[must_use]
    pub const fn on_end(&self) -> EndOfDataPolicy {
        self.on_end
    }

    /// Virtual (source) time elapsed between `origin` and `now`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn virtual_elapsed(&self, origin: Instant, now: Instant) -> TimeDelta {
        let wall = now.saturating_duration_since(origin);
        let nanos = (wall.as_nanos() as f64 * self.speed).floor();
        if nanos >= i64::MAX as f64 {
            TimeDelta::MAX
        } else {
            TimeDelta::nanoseconds(nanos as i64)
        }
    }

    /// Source timestamp a subscription has replayed up to at `now`.
    #[must_use]
    pub fn position(&self, subscription: &Subscription, now: Instant) -> NaiveDateTime {
        let elapsed = self.virtual_elapsed(subscription.origin(), now);
        subscription
            .anchor()
            .checked_add_signed(elapsed)
            .unwrap_or(NaiveDateTime::MAX)
    }

    /// Reset a subscription's origin to `now` without redelivering or
    /// skipping records.
    ///
    /// The current replay position becomes the new anchor, so records that
    /// were already due stay due and delivered ones stay delivered.
    pub fn restart(&self, subscription: &mut Subscription, now: Instant) {
        let position = self.position(subscription, now);
        subscription.restart(now, position);
    }

    /// Records due for delivery at `now`, advancing the cursor as they are
    /// pulled.
    pub fn due<'a>(&self, subscription: &'a mut Subscription, now: Instant) -> Due<'a> {
        let elapsed = self.virtual_elapsed(subscription.origin(), now);
        Due {
            subscription,
            elapsed,
            on_end: self.end_action(),
        }
    }

    /// Wall instant at which the next record becomes due.
    ///
    /// Returns `None` when nothing will ever become due without a restart:
    /// no data, held at the end, or frozen at speed `0`.
    #[must_use]
    pub fn next_due_at(&self, subscription: &Subscription) -> Option<Instant> {
        let offset = match subscription.peek() {
            Some(record) => record.timestamp - subscription.anchor(),
            None if self.end_action() == EndAction::Wrap => subscription.next_lap_offset()?,
            None => return None,
        };
        self.instant_for(subscription.origin(), offset)
    }

    /// Wall instant at which a record of `subscription` stamped `timestamp`
    /// becomes due. Records due at or before the origin map to the origin.
    #[must_use]
    pub fn due_instant(&self, subscription: &Subscription, timestamp: NaiveDateTime) -> Instant {
        self.instant_for(subscription.origin(), timestamp - subscription.anchor())
            .unwrap_or_else(|| subscription.origin())
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn instant_for(&self, origin: Instant, offset: TimeDelta) -> Option<Instant> {
        if offset <= TimeDelta::zero() {
            return Some(origin);
        }
        if self.speed <= 0.0 {
            return None;
        }
        let offset_nanos = offset.num_nanoseconds()? as f64;
        // One extra nanosecond absorbs float rounding in `virtual_elapsed`.
        let wall_nanos = (offset_nanos / self.speed).ceil() + 1.0;
        if wall_nanos >= u64::MAX as f64 {
            return None;
        }
        origin.checked_add(Duration::from_nanos(wall_nanos as u64))
    }

    fn end_action(&self) -> EndAction {
        match self.on_end {
            EndOfDataPolicy::Hold => EndAction::Report,
            EndOfDataPolicy::Loop if self.speed > 0.0 => EndAction::Wrap,
            EndOfDataPolicy::Loop => EndAction::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndAction {
    Report,
    Wrap,
    Stop,
}

// =============================================================================
// Due Iterator
// =============================================================================

/// Lazy sequence of due records for one subscription.
///
/// Each yielded record has already been consumed from the subscription's
/// cursor; dropping the iterator early leaves the rest for the next call.
#[derive(Debug)]
pub struct Due<'a> {
    subscription: &'a mut Subscription,
    elapsed: TimeDelta,
    on_end: EndAction,
}

impl Due<'_> {
    /// The next due record, without consuming it.
    pub fn peek(&mut self) -> Option<&Record> {
        if self.head_is_due() {
            self.subscription.peek()
        } else {
            None
        }
    }

    fn head_is_due(&mut self) -> bool {
        loop {
            if let Some(record) = self.subscription.peek() {
                return record.timestamp - self.subscription.anchor() <= self.elapsed;
            }

            if !self.subscription.has_data() {
                return false;
            }

            match self.on_end {
                EndAction::Report => {
                    self.subscription.mark_end_of_data();
                    return false;
                }
                EndAction::Wrap => self.subscription.wrap(),
                EndAction::Stop => return false,
            }
        }
    }
}

impl Iterator for Due<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.head_is_due() {
            self.subscription.advance()
        } else {
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
