//! Clock & Pacer
//!
//! Time sources and the pacing rules that decide which recorded records
//! are "live" at a given moment.

mod clock;
mod pacer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use pacer::{Due, EndOfDataPolicy, Pacer, PacerError};
