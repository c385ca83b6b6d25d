//! Feed Protocol Adapter
//!
//! Wire-level encoding of the Level 1 feed protocol:
//!
//! - `framing`: latin-1 line transport (`LineCodec`)
//! - `codec`: line text to [`Command`] and [`Message`] to line text (`FeedCodec`)
//!
//! [`Command`]: crate::domain::protocol::Command
//! [`Message`]: crate::domain::protocol::Message

pub mod codec;
pub mod framing;

pub use codec::{FeedCodec, ParseError, UPDATE_FIELDNAMES};
pub use framing::{DEFAULT_MAX_LINE_LENGTH, LineCodec, RawLine};
