//! Line Framing
//!
//! A `tokio_util` codec for the feed's line transport. Lines end in `\n`
//! (an optional preceding `\r` is stripped) and are ISO-8859-1, so every
//! byte decodes to one `char` and decoding never fails.
//!
//! Over-long lines are skipped up to their terminator and reported as
//! [`RawLine::Oversized`] instead of failing the stream, so a connection
//! survives a bad line.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum inbound line length in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// One inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    /// Decoded line text without its terminator.
    Text(String),
    /// A line longer than the limit was discarded.
    Oversized,
}

/// Latin-1, newline-delimited codec.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl LineCodec {
    /// Create a codec that discards lines longer than `max_length` bytes
    /// (not counting the `\n`).
    #[must_use]
    pub const fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    /// Maximum accepted line length.
    #[must_use]
    pub const fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for LineCodec {
    type Item = RawLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, io::Error> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(RawLine::Oversized));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    return Ok(Some(RawLine::Text(latin1(&line[..end]))));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }

        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(RawLine::Oversized));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let line = buf.split_to(buf.len());
        Ok(Some(RawLine::Text(latin1(&line))))
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(line.len() + 2);
        for c in line.chars() {
            dst.put_u8(u8::try_from(c).unwrap_or(b'?'));
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

fn latin1(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    bytes.iter().copied().map(char::from).collect()
}
