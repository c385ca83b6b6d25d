//! Feed Text Codec
//!
//! Converts client lines into [`Command`]s and [`Message`]s into server
//! lines. Framing (terminators, charset, length limits) is handled by
//! [`super::framing::LineCodec`]; this module only sees one line of text
//! at a time, without its terminator.
//!
//! # Level 1 Field Order
//!
//! ```text
//! Q,<sym>,<last>,<last size>,<last time>,<market center>,<total volume>,
//!   <bid>,<bid size>,<ask>,<ask size>,<open>,<high>,<low>,<close>,
//!   <message contents>,<conditions>,
//! ```

use std::fmt::{Display, Write};

use chrono::{NaiveDate, NaiveDateTime};

use crate::domain::market_data::{QuoteSummary, SummaryChanges, Symbol, SymbolError};
use crate::domain::protocol::{BarWatch, Command, Level1Kind, Message};

/// Field names reported for `S,REQUEST CURRENT UPDATE FIELDNAMES`.
pub const UPDATE_FIELDNAMES: [&str; 16] = [
    "Symbol",
    "Most Recent Trade",
    "Most Recent Trade Size",
    "Most Recent Trade Time",
    "Most Recent Trade Market Center",
    "Total Volume",
    "Bid",
    "Bid Size",
    "Ask",
    "Ask Size",
    "Open",
    "High",
    "Low",
    "Close",
    "Message Contents",
    "Most Recent Trade Conditions",
];

/// System verbs that are recognized but not emulated.
const UNSUPPORTED_VERBS: [&str; 9] = [
    "SELECT UPDATE FIELDS",
    "SET CLIENT NAME",
    "NEWSON",
    "NEWSOFF",
    "REQUEST STATS",
    "REQUEST FUNDAMENTAL FIELDNAMES",
    "REQUEST ALL UPDATE FIELDNAMES",
    "REQUEST EXCHANGES",
    "SET LOGLEVELS",
];

const BAR_BEGIN_FORMAT: &str = "%Y%m%d %H%M%S";
const BAR_BEGIN_DATE_FORMAT: &str = "%Y%m%d";
const BAR_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TRADE_TIME_FORMAT: &str = "%H:%M:%S%.6f";
const TIMESTAMP_FORMAT: &str = "%Y%m%d %H:%M:%S";

// Field positions after the `BW` verb.
const BW_SYMBOL: usize = 0;
const BW_INTERVAL: usize = 1;
const BW_BEGIN: usize = 2;
const BW_REQUEST_ID: usize = 7;

/// Client line parse errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The line was empty.
    #[error("empty line")]
    Empty,

    /// The line did not start with a known verb.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A required argument was absent.
    #[error("{command} requires {argument}")]
    MissingArgument {
        /// Command name.
        command: &'static str,
        /// Missing argument name.
        argument: &'static str,
    },

    /// An argument could not be parsed.
    #[error("invalid {argument}: {value}")]
    InvalidArgument {
        /// Argument name.
        argument: &'static str,
        /// Raw value.
        value: String,
    },

    /// The symbol was malformed.
    #[error(transparent)]
    InvalidSymbol(#[from] SymbolError),

    /// The line exceeded the maximum length and was discarded.
    #[error("line exceeds {limit} bytes")]
    LineTooLong {
        /// Configured maximum line length.
        limit: usize,
    },
}

/// Line codec for the Level 1 feed protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedCodec;

impl FeedCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Parse one client line (without terminator).
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if the line is empty, uses an unknown verb, or
    /// carries a missing or malformed argument.
    pub fn decode(&self, line: &str) -> Result<Command, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let (head, rest) = line.split_once(',').unwrap_or((line, ""));
        match head.trim().to_ascii_uppercase().as_str() {
            "S" => Self::decode_system(rest),
            "BW" => Self::decode_bar_watch(rest),
            "BR" => Ok(Command::Unwatch(Symbol::parse(first_field(rest))?)),
            _ => Self::decode_shorthand(line),
        }
    }

    fn decode_system(rest: &str) -> Result<Command, ParseError> {
        let mut fields = rest.split(',');
        let verb = fields
            .next()
            .map(|v| v.trim().to_ascii_uppercase())
            .unwrap_or_default();
        let arg = fields.next().map(str::trim).unwrap_or_default();

        let command = match verb.as_str() {
            "CONNECT" => Command::Connect,
            "DISCONNECT" => Command::Disconnect,
            "SET PROTOCOL" => {
                if arg.is_empty() {
                    return Err(ParseError::MissingArgument {
                        command: "SET PROTOCOL",
                        argument: "version",
                    });
                }
                Command::SetProtocol(arg.to_string())
            }
            "WATCH" => Command::Watch(Symbol::parse(arg)?),
            "UNWATCH" if arg.eq_ignore_ascii_case("ALL") => Command::UnwatchAll,
            "UNWATCH" => Command::Unwatch(Symbol::parse(arg)?),
            "UNWATCH ALL" => Command::UnwatchAll,
            "REQUEST" => Command::Snapshot(Symbol::parse(arg)?),
            "REQUEST WATCHES" => Command::RequestWatches,
            "TIMESTAMPSON" => Command::Timestamps(true),
            "TIMESTAMPSOFF" => Command::Timestamps(false),
            "REQUEST CURRENT UPDATE FIELDNAMES" => Command::RequestUpdateFieldnames,
            v if UNSUPPORTED_VERBS.contains(&v) => Command::Unsupported(v.to_string()),
            "" => {
                return Err(ParseError::MissingArgument {
                    command: "S",
                    argument: "verb",
                });
            }
            _ => return Err(ParseError::UnknownCommand(format!("S,{verb}"))),
        };

        Ok(command)
    }

    fn decode_bar_watch(rest: &str) -> Result<Command, ParseError> {
        let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
        let field = |i: usize| fields.get(i).copied().unwrap_or_default();

        let symbol = Symbol::parse(field(BW_SYMBOL))?;

        let interval = field(BW_INTERVAL);
        if interval.is_empty() {
            return Err(ParseError::MissingArgument {
                command: "BW",
                argument: "interval",
            });
        }
        let interval_secs = interval
            .parse::<u32>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| ParseError::InvalidArgument {
                argument: "interval",
                value: interval.to_string(),
            })?;

        let begin = match field(BW_BEGIN) {
            "" => None,
            raw => Some(parse_bar_begin(raw)?),
        };

        let request_id = match field(BW_REQUEST_ID) {
            "" => BarWatch::default_request_id(&symbol, interval_secs),
            id => id.to_string(),
        };

        Ok(Command::WatchBars(BarWatch {
            symbol,
            interval_secs,
            begin,
            request_id,
        }))
    }

    /// Single-letter forms: `w`/`t` watch, `r` unwatch, `f` snapshot.
    fn decode_shorthand(line: &str) -> Result<Command, ParseError> {
        let mut chars = line.chars();
        let prefix = chars.next();
        let symbol = chars.as_str();

        match prefix {
            Some('w' | 't') => Ok(Command::Watch(Symbol::parse(symbol)?)),
            Some('r') => Ok(Command::Unwatch(Symbol::parse(symbol)?)),
            Some('f') => Ok(Command::Snapshot(Symbol::parse(symbol)?)),
            _ => Err(ParseError::UnknownCommand(first_field(line).to_string())),
        }
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Render a message as one line (without terminator).
    #[must_use]
    pub fn encode(&self, message: &Message) -> String {
        match message {
            Message::ServerConnected => "S,SERVER CONNECTED".to_string(),
            Message::CurrentProtocol(version) => format!("S,CURRENT PROTOCOL,{version}"),
            Message::Watches(symbols) => {
                let mut line = String::from("S,WATCHES");
                for symbol in symbols {
                    line.push(',');
                    line.push_str(symbol.as_str());
                }
                line
            }
            Message::UpdateFieldnames => {
                format!("S,CURRENT UPDATE FIELDNAMES,{}", UPDATE_FIELDNAMES.join(","))
            }
            Message::Unsupported(verb) => format!("S,UNSUPPORTED,{verb}"),
            Message::NotFound(symbol) => format!("n,{symbol}"),
            Message::EndOfData(symbol) => format!("S,END OF DATA,{symbol}"),
            Message::Gap { dropped } => format!("S,GAP,{dropped}"),
            Message::ServerBusy => "S,SERVER BUSY".to_string(),
            Message::StoreUnavailable(symbol) => format!("E,STORE UNAVAILABLE,{symbol}"),
            Message::ProtocolError(detail) => {
                format!("E,!SYNTAX_ERROR!,{}", single_field(detail))
            }
            Message::TooManyErrors => "E,!TOO MANY ERRORS!".to_string(),
            Message::Timestamp(at) => format!("T,{}", at.format(TIMESTAMP_FORMAT)),
            Message::Level1 {
                kind,
                symbol,
                summary,
                changes,
            } => encode_level1(*kind, symbol, summary, *changes),
            Message::Bar {
                request_id,
                symbol,
                timestamp,
                bar,
            } => format!(
                "{request_id},BC,{symbol},{},{},{},{},{},{},{},{}",
                timestamp.format(BAR_TIME_FORMAT),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.total_volume,
                bar.period_volume,
                bar.num_trades,
            ),
        }
    }
}

/// Free text made safe for one comma-delimited field.
fn single_field(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            ',' => ';',
            '\r' | '\n' => ' ',
            other => other,
        })
        .collect()
}

fn first_field(s: &str) -> &str {
    s.split(',').next().unwrap_or_default().trim()
}

fn parse_bar_begin(raw: &str) -> Result<NaiveDateTime, ParseError> {
    NaiveDateTime::parse_from_str(raw, BAR_BEGIN_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, BAR_BEGIN_DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| ParseError::InvalidArgument {
            argument: "begin time",
            value: raw.to_string(),
        })
}

fn encode_level1(
    kind: Level1Kind,
    symbol: &Symbol,
    summary: &QuoteSummary,
    changes: SummaryChanges,
) -> String {
    let type_letter = match kind {
        Level1Kind::Summary => 'P',
        Level1Kind::Update => 'Q',
    };

    let mut line = String::with_capacity(128);
    line.push(type_letter);
    line.push(',');
    line.push_str(symbol.as_str());
    line.push(',');

    push_opt(&mut line, summary.last);
    push_opt(&mut line, summary.last_size);
    push_opt(
        &mut line,
        summary.last_time.map(|t| t.format(TRADE_TIME_FORMAT)),
    );
    push_opt(&mut line, summary.market_center);
    push_opt(&mut line, Some(summary.total_volume));
    push_opt(&mut line, summary.bid);
    push_opt(&mut line, summary.bid_size);
    push_opt(&mut line, summary.ask);
    push_opt(&mut line, summary.ask_size);
    push_opt(&mut line, summary.open);
    push_opt(&mut line, summary.high);
    push_opt(&mut line, summary.low);
    // Prior session close is not part of the recording.
    line.push(',');
    if kind == Level1Kind::Update {
        line.push_str(&message_contents(changes));
    }
    line.push(',');
    push_opt(&mut line, summary.conditions.as_deref());

    line
}

fn push_opt<T: Display>(line: &mut String, value: Option<T>) {
    if let Some(value) = value {
        let _ = write!(line, "{value}");
    }
    line.push(',');
}

fn message_contents(changes: SummaryChanges) -> String {
    [
        (changes.trade, 'C'),
        (changes.open, 'o'),
        (changes.high, 'h'),
        (changes.low, 'l'),
        (changes.volume, 'v'),
        (changes.bid, 'b'),
        (changes.ask, 'a'),
    ]
    .into_iter()
    .filter_map(|(changed, letter)| changed.then_some(letter))
    .collect()
}
