//! Server Configuration Settings
//!
//! Configuration types for the replay server, loaded from environment
//! variables. Every variable is optional; a variable that is set but
//! cannot be parsed is an error rather than a silent fallback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::application::services::{HeartbeatConfig, SessionSettings};
use crate::domain::replay::{EndOfDataPolicy, Pacer};
use crate::infrastructure::iqfeed::DEFAULT_MAX_LINE_LENGTH;

const ENV_PREFIX: &str = "IQFEED_REPLAY_";

/// Listening socket settings.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Bind address.
    pub host: IpAddr,
    /// Bind port.
    pub port: u16,
    /// Concurrent connection cap (0 = unlimited).
    pub max_connections: usize,
}

impl ListenerSettings {
    /// Socket address to bind.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9999,
            max_connections: 0,
        }
    }
}

/// Replay pacing and data source settings.
#[derive(Debug, Clone)]
pub struct ReplaySettings {
    /// Replay speed multiplier (0 freezes replay).
    pub speed: f64,
    /// What happens when a subscription runs out of records.
    pub on_end: EndOfDataPolicy,
    /// Directory of per-symbol CSV files.
    pub data_dir: PathBuf,
}

impl ReplaySettings {
    /// Build the pacer for these settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the speed is negative or not finite.
    pub fn pacer(&self) -> Result<Pacer, ConfigError> {
        Pacer::new(self.speed, self.on_end).map_err(|e| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}SPEED"),
            value: self.speed.to_string(),
            reason: e.to_string(),
        })
    }
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            speed: 1.0,
            on_end: EndOfDataPolicy::default(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Per-connection I/O settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Outbound queue capacity in lines.
    pub queue_capacity: usize,
    /// Maximum inbound line length in bytes.
    pub max_line_length: usize,
    /// Upper bound on how long a session sleeps between replay ticks.
    pub poll_interval: Duration,
    /// How long a draining session may spend flushing.
    pub drain_timeout: Duration,
    /// Session behavior.
    pub session: SessionSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            poll_interval: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(5),
            session: SessionSettings::default(),
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening socket.
    pub listener: ListenerSettings,
    /// Replay pacing and data.
    pub replay: ReplaySettings,
    /// Per-connection settings.
    pub connection: ConnectionSettings,
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listener: ListenerSettings::default(),
            replay: ReplaySettings::default(),
            connection: ConnectionSettings::default(),
            health_port: 8082,
        }
    }
}

impl ServerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// Keys are prefixed with `IQFEED_REPLAY_`:
    ///
    /// - `HOST`, `PORT`, `MAX_CONNECTIONS`, `HEALTH_PORT`
    /// - `DATA_DIR`, `SPEED`, `ON_END`
    /// - `QUEUE_CAPACITY`: outbound lines buffered per client (default: 4096)
    /// - `MAX_LINE_LENGTH`: longest accepted command in bytes (default: 4096)
    /// - `POLL_INTERVAL_MS`: longest sleep between replay ticks (default: 50)
    /// - `DRAIN_TIMEOUT_SECS`: flush budget on disconnect (default: 5)
    /// - `KEEPALIVE_SECS`: quiet time before a keepalive, 0 = off (default: 5)
    /// - `TIMESTAMP_INTERVAL_MS`: `T` line spacing once enabled (default: 1000)
    /// - `STORE_RETRY_MS`: retry delay after a store failure (default: 1000)
    /// - `BATCH_LIMIT`: records emitted per tick (default: 1024)
    /// - `MAX_MALFORMED`: malformed lines before disconnect, 0 = never (default: 10)
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();
        let connection_defaults = defaults.connection;
        let session_defaults = connection_defaults.session;
        let heartbeat_defaults = session_defaults.heartbeat;

        let listener = ListenerSettings {
            host: env.parse("HOST", defaults.listener.host)?,
            port: env.parse("PORT", defaults.listener.port)?,
            max_connections: env.parse("MAX_CONNECTIONS", defaults.listener.max_connections)?,
        };

        let on_end = match env.get("ON_END") {
            None => defaults.replay.on_end,
            Some(raw) => EndOfDataPolicy::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: env.key("ON_END"),
                value: raw.clone(),
                reason: "expected `loop` or `hold`".to_string(),
            })?,
        };

        let replay = ReplaySettings {
            speed: env.parse("SPEED", defaults.replay.speed)?,
            on_end,
            data_dir: env
                .get("DATA_DIR")
                .map_or(defaults.replay.data_dir, PathBuf::from),
        };
        replay.pacer()?;

        let heartbeat = HeartbeatConfig {
            keepalive_interval: env
                .duration_secs("KEEPALIVE_SECS", heartbeat_defaults.keepalive_interval)?,
            timestamp_interval: env.duration_millis(
                "TIMESTAMP_INTERVAL_MS",
                heartbeat_defaults.timestamp_interval,
            )?,
        };

        let session = SessionSettings {
            heartbeat,
            store_retry_interval: env
                .duration_millis("STORE_RETRY_MS", session_defaults.store_retry_interval)?,
            batch_limit: env.parse("BATCH_LIMIT", session_defaults.batch_limit)?,
            max_malformed: env.parse("MAX_MALFORMED", session_defaults.max_malformed)?,
        };

        let connection = ConnectionSettings {
            queue_capacity: env.parse("QUEUE_CAPACITY", connection_defaults.queue_capacity)?,
            max_line_length: env.parse("MAX_LINE_LENGTH", connection_defaults.max_line_length)?,
            poll_interval: env
                .duration_millis("POLL_INTERVAL_MS", connection_defaults.poll_interval)?,
            drain_timeout: env
                .duration_secs("DRAIN_TIMEOUT_SECS", connection_defaults.drain_timeout)?,
            session,
        };

        for (name, value) in [
            ("QUEUE_CAPACITY", connection.queue_capacity),
            ("MAX_LINE_LENGTH", connection.max_line_length),
            ("BATCH_LIMIT", session.batch_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: env.key(name),
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        Ok(Self {
            listener,
            replay,
            connection,
            health_port: env.parse("HEALTH_PORT", defaults.health_port)?,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable is set to an unusable value.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn key(&self, name: &str) -> String {
        format!("{ENV_PREFIX}{name}")
    }

    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&self.key(name))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name).map_or(Ok(default), |raw| {
            raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: self.key(name),
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
    }

    fn duration_secs(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }

    fn duration_millis(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_millis = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(name, default_millis).map(Duration::from_millis)
    }
}
