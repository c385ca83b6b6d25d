//! Configuration Module
//!
//! Configuration loading for the replay server.

mod settings;

pub use settings::{
    ConfigError, ConnectionSettings, ListenerSettings, ReplaySettings, ServerConfig,
};
