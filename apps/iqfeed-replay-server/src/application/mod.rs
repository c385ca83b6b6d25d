//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the per-connection replay session and the port
//! interfaces through which it reaches recorded data.

/// Port interfaces for external systems (history store).
pub mod ports;

/// Application services for session replay and heartbeats.
pub mod services;
