//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// IQFeed line protocol: command parsing, message encoding, line framing.
pub mod iqfeed;

/// History store adapters (CSV directory, in-memory).
pub mod store;

/// TCP feed server: listener, per-client connections, outbound queue.
pub mod server;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
