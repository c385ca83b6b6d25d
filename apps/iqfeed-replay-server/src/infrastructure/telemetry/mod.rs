//! Logging and Tracing
//!
//! Installs the process `tracing` subscriber: a console layer in the
//! format the operator picks, plus an optional OTLP span exporter.
//!
//! Every client connection runs inside a `session` span carrying
//! `session_id` and `peer`, so all console lines for one client share
//! those fields. With span events on, the close of each `session` span
//! is logged with its busy/idle time, which is the quickest way to see
//! how long replay clients stayed connected.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Filter directives (default: `iqfeed_replay_server=info,axum=warn,hyper=warn`)
//! - `IQFEED_REPLAY_LOG_FORMAT`: `full` | `compact` | `json` (default: full)
//! - `IQFEED_REPLAY_LOG_SPANS`: Log span close events (default: false)
//! - `OTEL_ENABLED`: Set to "true" to export spans (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4318)
//! - `OTEL_SERVICE_NAME`: Service name for traces (default: iqfeed-replay-server)

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Service name for OpenTelemetry traces.
const DEFAULT_SERVICE_NAME: &str = "iqfeed-replay-server";

/// Default OTLP endpoint.
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";

/// Filter used when `RUST_LOG` is unset or invalid.
const DEFAULT_FILTER: &str = "iqfeed_replay_server=info,axum=warn,hyper=warn";

/// Console log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-field lines with span context.
    #[default]
    Full,
    /// One short line per event.
    Compact,
    /// Newline-delimited JSON for log collectors.
    Json,
}

impl LogFormat {
    /// Parse a format name, ignoring case.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" => Some(Self::Full),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Guard that shuts down OpenTelemetry when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown OpenTelemetry tracer provider: {e}");
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Console format.
    pub format: LogFormat,
    /// Log span close events (session lifetimes).
    pub span_events: bool,
    /// Whether OTLP export is enabled.
    pub otlp_enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// Service name for traces.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            span_events: false,
            otlp_enabled: false,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup. Unrecognized
    /// values fall back to the defaults, since logging is not up yet to
    /// report them.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| {
            lookup(key).is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1"))
        };
        let defaults = Self::default();

        Self {
            format: lookup("IQFEED_REPLAY_LOG_FORMAT")
                .and_then(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.format),
            span_events: flag("IQFEED_REPLAY_LOG_SPANS"),
            otlp_enabled: flag("OTEL_ENABLED"),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.otlp_endpoint),
            service_name: lookup("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
        }
    }
}

/// Initialize telemetry with configuration from the environment.
///
/// Returns a guard that must be kept alive for the duration of the program.
/// When the guard is dropped, OpenTelemetry will be properly shut down.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(&TelemetryConfig::from_env())
}

/// Initialize telemetry with custom configuration.
///
/// If a subscriber is already installed (an embedding application or a
/// test harness), it is left in place and only export is skipped.
#[must_use]
pub fn init_with_config(config: &TelemetryConfig) -> TelemetryGuard {
    let filter = env_filter();
    let tracer_provider = config.otlp_enabled.then(|| tracer_provider(config)).flatten();
    let otel_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(config))
        .with(otel_layer)
        .try_init();

    if let Err(e) = installed {
        eprintln!("Tracing subscriber already installed, keeping it: {e}");
        if let Some(provider) = tracer_provider {
            let _ = provider.shutdown();
        }
        return TelemetryGuard {
            tracer_provider: None,
        };
    }

    tracing::debug!(
        format = ?config.format,
        span_events = config.span_events,
        otlp = config.otlp_enabled,
        "Telemetry initialized"
    );

    TelemetryGuard { tracer_provider }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn console_layer<S>(config: &TelemetryConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_span_events(span_events);

    match config.format {
        LogFormat::Full => layer.boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}

/// Build the OTLP pipeline, or `None` (console only) if the exporter
/// cannot be created.
fn tracer_provider(config: &TelemetryConfig) -> Option<SdkTracerProvider> {
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("OTLP export disabled, exporter failed to build: {e}");
            return None;
        }
    };

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn config(vars: &[(&str, &str)]) -> TelemetryConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        TelemetryConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_console_only() {
        let config = config(&[]);
        assert_eq!(config.format, LogFormat::Full);
        assert!(!config.span_events);
        assert!(!config.otlp_enabled);
        assert_eq!(config.otlp_endpoint, DEFAULT_OTLP_ENDPOINT);
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
    }

    #[test_case("json", Some(LogFormat::Json) ; "json")]
    #[test_case(" Compact ", Some(LogFormat::Compact) ; "compact trimmed")]
    #[test_case("FULL", Some(LogFormat::Full) ; "full uppercase")]
    #[test_case("pretty", None ; "unknown")]
    fn parses_log_format(raw: &str, expected: Option<LogFormat>) {
        assert_eq!(LogFormat::parse(raw), expected);
    }

    #[test]
    fn unknown_format_falls_back() {
        assert_eq!(config(&[("IQFEED_REPLAY_LOG_FORMAT", "xml")]).format, LogFormat::Full);
    }

    #[test]
    fn reads_flags_and_export_settings() {
        let config = config(&[
            ("IQFEED_REPLAY_LOG_FORMAT", "json"),
            ("IQFEED_REPLAY_LOG_SPANS", "1"),
            ("OTEL_ENABLED", "true"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
            ("OTEL_SERVICE_NAME", "replay-ci"),
        ]);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.span_events);
        assert!(config.otlp_enabled);
        assert_eq!(config.otlp_endpoint, "http://collector:4317");
        assert_eq!(config.service_name, "replay-ci");
    }

    #[test]
    fn default_filter_is_valid() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
