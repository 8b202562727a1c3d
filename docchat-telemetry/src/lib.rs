//! Telemetry for docchat.
//!
//! - [`init_telemetry`] installs the global `tracing` subscriber: an `EnvFilter`
//!   driven by `RUST_LOG`, a text or JSON formatter, an optional OTLP exporter
//!   and an optional [`TurnTraceLayer`].
//! - [`TurnTraceStore`] keeps the spans of recent chat turns so the chat UI can
//!   show where the time of each answer went.

mod memory;

pub use memory::{
    DEFAULT_CAPACITY, SESSION_ID, SpanRecord, SpanStatus, TURN_ID, TurnTrace, TurnTraceLayer,
    TurnTraceStore,
};

use std::str::FromStr;
use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    #[error("failed to start OTLP exporter: {0}")]
    Otlp(#[from] opentelemetry::trace::TraceError),

    #[error("failed to install tracing subscriber: {0}")]
    Install(String),

    #[error("unknown log format '{0}', expected 'text' or 'json'")]
    Format(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(TelemetryError::Format(other.to_string())),
        }
    }
}

/// What [`init_telemetry`] installs.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub otlp_endpoint: Option<String>,
    pub turn_traces: Option<Arc<TurnTraceStore>>,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_format: LogFormat::default(),
            default_filter: "info".to_string(),
            otlp_endpoint: None,
            turn_traces: None,
        }
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    /// A blank endpoint leaves OTLP export off.
    pub fn with_otlp_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.otlp_endpoint = endpoint.filter(|e| !e.trim().is_empty());
        self
    }

    pub fn with_turn_traces(mut self, store: Arc<TurnTraceStore>) -> Self {
        self.turn_traces = Some(store);
        self
    }
}

/// Installs the global subscriber described by `config`.
///
/// Log lines go to stderr, leaving stdout to command output.
///
/// The `RUST_LOG` filter applies to the log output and the OTLP exporter. Turn
/// traces see every INFO span so a quiet log level does not blank the chat
/// UI's trace view.
///
/// OTLP export uses a batch processor on the Tokio runtime, so call this from
/// inside one when an endpoint is configured.
///
/// # Errors
///
/// Fails on an unparsable filter, when the exporter cannot be built, or when a
/// global subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let (text_layer, json_layer) = match config.log_format {
        LogFormat::Text => (Some(fmt::layer().with_target(true).with_writer(std::io::stderr)), None),
        LogFormat::Json => {
            (None, Some(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr)))
        }
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = otlp_tracer(endpoint, &config.service_name)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let turn_layer = config
        .turn_traces
        .clone()
        .map(|store| TurnTraceLayer::new(store).with_filter(LevelFilter::INFO));

    tracing_subscriber::registry()
        .with(turn_layer)
        .with(text_layer.with_filter(env_filter(&config.default_filter)?))
        .with(json_layer.with_filter(env_filter(&config.default_filter)?))
        .with(otel_layer.with_filter(env_filter(&config.default_filter)?))
        .try_init()
        .map_err(|e| TelemetryError::Install(e.to_string()))?;

    if let Some(endpoint) = &config.otlp_endpoint {
        tracing::info!(endpoint = %endpoint, service = %config.service_name, "OTLP trace export enabled");
    }
    Ok(())
}

/// Flushes pending OTLP spans. A no-op when export is off.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

fn env_filter(default: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .map_err(|e| TelemetryError::Filter(e.to_string()))
}

fn otlp_tracer(
    endpoint: &str,
    service_name: &str,
) -> Result<opentelemetry_sdk::trace::Tracer, TelemetryError> {
    let resource = opentelemetry_sdk::Resource::new(vec![KeyValue::new(
        "service.name",
        service_name.to_string(),
    )]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
        .with_trace_config(opentelemetry_sdk::trace::Config::default().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;
    Ok(tracer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(" text ".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!(matches!("xml".parse::<LogFormat>(), Err(TelemetryError::Format(f)) if f == "xml"));
    }

    #[test]
    fn blank_otlp_endpoint_is_ignored() {
        let config = TelemetryConfig::new("docchat").with_otlp_endpoint(Some("  ".into()));
        assert!(config.otlp_endpoint.is_none());

        let config = config.with_otlp_endpoint(Some("http://localhost:4317".into()));
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://localhost:4317"));
    }
}
