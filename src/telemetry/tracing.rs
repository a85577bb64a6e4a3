//! Subscriber setup: env-filtered fmt output plus an optional OTLP exporter.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LogFormat, TelemetryConfig};

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_telemetry(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Exporter failures are reported once the subscriber exists to log them.
    let (tracer, otlp_error) = match otlp_tracer(&config.telemetry) {
        Ok(tracer) => (tracer, None),
        Err(e) => (None, Some(e)),
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t)));

    match config.logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }

    if let Some(e) = otlp_error {
        tracing::warn!(error = %e, "OTLP exporter disabled");
    }
}

/// `Ok(None)` when no collector endpoint is configured.
fn otlp_tracer(
    config: &TelemetryConfig,
) -> Result<Option<sdktrace::Tracer>, opentelemetry::trace::TraceError> {
    let Some(endpoint) = config.otlp_endpoint.as_deref() else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]))
        .build();

    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));
    global::set_tracer_provider(provider);
    Ok(Some(tracer))
}

/// Flushes pending spans.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
