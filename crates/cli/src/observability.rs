//! Tracing subscriber and OpenTelemetry wiring.

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace::TracerProvider, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How logs and traces leave the process.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP gRPC endpoint. Spans are only exported when set.
    pub otel_endpoint: Option<String>,
    /// Used when `RUST_LOG` is not set.
    pub log_level: String,
}

/// Installs the global subscriber: JSON logs on stderr, plus an OTLP span
/// exporter when an endpoint is configured.
///
/// Returns the tracer provider so [`shutdown_telemetry`] can flush it.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<Option<TracerProvider>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let Some(endpoint) = &config.otel_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer())
            .try_init()
            .context("failed to install tracing subscriber")?;
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]))
        .build();

    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer("topic-bridge"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(fmt_layer())
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(Some(provider))
}

/// JSON log layer on stderr. Generic so it can sit on either subscriber stack.
fn fmt_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    // stdout carries trigger contexts; logs go to stderr.
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(std::io::stderr)
}

/// Flushes pending spans.
pub fn shutdown_telemetry(provider: Option<TracerProvider>) {
    if let Some(provider) = provider {
        if let Err(err) = provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {err:?}");
        }
    }
}
