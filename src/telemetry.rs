//! Logging, metrics export and span export for probe-dns.
//!
//! `RUST_LOG` takes precedence over the configured log level. The Prometheus
//! listener needs the `prometheus` feature and OTLP export the `otel` feature.

#[cfg(any(feature = "prometheus", feature = "otel"))]
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;
use crate::error::ProbeError;

#[cfg(feature = "otel")]
static TRACER_PROVIDER: std::sync::OnceLock<opentelemetry_sdk::trace::SdkTracerProvider> =
    std::sync::OnceLock::new();

/// Install the global subscriber and, when configured, the metrics and span exporters.
///
/// Must be called once, before any actor or controller is built.
pub fn init(config: &TelemetryConfig) -> Result<(), ProbeError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| ProbeError::Config(format!("telemetry.log_level: {e}")))?;

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true));

    #[cfg(feature = "otel")]
    let registry = registry.with(span_export_layer(config)?);

    registry
        .try_init()
        .map_err(|e| ProbeError::Config(format!("tracing subscriber: {e}")))?;

    #[cfg(feature = "otel")]
    if let Some(otel) = &config.opentelemetry {
        info!(endpoint = %otel.endpoint, service = %otel.service_name, "exporting spans over OTLP");
    }

    #[cfg(feature = "prometheus")]
    if let Some(addr) = config.prometheus_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| ProbeError::Config(format!("telemetry.prometheus_addr: {e}")))?;
        info!(%addr, "serving Prometheus metrics");
    }

    Ok(())
}

/// OTLP layer, absent when no endpoint is configured.
#[cfg(feature = "otel")]
fn span_export_layer<S>(
    config: &TelemetryConfig,
) -> Result<Option<impl tracing_subscriber::Layer<S>>, ProbeError>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    use opentelemetry::trace::TracerProvider;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};

    let Some(otel) = &config.opentelemetry else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otel.endpoint)
        .build()
        .map_err(|e| ProbeError::Config(format!("telemetry.opentelemetry: {e}")))?;

    let resource = opentelemetry_sdk::Resource::builder()
        .with_attributes([
            KeyValue::new(SERVICE_NAME, otel.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();
    let tracer = provider.tracer("probe-dns");
    let _ = TRACER_PROVIDER.set(provider);

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Flush pending spans. Safe to call when span export is disabled.
pub fn shutdown() {
    #[cfg(feature = "otel")]
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "failed to flush span exporter");
        }
    }
}
