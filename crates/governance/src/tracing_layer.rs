//! Distributed tracing configuration.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
use workspace_sandbox_core::{Error, Result};

/// Configure stdout logging, plus OpenTelemetry export when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn configure_tracing(json: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,workspace_sandbox=debug".into()),
    );

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter);

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint.clone()),
            )
            .with_trace_config(
                sdktrace::config().with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    "sandboxd",
                )])),
            )
            .install_batch(runtime::Tokio)
            .map_err(|e| Error::Config(format!("Failed to install OTLP pipeline: {}", e)))?;

        let tracer = provider.tracer("sandboxd");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        registry
            .with(otel_layer)
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {}", e)))?;
        tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled");
    } else {
        registry
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {}", e)))?;
    }

    Ok(())
}
