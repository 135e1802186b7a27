//! Provides helper functions for initializing telemetry collection and publication.
use anyhow::Result;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Registry};

/// Initialize tracing for the process.
///
/// Log output always goes to stdout, filtered by `RUST_LOG`.
/// When an OTLP endpoint is provided spans are additionally exported to it.
pub async fn init_tracing(otlp_endpoint: Option<String>) -> Result<()> {
    // Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let logger = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .compact()
        .with_filter(log_filter);
    let collector = Registry::default().with(logger);

    if let Some(otlp_endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint),
            )
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                opentelemetry::KeyValue::new(
                    "hostname",
                    gethostname::gethostname()
                        .into_string()
                        .expect("hostname should be valid utf-8"),
                ),
                opentelemetry::KeyValue::new("service.name", "quarry"),
            ])))
            .install_batch(runtime::Tokio)?;

        let otlp_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env()?;
        let telemetry = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(otlp_filter);

        tracing::subscriber::set_global_default(collector.with(telemetry))?;
    } else {
        tracing::subscriber::set_global_default(collector)?;
    }
    Ok(())
}

/// Flush any pending spans before the process exits.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
