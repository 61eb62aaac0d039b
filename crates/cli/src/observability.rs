//! Tracing subscriber setup.
//!
//! Logs go to stderr, human-readable or JSON, filtered by `RUST_LOG`
//! (default `info`). Built with the `otlp` feature, spans are also exported
//! to an OpenTelemetry collector when the profile names an endpoint.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[cfg(feature = "otlp")]
use opentelemetry_sdk::trace::SdkTracerProvider;

const DEFAULT_FILTER: &str = "info";

/// Keeps the exporter alive; call [`TelemetryGuard::shutdown`] before exit so
/// buffered spans are flushed.
#[must_use]
pub struct TelemetryGuard {
    #[cfg(feature = "otlp")]
    tracer_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    #[cfg(feature = "otlp")]
    pub fn shutdown(self) {
        let Some(provider) = self.tracer_provider else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            eprintln!("failed to flush OpenTelemetry spans: {err}");
        }
    }

    #[cfg(not(feature = "otlp"))]
    pub fn shutdown(self) {}
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a subscriber is already installed or the OTLP exporter cannot be
/// built.
pub fn init(log_json: bool, otlp_endpoint: Option<&str>) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let output = if log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };
    let registry = tracing_subscriber::registry().with(filter).with(output);

    #[cfg(feature = "otlp")]
    let tracer_provider = otlp_endpoint.map(otlp_tracer_provider).transpose()?;
    #[cfg(feature = "otlp")]
    let registry = {
        use opentelemetry::trace::TracerProvider as _;

        registry.with(tracer_provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer("provision-repos"))
        }))
    };

    registry
        .try_init()
        .context("failed to install tracing subscriber")?;

    #[cfg(not(feature = "otlp"))]
    if let Some(endpoint) = otlp_endpoint {
        tracing::warn!(
            endpoint,
            "OTLP endpoint configured but this build lacks the `otlp` feature; spans are not exported"
        );
    }

    Ok(TelemetryGuard {
        #[cfg(feature = "otlp")]
        tracer_provider,
    })
}

#[cfg(feature = "otlp")]
fn otlp_tracer_provider(endpoint: &str) -> Result<SdkTracerProvider> {
    use opentelemetry_otlp::WithExportConfig;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .with_context(|| format!("failed to build OTLP exporter for {endpoint}"))?;
    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name("provision-repos")
        .build();
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider)
}
