//! Process-wide tracing for the `stepwise` binary: an `EnvFilter`-gated fmt
//! layer on stderr, plus span export through OpenTelemetry when enabled.
//!
//! # Usage
//!
//! ```no_run
//! // Structured logging to stderr, `warn` unless RUST_LOG says otherwise
//! stepwise_observe::tracing_setup::init_tracing(false, "warn").unwrap();
//!
//! // Also print finished spans as OTel JSON on stdout
//! stepwise_observe::tracing_setup::init_tracing(true, "stepwise=debug").unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Service name reported on exported spans.
pub const SERVICE_NAME: &str = "stepwise";

/// Provider installed by [`init_tracing`]; flushed by [`shutdown_tracing`].
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Filter from `RUST_LOG`, or `default_directive` when it is unset or invalid.
pub fn build_env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer writing to stderr so stdout stays clean for
///   command output (including `--json`).
/// - When `enable_otel` is true, bridges spans to OpenTelemetry with the
///   stdout exporter.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(
    enable_otel: bool,
    default_directive: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let env_filter = build_env_filter(default_directive);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(SERVICE_NAME);
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// Flush pending spans and shut down the tracer provider. No-op without OTel.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("stepwise: failed to flush spans on shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_applies_without_rust_log() {
        let filter = build_env_filter("stepwise=debug");
        assert!(filter.to_string().contains("stepwise") || std::env::var("RUST_LOG").is_ok());
    }

    #[test]
    fn shutdown_without_init_is_a_noop() {
        shutdown_tracing();
    }
}
