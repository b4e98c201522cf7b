//! Observability setup for Stepwise: structured logging and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
