//! Logging and OpenTelemetry tracing for flow.ci.
//!
//! Installs the global `tracing` subscriber (env filter, plain or JSON
//! output, optional OTLP export) and provides CI-specific span helpers.

pub mod spans;
pub mod tracer;

pub use spans::{CiAttributes, agent_span, job_span, step_span};
pub use tracer::{OtlpConfig, Protocol, TracerError, TracingConfig, init_tracer, shutdown_tracer};
