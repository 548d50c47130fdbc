//! Telemetry infrastructure: structured logging via `tracing`.

mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
