//! Structured Logging with JSON/Pretty Formats.
//!
//! This module provides:
//!
//! - JSON format for fleet deployments
//! - Pretty format for interactive terminals
//! - Per-module log level configuration
//! - Span event configuration
//!
//! `PORTUNIX_DEBUG` forces verbose diagnostics regardless of the
//! configured level.

use serde::Deserialize;
use std::collections::HashMap;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty or compact)
    #[serde(default)]
    pub format: LogFormat,

    /// Per-module log levels
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Whether to include file/line information
    #[serde(default)]
    pub include_location: bool,

    /// Whether to include target (module path)
    #[serde(default = "default_include_target")]
    pub include_target: bool,

    /// Span event configuration
    #[serde(default)]
    pub span_events: SpanEventConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            include_target: default_include_target(),
            span_events: SpanEventConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for structured collection
    Json,
    /// Pretty format for development
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

/// Configuration for span event logging.
#[derive(Debug, Clone, Deserialize)]
pub struct SpanEventConfig {
    /// Log when spans are created
    #[serde(default)]
    pub on_new: bool,

    /// Log when spans are closed
    #[serde(default)]
    pub on_close: bool,
}

impl Default for SpanEventConfig {
    fn default() -> Self {
        Self {
            on_new: false,
            on_close: false,
        }
    }
}

impl SpanEventConfig {
    fn to_fmt_span(&self) -> FmtSpan {
        let mut span = FmtSpan::NONE;
        if self.on_new {
            span = span | FmtSpan::NEW;
        }
        if self.on_close {
            span = span | FmtSpan::CLOSE;
        }
        span
    }
}

/// Initialize the global tracing subscriber.
///
/// Precedence for the filter: `RUST_LOG` env, then `PORTUNIX_DEBUG`
/// (which forces `debug`), then the configured level and module levels.
pub fn init_logging(config: &LoggingConfig) {
    let filter = build_filter(config);

    match config.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_target(config.include_target)
                        .with_span_events(config.span_events.to_fmt_span()),
                )
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_target(config.include_target)
                        .with_span_events(config.span_events.to_fmt_span())
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_target(config.include_target)
                        .with_span_events(config.span_events.to_fmt_span())
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        return EnvFilter::from_default_env();
    }

    let base = if crate::debug_enabled() {
        "debug".to_string()
    } else {
        config.level.clone()
    };

    let mut directives = base;
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{}={}", module, level));
    }

    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_include_target() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_is_pretty() {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_format_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            logging: LoggingConfig,
        }
        let w: Wrapper = toml::from_str("[logging]\nformat = \"json\"\nlevel = \"warn\"").unwrap();
        assert_eq!(w.logging.format, LogFormat::Json);
        assert_eq!(w.logging.level, "warn");
    }

    #[test]
    fn test_span_event_flags() {
        let config = SpanEventConfig {
            on_new: true,
            on_close: true,
        };
        assert_eq!(config.to_fmt_span(), FmtSpan::NEW | FmtSpan::CLOSE);
        assert_eq!(SpanEventConfig::default().to_fmt_span(), FmtSpan::NONE);
    }
}
