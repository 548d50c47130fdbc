//! Error handling for Portunix Core.
//!
//! This module provides:
//! - Comprehensive error types with context and chaining
//! - Process exit-code mapping for the CLI surfaces
//! - Error codes for machine-readable reports
//! - A user-facing sentence plus an optional next-step hint
//! - Error logging with tracing integration
//!
//! # Usage
//!
//! ```rust,ignore
//! use portunix_core::error::{PortunixError, Result};
//!
//! fn start(id: &str) -> Result<()> {
//!     Err(PortunixError::plugin_not_found(id)
//!         .with_hint("run `portunix plugin list` to see installed plugins"))
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Portunix operations.
pub type Result<T> = std::result::Result<T, PortunixError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Kind
// ═══════════════════════════════════════════════════════════════════════════════

/// The propagation class of an error.
///
/// Every [`ErrorCode`] maps to exactly one kind; the kind drives retry
/// policy, rollback behavior, and the short tag in user-visible output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Bad input, unknown id, illegal state. Never retried.
    Precondition,
    /// Lock held, port busy, disk full. Retried with bounded backoff
    /// when transient; surfaced on exhaustion.
    Resource,
    /// Checksum or signature mismatch, version skew. Fatal for the
    /// current operation; triggers rollback where applicable.
    Integrity,
    /// Failure of an underlying tool (docker, qemu, apt, ...). Captured
    /// with exit code and stderr; surfaced verbatim.
    External,
    /// Deadline exceeded or explicit cancel. Partial state cleaned.
    Cancelled,
    /// Invariant violation in our own code. Fails loudly.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Precondition => "precondition",
            Self::Resource => "resource",
            Self::Integrity => "integrity",
            Self::External => "external",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{}", tag)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for reports and structured output.
///
/// These codes are stable and can be used by callers for programmatic
/// error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Dispatcher Errors (1000-1099)
    HelperNotFound,
    HelperVersionIncompatible,
    HelperSpawnFailed,
    UnknownCommand,

    // Plugin Errors (1100-1199)
    PluginNotFound,
    PluginAlreadyInstalled,
    PluginDisabled,
    PluginInstanceRunning,
    PluginBinaryMissing,
    HandshakeTimeout,
    PluginUnhealthy,
    PluginQuarantined,
    PermissionDenied,
    ApiVersionIncompatible,
    ManifestInvalid,
    EndpointUnavailable,

    // Self-Update Errors (1200-1299)
    AlreadyCurrent,
    ChecksumMismatch,
    VersionSkew,
    StagingFailed,
    BackupFailed,
    CommitFailed,
    RollbackFailed,
    RecoveryRequired,

    // Installer Errors (1300-1399)
    PackageNotFound,
    NoMatchingVariant,
    PlanCycleDetected,
    InstallStepFailed,
    CatalogInvalid,
    UnknownProfile,

    // Provider Errors (1400-1499)
    ProviderUnavailable,
    EnvironmentNotFound,
    EnvironmentExists,
    SnapshotNotFound,
    SnapshotUnsupported,
    TransferFailed,
    DeployFailed,

    // Resource Errors (2000-2099)
    LockHeld,
    ResourceBusy,
    PoolExhausted,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // External Errors (3000-3099)
    DownloadFailed,
    NetworkError,
    ExternalToolFailed,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Cancellation (7000-7099)
    Cancelled,
    DeadlineExceeded,

    // Internal Errors (9000-9099)
    InternalError,
    IoError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Dispatcher Errors
            Self::HelperNotFound => 1000,
            Self::HelperVersionIncompatible => 1001,
            Self::HelperSpawnFailed => 1002,
            Self::UnknownCommand => 1003,

            // Plugin Errors
            Self::PluginNotFound => 1100,
            Self::PluginAlreadyInstalled => 1101,
            Self::PluginDisabled => 1102,
            Self::PluginInstanceRunning => 1103,
            Self::PluginBinaryMissing => 1104,
            Self::HandshakeTimeout => 1105,
            Self::PluginUnhealthy => 1106,
            Self::PluginQuarantined => 1107,
            Self::PermissionDenied => 1108,
            Self::ApiVersionIncompatible => 1109,
            Self::ManifestInvalid => 1110,
            Self::EndpointUnavailable => 1111,

            // Self-Update Errors
            Self::AlreadyCurrent => 1200,
            Self::ChecksumMismatch => 1201,
            Self::VersionSkew => 1202,
            Self::StagingFailed => 1203,
            Self::BackupFailed => 1204,
            Self::CommitFailed => 1205,
            Self::RollbackFailed => 1206,
            Self::RecoveryRequired => 1207,

            // Installer Errors
            Self::PackageNotFound => 1300,
            Self::NoMatchingVariant => 1301,
            Self::PlanCycleDetected => 1302,
            Self::InstallStepFailed => 1303,
            Self::CatalogInvalid => 1304,
            Self::UnknownProfile => 1305,

            // Provider Errors
            Self::ProviderUnavailable => 1400,
            Self::EnvironmentNotFound => 1401,
            Self::EnvironmentExists => 1402,
            Self::SnapshotNotFound => 1403,
            Self::SnapshotUnsupported => 1404,
            Self::TransferFailed => 1405,
            Self::DeployFailed => 1406,

            // Resource Errors
            Self::LockHeld => 2000,
            Self::ResourceBusy => 2001,
            Self::PoolExhausted => 2002,

            // Serialization Errors
            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            // External Errors
            Self::DownloadFailed => 3000,
            Self::NetworkError => 3001,
            Self::ExternalToolFailed => 3002,

            // Validation Errors
            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            // Cancellation
            Self::Cancelled => 7000,
            Self::DeadlineExceeded => 7001,

            // Internal Errors
            Self::InternalError => 9000,
            Self::IoError => 9001,
            Self::UnknownError => 9099,
        }
    }

    /// The propagation class for this code.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::HelperNotFound
            | Self::UnknownCommand
            | Self::PluginNotFound
            | Self::PluginAlreadyInstalled
            | Self::PluginDisabled
            | Self::PluginInstanceRunning
            | Self::PluginBinaryMissing
            | Self::PermissionDenied
            | Self::ManifestInvalid
            | Self::AlreadyCurrent
            | Self::PackageNotFound
            | Self::PlanCycleDetected
            | Self::CatalogInvalid
            | Self::UnknownProfile
            | Self::NoMatchingVariant
            | Self::EnvironmentNotFound
            | Self::EnvironmentExists
            | Self::SnapshotNotFound
            | Self::SnapshotUnsupported
            | Self::ValidationError
            | Self::InvalidInput
            | Self::ConfigurationError
            | Self::InvalidConfiguration => ErrorKind::Precondition,

            Self::LockHeld
            | Self::ResourceBusy
            | Self::PoolExhausted
            | Self::EndpointUnavailable => ErrorKind::Resource,

            Self::HelperVersionIncompatible
            | Self::ApiVersionIncompatible
            | Self::ChecksumMismatch
            | Self::VersionSkew
            | Self::RecoveryRequired => ErrorKind::Integrity,

            Self::HelperSpawnFailed
            | Self::HandshakeTimeout
            | Self::PluginUnhealthy
            | Self::PluginQuarantined
            | Self::StagingFailed
            | Self::BackupFailed
            | Self::DownloadFailed
            | Self::NetworkError
            | Self::ExternalToolFailed
            | Self::InstallStepFailed
            | Self::ProviderUnavailable
            | Self::TransferFailed
            | Self::DeployFailed => ErrorKind::External,

            Self::Cancelled | Self::DeadlineExceeded => ErrorKind::Cancelled,

            Self::CommitFailed
            | Self::RollbackFailed
            | Self::SerializationError
            | Self::DeserializationError
            | Self::InternalError
            | Self::IoError
            | Self::UnknownError => ErrorKind::Internal,
        }
    }

    /// Get the process exit code for this error.
    ///
    /// `0` success; `1` generic failure; `2` usage error; `3` helper not
    /// found; `4` version incompatibility; `5` resource busy / lock
    /// held; `6` verification failed; `7` cancelled.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::AlreadyCurrent => 0,

            Self::UnknownCommand | Self::InvalidInput => 2,

            Self::HelperNotFound => 3,

            Self::HelperVersionIncompatible | Self::ApiVersionIncompatible => 4,

            Self::LockHeld | Self::ResourceBusy | Self::PoolExhausted => 5,

            Self::ChecksumMismatch | Self::VersionSkew => 6,

            Self::Cancelled | Self::DeadlineExceeded => 7,

            _ => 1,
        }
    }

    /// Check if this error is retryable with backoff.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockHeld
                | Self::ResourceBusy
                | Self::PoolExhausted
                | Self::EndpointUnavailable
                | Self::NetworkError
                | Self::DownloadFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "dispatch",
            1100..=1199 => "plugin",
            1200..=1299 => "update",
            1300..=1399 => "install",
            1400..=1499 => "provider",
            2000..=2099 => "resource",
            2200..=2299 => "serialization",
            3000..=3099 => "external",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            7000..=7099 => "cancelled",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// User errors (bad input, unknown ids)
    Low,
    /// Operational issues (locks, timeouts, transient network)
    Medium,
    /// External tool and integrity failures
    High,
    /// Invariant violations requiring attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on the error kind.
    pub const fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Precondition | ErrorKind::Cancelled => Self::Low,
            ErrorKind::Resource => Self::Medium,
            ErrorKind::External | ErrorKind::Integrity => Self::High,
            ErrorKind::Internal => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity id (plugin, package, environment, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Next-step hint shown to the user (e.g. "rerun with `--force`")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Portunix Core.
///
/// Every failure surfaces as a single structured message with a short
/// kind tag, a human sentence, and an optional next-step hint. Source
/// chains are only shown when `PORTUNIX_DEBUG` is truthy.
#[derive(Error, Debug)]
pub struct PortunixError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-facing sentence
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for PortunixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.kind(), self.message)?;
        if let Some(ref hint) = self.details.hint {
            write!(f, " (hint: {})", hint)?;
        }
        if crate::debug_enabled() {
            if let Some(ref internal) = self.internal_message {
                write!(f, " (internal: {})", internal)?;
            }
        }
        Ok(())
    }
}

impl PortunixError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        }
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a usage error (bad CLI input).
    pub fn invalid_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self::new(ErrorCode::Cancelled, format!("{} was cancelled", operation))
    }

    /// Create a deadline-exceeded error.
    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self::new(
            ErrorCode::DeadlineExceeded,
            format!("{} exceeded its deadline", operation),
        )
    }

    /// Helper binary missing from the install root.
    pub fn helper_not_found(command: &str, expected_path: impl Into<String>) -> Self {
        let expected_path = expected_path.into();
        Self::new(
            ErrorCode::HelperNotFound,
            format!(
                "command '{}' is owned by a helper binary that was not found at {}",
                command, expected_path
            ),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("helper", command)
                .with_context("expected_path", &expected_path)
                .with_hint("run `portunix update` to restore the helper set"),
        )
    }

    /// Helper binary reports an incompatible major version.
    pub fn helper_version_incompatible(
        helper: &str,
        helper_version: &semver::Version,
        main_version: &semver::Version,
    ) -> Self {
        Self::new(
            ErrorCode::HelperVersionIncompatible,
            format!(
                "helper '{}' reports version {} which is incompatible with main version {}",
                helper, helper_version, main_version
            ),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("helper", helper)
                .with_hint("run `portunix update` to bring all binaries to the same version"),
        )
    }

    /// Unknown plugin id.
    pub fn plugin_not_found(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(ErrorCode::PluginNotFound, format!("plugin not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("plugin", &id))
    }

    /// Lock held by another operation.
    pub fn lock_held(resource: impl Into<String>, holder: impl Into<String>) -> Self {
        let resource = resource.into();
        Self::new(
            ErrorCode::LockHeld,
            format!("{} is locked by {}", resource, holder.into()),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("lock", &resource)
                .with_hint("wait for the running operation to finish and retry"),
        )
    }

    /// Checksum mismatch on a downloaded or staged file.
    pub fn checksum_mismatch(
        file: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        let file = file.into();
        Self::with_internal(
            ErrorCode::ChecksumMismatch,
            format!("checksum verification failed for {}", file),
            format!("expected {}, got {}", expected.into(), actual.into()),
        )
        .with_details(ErrorDetails::new().with_entity("file", &file))
    }

    /// An underlying tool failed; captured verbatim.
    pub fn external_tool(tool: impl Into<String>, exit_code: Option<i32>, stderr: &str) -> Self {
        let tool = tool.into();
        let code_str = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        Self::with_internal(
            ErrorCode::ExternalToolFailed,
            format!("{} failed with exit code {}", tool, code_str),
            stderr.trim().to_string(),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("tool", &tool)
                .with_context("exit_code", exit_code)
                .with_context("stderr", stderr.trim()),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add a next-step hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.details.hint = Some(hint.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// The machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The propagation class.
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    /// The severity for logging.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_kind(self.kind())
    }

    /// The process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.code.exit_code()
    }

    /// Whether a bounded-backoff retry is appropriate.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// The user-facing sentence.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Log this error at a level appropriate to its severity.
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Low | ErrorSeverity::Medium => {
                warn!(
                    code = %self.code,
                    kind = %self.kind(),
                    category = self.code.category(),
                    "{}",
                    self.message
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    code = %self.code,
                    kind = %self.kind(),
                    category = self.code.category(),
                    internal = self.internal_message.as_deref().unwrap_or(""),
                    "{}",
                    self.message
                );
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<std::io::Error> for PortunixError {
    fn from(err: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::IoError, "an I/O operation failed", err.to_string())
            .with_source(err)
    }
}

impl From<serde_json::Error> for PortunixError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::DeserializationError,
            "failed to parse JSON document",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<reqwest::Error> for PortunixError {
    fn from(err: reqwest::Error) -> Self {
        Self::with_internal(ErrorCode::NetworkError, "network request failed", err.to_string())
            .with_source(err)
    }
}

impl From<tonic::Status> for PortunixError {
    fn from(status: tonic::Status) -> Self {
        let code = match status.code() {
            tonic::Code::PermissionDenied => ErrorCode::PermissionDenied,
            tonic::Code::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            tonic::Code::Unavailable => ErrorCode::EndpointUnavailable,
            _ => ErrorCode::ExternalToolFailed,
        };
        Self::with_internal(code, "plugin RPC failed", status.message().to_string())
    }
}

impl From<config::ConfigError> for PortunixError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "failed to load configuration",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<semver::Error> for PortunixError {
    fn from(err: semver::Error) -> Self {
        Self::with_internal(
            ErrorCode::ValidationError,
            "failed to parse a semantic version",
            err.to_string(),
        )
        .with_source(err)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_match_command_surface() {
        assert_eq!(ErrorCode::HelperNotFound.exit_code(), 3);
        assert_eq!(ErrorCode::HelperVersionIncompatible.exit_code(), 4);
        assert_eq!(ErrorCode::LockHeld.exit_code(), 5);
        assert_eq!(ErrorCode::ChecksumMismatch.exit_code(), 6);
        assert_eq!(ErrorCode::Cancelled.exit_code(), 7);
        assert_eq!(ErrorCode::InvalidInput.exit_code(), 2);
        assert_eq!(ErrorCode::AlreadyCurrent.exit_code(), 0);
        assert_eq!(ErrorCode::ExternalToolFailed.exit_code(), 1);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ErrorCode::PluginNotFound.kind(), ErrorKind::Precondition);
        assert_eq!(ErrorCode::LockHeld.kind(), ErrorKind::Resource);
        assert_eq!(ErrorCode::ChecksumMismatch.kind(), ErrorKind::Integrity);
        assert_eq!(ErrorCode::ExternalToolFailed.kind(), ErrorKind::External);
        assert_eq!(ErrorCode::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(ErrorCode::InternalError.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_display_contains_kind_tag_and_hint() {
        let err = PortunixError::lock_held("install root", "self-update session");
        let rendered = err.to_string();
        assert!(rendered.starts_with("[resource]"));
        assert!(rendered.contains("hint:"));
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::NetworkError.is_retryable());
        assert!(ErrorCode::LockHeld.is_retryable());
        assert!(!ErrorCode::ChecksumMismatch.is_retryable());
        assert!(!ErrorCode::PluginNotFound.is_retryable());
    }

    #[test]
    fn test_external_tool_captures_stderr() {
        let err = PortunixError::external_tool("docker", Some(125), "no such image\n");
        assert_eq!(err.exit_code(), 1);
        assert_eq!(
            err.details().context.get("stderr").and_then(|v| v.as_str()),
            Some("no such image")
        );
    }

    #[test]
    fn test_severity_from_kind() {
        assert_eq!(
            PortunixError::plugin_not_found("x").severity(),
            ErrorSeverity::Low
        );
        assert_eq!(PortunixError::internal("bug").severity(), ErrorSeverity::Critical);
    }
}
