//! Plugin manifest parsing and validation.
//!
//! Supports both TOML and JSON manifest formats. Every plugin package
//! must include a manifest declaring its id, version, API version,
//! binary name, capabilities, permissions, and environment overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// ═══════════════════════════════════════════════════════════════════════════════
// Capability
// ═══════════════════════════════════════════════════════════════════════════════

/// A capability a plugin declares it serves.
///
/// The vocabulary is closed: the supervisor validates manifests against
/// this set, and adding a capability is a source change in both host
/// and plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCapability {
    /// Plugin contributes package definitions to the installer.
    Packages,
    /// Plugin manages environments behind the provider abstraction.
    Environments,
    /// Plugin contributes host diagnostics.
    Diagnostics,
    /// Plugin bridges an MCP server.
    Mcp,
    /// Plugin scaffolds project templates.
    Scaffolding,
    /// Plugin manages secret material.
    Secrets,
}

impl PluginCapability {
    /// All capabilities the host understands.
    pub const ALL: &'static [PluginCapability] = &[
        Self::Packages,
        Self::Environments,
        Self::Diagnostics,
        Self::Mcp,
        Self::Scaffolding,
        Self::Secrets,
    ];

    /// The manifest / wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Packages => "packages",
            Self::Environments => "environments",
            Self::Diagnostics => "diagnostics",
            Self::Mcp => "mcp",
            Self::Scaffolding => "scaffolding",
            Self::Secrets => "secrets",
        }
    }

    /// Parse a wire spelling.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PluginManifest
// ═══════════════════════════════════════════════════════════════════════════════

/// Full manifest for a plugin, stored as `plugin.toml` or `plugin.json`
/// at the root of the plugin package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin id (e.g. "sbom-scanner").
    pub id: String,

    /// Semantic version string.
    pub version: String,

    /// Host API version the plugin targets (major.minor).
    pub api_version: String,

    /// Binary filename inside the package, relative, no separators.
    pub binary: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Capabilities this plugin serves.
    #[serde(default)]
    pub capabilities: Vec<PluginCapability>,

    /// Permissions the plugin requests; immutable after install.
    #[serde(default)]
    pub permissions: crate::plugins::sandbox::PermissionSet,

    /// Environment overrides applied to the plugin process.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl PluginManifest {
    // ─────────────────────────────────────────────────────────────────────────
    // Parsing helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Parse a manifest from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ManifestError> {
        toml::from_str(toml_str).map_err(|e| ManifestError::ParseError {
            format: "TOML".into(),
            details: e.to_string(),
        })
    }

    /// Parse a manifest from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json_str).map_err(|e| ManifestError::ParseError {
            format: "JSON".into(),
            details: e.to_string(),
        })
    }

    /// Load a manifest from a directory, looking for `plugin.toml` then
    /// `plugin.json`.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ManifestError> {
        let toml_path = dir.join("plugin.toml");
        if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path).map_err(|e| {
                ManifestError::IoError(format!("Failed to read {}: {}", toml_path.display(), e))
            })?;
            return Self::from_toml(&content);
        }

        let json_path = dir.join("plugin.json");
        if json_path.exists() {
            let content = std::fs::read_to_string(&json_path).map_err(|e| {
                ManifestError::IoError(format!("Failed to read {}: {}", json_path.display(), e))
            })?;
            return Self::from_json(&content);
        }

        Err(ManifestError::NotFound {
            dir: dir.display().to_string(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate the manifest fields.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.is_empty() {
            return Err(ManifestError::ValidationError("id must not be empty".into()));
        }

        // Naming convention: lowercase alphanumeric + hyphens.
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ManifestError::ValidationError(
                "id must contain only lowercase alphanumeric characters and hyphens".into(),
            ));
        }

        if semver::Version::parse(&self.version).is_err() {
            return Err(ManifestError::ValidationError(
                "version must follow semver (e.g. 1.0.0)".into(),
            ));
        }

        parse_api_version(&self.api_version)?;

        if self.binary.is_empty() {
            return Err(ManifestError::ValidationError("binary must not be empty".into()));
        }
        if self.binary.contains('/') || self.binary.contains('\\') {
            return Err(ManifestError::ValidationError(
                "binary must be a bare filename inside the package".into(),
            ));
        }

        Ok(())
    }

    /// Parsed semver of the plugin.
    pub fn semver(&self) -> semver::Version {
        // validate() guarantees this parses; a failure here is a caller
        // bug, so fall back to 0.0.0 rather than panic in release use.
        semver::Version::parse(&self.version).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
    }

    /// Whether the plugin's API major matches the host's.
    pub fn api_compatible_with(&self, host_api: &str) -> bool {
        match (parse_api_version(&self.api_version), parse_api_version(host_api)) {
            (Ok((plugin_major, _)), Ok((host_major, _))) => plugin_major == host_major,
            _ => false,
        }
    }
}

/// Parse an API version of the form `major.minor`.
pub fn parse_api_version(s: &str) -> Result<(u32, u32), ManifestError> {
    let mut parts = s.split('.');
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| p.parse::<u32>().ok());
    match (major, minor, parts.next()) {
        (Some(major), Some(minor), None) => Ok((major, minor)),
        _ => Err(ManifestError::ValidationError(
            "api_version must follow major.minor (e.g. 1.0)".into(),
        )),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors that can occur when working with plugin manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest not found in directory: {dir}")]
    NotFound { dir: String },

    #[error("Failed to parse {format} manifest: {details}")]
    ParseError { format: String, details: String },

    #[error("Manifest validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<ManifestError> for crate::error::PortunixError {
    fn from(err: ManifestError) -> Self {
        Self::with_internal(
            crate::error::ErrorCode::ManifestInvalid,
            "plugin manifest is invalid",
            err.to_string(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, version: &str, api: &str) -> PluginManifest {
        PluginManifest {
            id: id.into(),
            version: version.into(),
            api_version: api.into(),
            binary: "plugin-bin".into(),
            description: String::new(),
            capabilities: vec![],
            permissions: Default::default(),
            environment: HashMap::new(),
        }
    }

    #[test]
    fn test_parse_toml_manifest() {
        let toml = r#"
id = "sbom-scanner"
version = "1.0.0"
api_version = "1.0"
binary = "sbom-scanner"
description = "Generates SBOMs for installed packages"
capabilities = ["diagnostics"]

[permissions]
"fs:read" = ["/var/lib"]

[environment]
SBOM_FORMAT = "spdx"
"#;
        let manifest = PluginManifest::from_toml(toml).unwrap();
        assert_eq!(manifest.id, "sbom-scanner");
        assert_eq!(manifest.capabilities, vec![PluginCapability::Diagnostics]);
        assert_eq!(manifest.environment.get("SBOM_FORMAT").unwrap(), "spdx");
        manifest.validate().unwrap();
    }

    #[test]
    fn test_parse_json_manifest() {
        let json = r#"{
            "id": "mcp-bridge",
            "version": "0.2.1",
            "api_version": "1.0",
            "binary": "mcp-bridge",
            "capabilities": ["mcp"],
            "permissions": {"net:outbound": true}
        }"#;
        let manifest = PluginManifest::from_json(json).unwrap();
        assert_eq!(manifest.id, "mcp-bridge");
        assert!(manifest.permissions.net_outbound);
    }

    #[test]
    fn test_validate_rejects_bad_id() {
        assert!(manifest("", "1.0.0", "1.0").validate().is_err());
        assert!(manifest("Has Caps", "1.0.0", "1.0").validate().is_err());
        assert!(manifest("ok-id", "1.0.0", "1.0").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        assert!(manifest("p", "not-semver", "1.0").validate().is_err());
        assert!(manifest("p", "1.2", "1.0").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_api_version() {
        assert!(manifest("p", "1.0.0", "1").validate().is_err());
        assert!(manifest("p", "1.0.0", "1.0.0").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_pathy_binary() {
        let mut m = manifest("p", "1.0.0", "1.0");
        m.binary = "bin/tool".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_api_compatibility_is_major_based() {
        let m = manifest("p", "1.0.0", "1.3");
        assert!(m.api_compatible_with("1.0"));
        assert!(!m.api_compatible_with("2.0"));
    }

    #[test]
    fn test_unknown_capability_rejected_at_parse() {
        let json = r#"{
            "id": "p", "version": "1.0.0", "api_version": "1.0",
            "binary": "p", "capabilities": ["telepathy"]
        }"#;
        assert!(PluginManifest::from_json(json).is_err());
    }
}
