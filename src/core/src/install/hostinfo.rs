//! Host detection for variant selection.
//!
//! A host is described by (osFamily, distributionId,
//! distributionVersion, architecture). On Linux the distribution facts
//! come from `/etc/os-release`; detection runs once per invocation and
//! is shared by the installer and diagnostics.

use serde::Serialize;

use crate::install::catalog::OsFamily;

/// Facts about the machine the installer runs on.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub os: OsFamily,
    pub distribution_id: Option<String>,
    pub distribution_version: Option<String>,
    pub arch: String,
}

impl HostInfo {
    /// Detect the current host.
    pub fn detect() -> Self {
        let (distribution_id, distribution_version) = detect_distribution();
        Self {
            os: current_os(),
            distribution_id,
            distribution_version,
            arch: normalize_arch(std::env::consts::ARCH),
        }
    }

    /// Construct explicitly (tests, remote planning).
    pub fn new(
        os: OsFamily,
        distribution_id: Option<&str>,
        distribution_version: Option<&str>,
        arch: &str,
    ) -> Self {
        Self {
            os,
            distribution_id: distribution_id.map(str::to_string),
            distribution_version: distribution_version.map(str::to_string),
            arch: arch.to_string(),
        }
    }

    /// Render for diagnostics, e.g. `linux/ubuntu 25.04 amd64`.
    pub fn describe(&self) -> String {
        let os = match self.os {
            OsFamily::Linux => "linux",
            OsFamily::Windows => "windows",
            OsFamily::Macos => "macos",
        };
        match (&self.distribution_id, &self.distribution_version) {
            (Some(id), Some(version)) => format!("{}/{} {} {}", os, id, version, self.arch),
            (Some(id), None) => format!("{}/{} {}", os, id, self.arch),
            _ => format!("{} {}", os, self.arch),
        }
    }
}

fn current_os() -> OsFamily {
    if cfg!(target_os = "windows") {
        OsFamily::Windows
    } else if cfg!(target_os = "macos") {
        OsFamily::Macos
    } else {
        OsFamily::Linux
    }
}

/// Map Rust's architecture names onto the catalog vocabulary.
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        "x86" => "x86".to_string(),
        other => other.to_string(),
    }
}

fn detect_distribution() -> (Option<String>, Option<String>) {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/etc/os-release") {
            Ok(content) => parse_os_release(&content),
            Err(_) => (None, None),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        (None, None)
    }
}

/// Extract `ID` and `VERSION_ID` from os-release content.
pub fn parse_os_release(content: &str) -> (Option<String>, Option<String>) {
    let mut id = None;
    let mut version = None;
    for line in content.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("ID=") {
            id = Some(unquote(value));
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            version = Some(unquote(value));
        }
    }
    (id, version)
}

fn unquote(value: &str) -> String {
    value.trim_matches('"').trim_matches('\'').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release() {
        let content = r#"
NAME="Ubuntu"
VERSION="25.04 (Plucky Puffin)"
ID=ubuntu
ID_LIKE=debian
VERSION_ID="25.04"
"#;
        let (id, version) = parse_os_release(content);
        assert_eq!(id.as_deref(), Some("ubuntu"));
        assert_eq!(version.as_deref(), Some("25.04"));
    }

    #[test]
    fn test_parse_os_release_missing_fields() {
        let (id, version) = parse_os_release("NAME=Something\n");
        assert!(id.is_none());
        assert!(version.is_none());
    }

    #[test]
    fn test_arch_normalization() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[test]
    fn test_describe() {
        let host = HostInfo::new(OsFamily::Linux, Some("ubuntu"), Some("25.04"), "amd64");
        assert_eq!(host.describe(), "linux/ubuntu 25.04 amd64");
    }
}
