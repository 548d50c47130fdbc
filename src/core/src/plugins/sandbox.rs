//! Plugin permission enforcement.
//!
//! Permissions form a closed vocabulary and are immutable after
//! install: the granted set is handed to the plugin at `Initialize` and
//! checked again by the supervisor whenever the plugin asks the host to
//! perform an operation on its behalf. Requests outside the granted set
//! receive an RPC-level denial; runtime escalation is not supported.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ═══════════════════════════════════════════════════════════════════════════════
// Permission
// ═══════════════════════════════════════════════════════════════════════════════

/// A single host-mediated right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Read files under a granted prefix.
    FsRead,
    /// Write files under a granted prefix.
    FsWrite,
    /// Make outbound network requests through the host.
    NetOutbound,
    /// Spawn subprocesses through the host.
    ProcExec,
    /// Read the plugin registry.
    RegistryRead,
    /// Mutate the plugin registry.
    RegistryWrite,
}

impl Permission {
    /// The wire spelling used in manifests and RPC requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FsRead => "fs:read",
            Self::FsWrite => "fs:write",
            Self::NetOutbound => "net:outbound",
            Self::ProcExec => "proc:exec",
            Self::RegistryRead => "registry:read",
            Self::RegistryWrite => "registry:write",
        }
    }

    /// Parse a wire spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fs:read" => Some(Self::FsRead),
            "fs:write" => Some(Self::FsWrite),
            "net:outbound" => Some(Self::NetOutbound),
            "proc:exec" => Some(Self::ProcExec),
            "registry:read" => Some(Self::RegistryRead),
            "registry:write" => Some(Self::RegistryWrite),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PermissionSet
// ═══════════════════════════════════════════════════════════════════════════════

/// The permissions granted to a plugin, as declared in its manifest.
///
/// Filesystem permissions carry path prefixes; an empty prefix list
/// means the permission is not granted at all (there is no "all paths"
/// grant).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    /// Path prefixes readable by the plugin
    #[serde(rename = "fs:read", default, skip_serializing_if = "Vec::is_empty")]
    pub fs_read: Vec<String>,

    /// Path prefixes writable by the plugin
    #[serde(rename = "fs:write", default, skip_serializing_if = "Vec::is_empty")]
    pub fs_write: Vec<String>,

    /// Outbound network access through the host
    #[serde(rename = "net:outbound", default)]
    pub net_outbound: bool,

    /// Subprocess execution through the host
    #[serde(rename = "proc:exec", default)]
    pub proc_exec: bool,

    /// Registry read access
    #[serde(rename = "registry:read", default)]
    pub registry_read: bool,

    /// Registry write access
    #[serde(rename = "registry:write", default)]
    pub registry_write: bool,
}

impl PermissionSet {
    /// Whether a permission is granted at all (prefix checks come on
    /// top for the filesystem pair).
    pub fn grants(&self, permission: Permission) -> bool {
        match permission {
            Permission::FsRead => !self.fs_read.is_empty(),
            Permission::FsWrite => !self.fs_write.is_empty(),
            Permission::NetOutbound => self.net_outbound,
            Permission::ProcExec => self.proc_exec,
            Permission::RegistryRead => self.registry_read,
            Permission::RegistryWrite => self.registry_write,
        }
    }

    /// The granted permissions as wire spellings, for `Initialize`.
    pub fn granted_strings(&self) -> Vec<String> {
        let mut granted = Vec::new();
        for permission in [
            Permission::FsRead,
            Permission::FsWrite,
            Permission::NetOutbound,
            Permission::ProcExec,
            Permission::RegistryRead,
            Permission::RegistryWrite,
        ] {
            if self.grants(permission) {
                granted.push(permission.as_str().to_string());
            }
        }
        granted
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Violations
// ═══════════════════════════════════════════════════════════════════════════════

/// A rejected host-mediated request.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SandboxViolation {
    #[error("permission {0} is not granted to this plugin")]
    PermissionDenied(Permission),

    #[error("path {path} is outside the granted {permission} prefixes")]
    PathNotAllowed { permission: Permission, path: String },

    #[error("unknown permission in request: {0}")]
    UnknownPermission(String),
}

impl From<SandboxViolation> for tonic::Status {
    fn from(violation: SandboxViolation) -> Self {
        tonic::Status::permission_denied(violation.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PermissionGate
// ═══════════════════════════════════════════════════════════════════════════════

/// Supervisor-side enforcement of a plugin's granted permission set.
#[derive(Debug, Clone)]
pub struct PermissionGate {
    granted: PermissionSet,
}

impl PermissionGate {
    /// Build a gate over an immutable granted set.
    pub fn new(granted: PermissionSet) -> Self {
        Self { granted }
    }

    /// Check a non-filesystem permission.
    pub fn check(&self, permission: Permission) -> Result<(), SandboxViolation> {
        if self.granted.grants(permission) {
            Ok(())
        } else {
            Err(SandboxViolation::PermissionDenied(permission))
        }
    }

    /// Check a filesystem permission against its granted prefixes.
    pub fn check_path(&self, permission: Permission, path: &Path) -> Result<(), SandboxViolation> {
        let prefixes = match permission {
            Permission::FsRead => &self.granted.fs_read,
            Permission::FsWrite => &self.granted.fs_write,
            other => return self.check(other),
        };

        if prefixes.is_empty() {
            return Err(SandboxViolation::PermissionDenied(permission));
        }

        if prefixes.iter().any(|prefix| path.starts_with(prefix)) {
            Ok(())
        } else {
            Err(SandboxViolation::PathNotAllowed {
                permission,
                path: path.display().to_string(),
            })
        }
    }

    /// Check a wire-format request: permission spelling plus an
    /// optional path operand for the filesystem pair.
    pub fn check_request(
        &self,
        permission: &str,
        path: Option<&Path>,
    ) -> Result<(), SandboxViolation> {
        let Some(permission) = Permission::parse(permission) else {
            return Err(SandboxViolation::UnknownPermission(permission.to_string()));
        };
        match (permission, path) {
            (Permission::FsRead | Permission::FsWrite, Some(path)) => {
                self.check_path(permission, path)
            }
            (Permission::FsRead | Permission::FsWrite, None) => self.check(permission),
            (other, _) => self.check(other),
        }
    }

    /// The underlying granted set.
    pub fn granted(&self) -> &PermissionSet {
        &self.granted
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> PermissionGate {
        PermissionGate::new(PermissionSet {
            fs_read: vec!["/var/lib/portunix".into()],
            fs_write: vec![],
            net_outbound: true,
            proc_exec: false,
            registry_read: true,
            registry_write: false,
        })
    }

    #[test]
    fn test_granted_permissions_pass() {
        let gate = gate();
        assert!(gate.check(Permission::NetOutbound).is_ok());
        assert!(gate.check(Permission::RegistryRead).is_ok());
    }

    #[test]
    fn test_undeclared_permissions_denied() {
        let gate = gate();
        assert_eq!(
            gate.check(Permission::ProcExec),
            Err(SandboxViolation::PermissionDenied(Permission::ProcExec))
        );
        assert_eq!(
            gate.check(Permission::RegistryWrite),
            Err(SandboxViolation::PermissionDenied(Permission::RegistryWrite))
        );
    }

    #[test]
    fn test_fs_prefix_enforcement() {
        let gate = gate();
        assert!(gate
            .check_path(Permission::FsRead, Path::new("/var/lib/portunix/data.json"))
            .is_ok());
        assert_eq!(
            gate.check_path(Permission::FsRead, Path::new("/etc/shadow")),
            Err(SandboxViolation::PathNotAllowed {
                permission: Permission::FsRead,
                path: "/etc/shadow".into()
            })
        );
        // fs:write has no prefixes at all, so it is simply not granted.
        assert_eq!(
            gate.check_path(Permission::FsWrite, Path::new("/var/lib/portunix/x")),
            Err(SandboxViolation::PermissionDenied(Permission::FsWrite))
        );
    }

    #[test]
    fn test_unknown_permission_in_request() {
        let gate = gate();
        assert_eq!(
            gate.check_request("fs:chmod", None),
            Err(SandboxViolation::UnknownPermission("fs:chmod".into()))
        );
    }

    #[test]
    fn test_granted_strings_for_initialize() {
        let granted = gate().granted().granted_strings();
        assert_eq!(granted, vec!["fs:read", "net:outbound", "registry:read"]);
    }

    #[test]
    fn test_permission_round_trip() {
        for p in [
            Permission::FsRead,
            Permission::FsWrite,
            Permission::NetOutbound,
            Permission::ProcExec,
            Permission::RegistryRead,
            Permission::RegistryWrite,
        ] {
            assert_eq!(Permission::parse(p.as_str()), Some(p));
        }
    }
}
