//! Release descriptor: the JSON document published by the update
//! source describing the latest binary set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One downloadable binary in a release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Download URL (HTTPS).
    pub url: String,
    /// Hex-encoded SHA-256 of the artifact.
    pub sha256: String,
    /// Size in bytes, when declared.
    #[serde(default)]
    pub size: Option<u64>,
}

/// The published release descriptor. Unknown fields are ignored so the
/// source can grow metadata without breaking old clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    /// Release version.
    pub version: semver::Version,
    /// Binary name → artifact. Names are the on-disk file names inside
    /// the install root (platform suffix included where applicable).
    pub artifacts: BTreeMap<String, ArtifactDescriptor>,
}

impl ReleaseDescriptor {
    /// Artifact for a given binary name.
    pub fn artifact(&self, name: &str) -> Option<&ArtifactDescriptor> {
        self.artifacts.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_unknown_fields() {
        let json = r#"{
            "version": "1.7.5",
            "channel": "stable",
            "artifacts": {
                "portunix": {"url": "https://x/p", "sha256": "aa", "size": 10},
                "ptx-container": {"url": "https://x/c", "sha256": "bb"}
            }
        }"#;
        let descriptor: ReleaseDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.version, semver::Version::new(1, 7, 5));
        assert_eq!(descriptor.artifacts.len(), 2);
        assert_eq!(descriptor.artifact("portunix").unwrap().size, Some(10));
        assert!(descriptor.artifact("ptx-container").unwrap().size.is_none());
    }

    #[test]
    fn test_invalid_version_rejected() {
        let json = r#"{"version": "latest", "artifacts": {}}"#;
        assert!(serde_json::from_str::<ReleaseDescriptor>(json).is_err());
    }
}
