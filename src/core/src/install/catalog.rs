//! Package catalog model.
//!
//! The catalog (`install-packages.json`) maps package keys to
//! definitions; each definition carries variants specialised to an
//! (OS, distribution, version, architecture) tuple plus optional
//! fallback variants tried when no distribution predicate matches.
//! Profiles bundle packages for one-shot installs.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, PortunixError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Host facts
// ═══════════════════════════════════════════════════════════════════════════════

/// Operating-system family, as targeted by variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
    Macos,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Variant model
// ═══════════════════════════════════════════════════════════════════════════════

/// Distribution version predicate: either an explicit list of accepted
/// versions or an inclusive `{min, max}` range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionPredicate {
    /// Exact list match.
    List(Vec<String>),
    /// Inclusive range; either bound may be omitted.
    Range {
        #[serde(default)]
        min: Option<String>,
        #[serde(default)]
        max: Option<String>,
    },
}

impl VersionPredicate {
    /// Whether a host distribution version satisfies the predicate.
    pub fn matches(&self, version: &str) -> bool {
        match self {
            Self::List(accepted) => accepted.iter().any(|v| v == version),
            Self::Range { min, max } => {
                let lower_ok = min
                    .as_deref()
                    .map_or(true, |min| compare_versions(version, min) >= std::cmp::Ordering::Equal);
                let upper_ok = max
                    .as_deref()
                    .map_or(true, |max| compare_versions(version, max) <= std::cmp::Ordering::Equal);
                lower_ok && upper_ok
            }
        }
    }
}

/// Compare dotted numeric versions ("24.04" vs "22.04"); non-numeric
/// segments compare lexically.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

/// Filter restricting a variant to one distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionFilter {
    /// Distribution id as in `/etc/os-release` (`ubuntu`, `fedora`, ...).
    pub id: String,
    /// Version predicate; absent means any version of the distribution.
    #[serde(default)]
    pub versions: Option<VersionPredicate>,
}

/// Installation method tag; a closed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMethodKind {
    /// Delegate to the platform package manager.
    NativeManager,
    /// HTTPS download, checksum, extract.
    ArchiveDownload,
    /// Run a bundled, checksummed script.
    Script,
    /// Download an installer and run it with silent flags.
    InstallerBinary,
}

/// A concrete installation recipe for one (OS, distribution, version,
/// architecture) tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    /// Target OS family.
    pub os: OsFamily,

    /// Target architecture (`amd64`, `arm64`, ...); absent means any.
    #[serde(default)]
    pub arch: Option<String>,

    /// Distribution filter; absent means any distribution of the OS.
    #[serde(default)]
    pub distribution: Option<DistributionFilter>,

    /// Installation method.
    pub method: InstallMethodKind,

    /// Package name handed to the native manager (native-manager).
    #[serde(default)]
    pub package_name: Option<String>,

    /// Explicit manager binary (`apt-get`, `snap`, `winget`, ...);
    /// absent means autodetect.
    #[serde(default)]
    pub manager: Option<String>,

    /// Artifact URL (archive-download, installer-binary).
    #[serde(default)]
    pub url: Option<String>,

    /// Artifact SHA-256; mandatory whenever `url` is set.
    #[serde(default)]
    pub sha256: Option<String>,

    /// Extraction target, relative paths resolve against the data home
    /// (archive-download).
    #[serde(default)]
    pub target_dir: Option<String>,

    /// Bundled script path relative to the catalog file (script).
    #[serde(default)]
    pub script: Option<String>,

    /// Silent-install flags (installer-binary).
    #[serde(default)]
    pub silent_args: Vec<String>,

    /// Probe command; exit 0 means the package is already installed.
    #[serde(default)]
    pub check_command: Option<String>,

    /// Post-install hook commands, run through the OS shell.
    #[serde(default)]
    pub post_install: Vec<String>,

    /// Package keys that must be installed first.
    #[serde(default)]
    pub prerequisites: Vec<String>,

    /// Explicit tie-break priority; lower wins.
    #[serde(default)]
    pub priority: Option<u32>,

    /// Package version this variant installs, for tie-breaking and
    /// display.
    #[serde(default)]
    pub version: Option<String>,
}

impl Variant {
    /// Structural check: downloaded artifacts must carry a checksum.
    pub fn validate(&self, package: &str, key: &str) -> Result<()> {
        if self.url.is_some() && self.sha256.is_none() {
            return Err(PortunixError::new(
                ErrorCode::CatalogInvalid,
                format!(
                    "variant {}/{} declares a url without a sha256",
                    package, key
                ),
            ));
        }
        match self.method {
            InstallMethodKind::NativeManager if self.package_name.is_none() => {
                Err(PortunixError::new(
                    ErrorCode::CatalogInvalid,
                    format!("variant {}/{} needs package_name", package, key),
                ))
            }
            InstallMethodKind::ArchiveDownload | InstallMethodKind::InstallerBinary
                if self.url.is_none() =>
            {
                Err(PortunixError::new(
                    ErrorCode::CatalogInvalid,
                    format!("variant {}/{} needs url", package, key),
                ))
            }
            InstallMethodKind::Script if self.script.is_none() => Err(PortunixError::new(
                ErrorCode::CatalogInvalid,
                format!("variant {}/{} needs script", package, key),
            )),
            _ => Ok(()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Packages, profiles, catalog
// ═══════════════════════════════════════════════════════════════════════════════

/// A package with its installable variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDefinition {
    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Catalog category (development, runtime, ...).
    #[serde(default)]
    pub category: String,

    /// Variants keyed by variant key.
    pub variants: BTreeMap<String, Variant>,

    /// Variant keys tried, in order, when no distribution predicate
    /// matches the host.
    #[serde(default)]
    pub fallback_variants: Vec<String>,
}

/// One profile member: a package plus an optional variant hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileMember {
    /// Bare package key.
    Package(String),
    /// Package with a variant hint.
    Hinted { package: String, variant: String },
}

impl ProfileMember {
    pub fn package(&self) -> &str {
        match self {
            Self::Package(key) => key,
            Self::Hinted { package, .. } => package,
        }
    }

    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Package(_) => None,
            Self::Hinted { variant, .. } => Some(variant),
        }
    }
}

/// The loaded catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageCatalog {
    /// Package key → definition.
    #[serde(default)]
    pub packages: BTreeMap<String, PackageDefinition>,

    /// Profile name → member list.
    #[serde(default)]
    pub profiles: BTreeMap<String, Vec<ProfileMember>>,
}

impl PackageCatalog {
    /// Load and validate a catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            PortunixError::with_internal(
                ErrorCode::CatalogInvalid,
                format!("cannot read catalog {}", path.display()),
                e.to_string(),
            )
        })?;
        let catalog: Self = serde_json::from_slice(&bytes).map_err(|e| {
            PortunixError::with_internal(
                ErrorCode::CatalogInvalid,
                format!("catalog {} is not valid", path.display()),
                e.to_string(),
            )
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Structural validation of every package.
    pub fn validate(&self) -> Result<()> {
        for (package_key, package) in &self.packages {
            for (variant_key, variant) in &package.variants {
                variant.validate(package_key, variant_key)?;
                for prerequisite in &variant.prerequisites {
                    if !self.packages.contains_key(prerequisite) {
                        return Err(PortunixError::new(
                            ErrorCode::CatalogInvalid,
                            format!(
                                "variant {}/{} requires unknown package {}",
                                package_key, variant_key, prerequisite
                            ),
                        ));
                    }
                }
            }
            for fallback in &package.fallback_variants {
                if !package.variants.contains_key(fallback) {
                    return Err(PortunixError::new(
                        ErrorCode::CatalogInvalid,
                        format!(
                            "package {} names unknown fallback variant {}",
                            package_key, fallback
                        ),
                    ));
                }
            }
        }
        for (profile, members) in &self.profiles {
            for member in members {
                if !self.packages.contains_key(member.package()) {
                    return Err(PortunixError::new(
                        ErrorCode::CatalogInvalid,
                        format!(
                            "profile {} names unknown package {}",
                            profile,
                            member.package()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Package lookup.
    pub fn package(&self, key: &str) -> Result<&PackageDefinition> {
        self.packages.get(key).ok_or_else(|| {
            PortunixError::new(
                ErrorCode::PackageNotFound,
                format!("unknown package: {}", key),
            )
            .with_hint("run `portunix install --list` to see the catalog")
        })
    }

    /// Expand a profile into de-duplicated (package, hint) pairs.
    pub fn resolve_profile(&self, name: &str) -> Result<Vec<(String, Option<String>)>> {
        let members = self.profiles.get(name).ok_or_else(|| {
            PortunixError::new(
                ErrorCode::UnknownProfile,
                format!("unknown profile: {}", name),
            )
        })?;
        let mut seen = std::collections::BTreeSet::new();
        let mut resolved = Vec::new();
        for member in members {
            if seen.insert(member.package().to_string()) {
                resolved.push((
                    member.package().to_string(),
                    member.hint().map(str::to_string),
                ));
            }
        }
        Ok(resolved)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"{
        "packages": {
            "powershell": {
                "name": "PowerShell",
                "category": "shells",
                "variants": {
                    "ubuntu": {
                        "os": "linux",
                        "arch": "amd64",
                        "distribution": {
                            "id": "ubuntu",
                            "versions": ["20.04", "22.04", "24.04"]
                        },
                        "method": "native-manager",
                        "package_name": "powershell",
                        "prerequisites": ["ca-certs"]
                    },
                    "snap": {
                        "os": "linux",
                        "method": "native-manager",
                        "manager": "snap",
                        "package_name": "powershell"
                    }
                },
                "fallback_variants": ["snap"]
            },
            "ca-certs": {
                "variants": {
                    "linux": {
                        "os": "linux",
                        "method": "native-manager",
                        "package_name": "ca-certificates"
                    }
                }
            }
        },
        "profiles": {
            "shell-tools": ["powershell", {"package": "ca-certs", "variant": "linux"}]
        }
    }"#;

    #[test]
    fn test_sample_catalog_parses_and_validates() {
        let catalog: PackageCatalog = serde_json::from_str(SAMPLE).unwrap();
        catalog.validate().unwrap();
        assert_eq!(catalog.packages.len(), 2);
        let pwsh = catalog.package("powershell").unwrap();
        assert_eq!(pwsh.fallback_variants, vec!["snap"]);
    }

    #[test]
    fn test_version_predicate_list() {
        let predicate = VersionPredicate::List(vec!["22.04".into(), "24.04".into()]);
        assert!(predicate.matches("24.04"));
        assert!(!predicate.matches("25.04"));
    }

    #[test]
    fn test_version_predicate_range() {
        let predicate = VersionPredicate::Range {
            min: Some("20.04".into()),
            max: Some("24.04".into()),
        };
        assert!(predicate.matches("22.04"));
        assert!(predicate.matches("20.04"));
        assert!(predicate.matches("24.04"));
        assert!(!predicate.matches("18.04"));
        assert!(!predicate.matches("25.04"));
    }

    #[test]
    fn test_version_comparison_is_numeric() {
        use std::cmp::Ordering;
        assert_eq!(compare_versions("9.0", "10.0"), Ordering::Less);
        assert_eq!(compare_versions("24.04", "24.04"), Ordering::Equal);
        assert_eq!(compare_versions("24.10", "24.4"), Ordering::Greater);
    }

    #[test]
    fn test_url_without_checksum_rejected() {
        let json = r#"{
            "packages": {
                "tool": {
                    "variants": {
                        "linux": {
                            "os": "linux",
                            "method": "archive-download",
                            "url": "https://x/tool.tar.gz"
                        }
                    }
                }
            }
        }"#;
        let catalog: PackageCatalog = serde_json::from_str(json).unwrap();
        let err = catalog.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::CatalogInvalid);
    }

    #[test]
    fn test_unknown_prerequisite_rejected() {
        let json = r#"{
            "packages": {
                "tool": {
                    "variants": {
                        "linux": {
                            "os": "linux",
                            "method": "native-manager",
                            "package_name": "tool",
                            "prerequisites": ["ghost"]
                        }
                    }
                }
            }
        }"#;
        let catalog: PackageCatalog = serde_json::from_str(json).unwrap();
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn test_profile_resolution_dedupes() {
        let catalog: PackageCatalog = serde_json::from_str(SAMPLE).unwrap();
        let resolved = catalog.resolve_profile("shell-tools").unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].0, "powershell");
        assert_eq!(resolved[1], ("ca-certs".to_string(), Some("linux".to_string())));

        assert!(catalog.resolve_profile("missing").is_err());
    }
}
