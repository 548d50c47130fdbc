//! Variant selection.
//!
//! Exactly one variant is selected per (package, host) pair:
//!
//! 1. Filter variants by target OS and architecture.
//! 2. Apply the distribution filter: exact id match, then the version
//!    predicate (exact list or inclusive range).
//! 3. When nothing matches, walk the package's `fallback_variants`
//!    chain.
//! 4. Tie-break survivors by declared priority, then distribution
//!    specificity, then the newest declared package version.
//!
//! Every rejected variant keeps its rejection reason so a failed
//! selection can name each attempt.

use tracing::info;

use crate::error::{ErrorCode, PortunixError};
use crate::install::catalog::{compare_versions, PackageDefinition, Variant};
use crate::install::hostinfo::HostInfo;

/// A successful selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub variant_key: String,
    pub variant: Variant,
    /// True when the variant came from the fallback chain.
    pub fallback: bool,
}

/// Why one variant was rejected for this host.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub variant_key: String,
    pub reason: String,
}

/// Select the single best variant of `package` for `host`.
///
/// A `hint` (from `--variant` or a profile) narrows the search to the
/// named variant, which must still fit the host's OS and architecture.
pub fn select_variant(
    package_key: &str,
    package: &PackageDefinition,
    host: &HostInfo,
    hint: Option<&str>,
) -> Result<Selection, PortunixError> {
    let mut rejections = Vec::new();

    if let Some(hint) = hint {
        let Some(variant) = package.variants.get(hint) else {
            return Err(PortunixError::new(
                ErrorCode::NoMatchingVariant,
                format!("package {} has no variant named {}", package_key, hint),
            ));
        };
        return match platform_fit(variant, host) {
            Ok(()) => Ok(Selection {
                variant_key: hint.to_string(),
                variant: variant.clone(),
                fallback: false,
            }),
            Err(reason) => Err(selection_error(
                package_key,
                host,
                vec![Rejection {
                    variant_key: hint.to_string(),
                    reason,
                }],
            )),
        };
    }

    // Primary pool: full platform + distribution match. Variants named
    // in the fallback chain are reserved for the fallback pass.
    let mut matches: Vec<(&String, &Variant)> = Vec::new();
    for (key, variant) in &package.variants {
        if package.fallback_variants.contains(key) {
            continue;
        }
        match fits(variant, host) {
            Ok(()) => matches.push((key, variant)),
            Err(reason) => rejections.push(Rejection {
                variant_key: key.clone(),
                reason,
            }),
        }
    }

    if let Some((key, variant)) = pick_best(&mut matches) {
        return Ok(Selection {
            variant_key: key,
            variant,
            fallback: false,
        });
    }

    // Fallback chain, in declared order.
    for key in &package.fallback_variants {
        let Some(variant) = package.variants.get(key) else {
            continue;
        };
        match platform_fit(variant, host) {
            Ok(()) => {
                info!(
                    package = package_key,
                    variant = %key,
                    host = %host.describe(),
                    "no direct variant match, using fallback"
                );
                return Ok(Selection {
                    variant_key: key.clone(),
                    variant: variant.clone(),
                    fallback: true,
                });
            }
            Err(reason) => rejections.push(Rejection {
                variant_key: format!("{} (fallback)", key),
                reason,
            }),
        }
    }

    Err(selection_error(package_key, host, rejections))
}

/// Platform-only check (OS + architecture), used for hints and
/// fallbacks.
fn platform_fit(variant: &Variant, host: &HostInfo) -> Result<(), String> {
    if variant.os != host.os {
        return Err(format!("targets {:?}, host is {:?}", variant.os, host.os));
    }
    if let Some(arch) = &variant.arch {
        if arch != &host.arch {
            return Err(format!("targets {}, host is {}", arch, host.arch));
        }
    }
    Ok(())
}

/// Full check including the distribution filter.
fn fits(variant: &Variant, host: &HostInfo) -> Result<(), String> {
    platform_fit(variant, host)?;

    let Some(filter) = &variant.distribution else {
        return Ok(());
    };

    let Some(host_id) = &host.distribution_id else {
        return Err(format!("requires distribution {}, host has none", filter.id));
    };
    if &filter.id != host_id {
        return Err(format!("requires distribution {}, host is {}", filter.id, host_id));
    }

    let Some(predicate) = &filter.versions else {
        return Ok(());
    };
    let Some(host_version) = &host.distribution_version else {
        return Err("host distribution version unknown".to_string());
    };
    if predicate.matches(host_version) {
        Ok(())
    } else {
        Err(format!(
            "host version {} outside the accepted versions",
            host_version
        ))
    }
}

/// Tie-break among fully matching variants.
fn pick_best(matches: &mut Vec<(&String, &Variant)>) -> Option<(String, Variant)> {
    if matches.is_empty() {
        return None;
    }
    matches.sort_by(|(_, a), (_, b)| {
        // Declared priority first (lower wins; absent sorts last).
        let priority = a
            .priority
            .unwrap_or(u32::MAX)
            .cmp(&b.priority.unwrap_or(u32::MAX));
        if priority != std::cmp::Ordering::Equal {
            return priority;
        }
        // Most specific distribution match next.
        let specificity = specificity(b).cmp(&specificity(a));
        if specificity != std::cmp::Ordering::Equal {
            return specificity;
        }
        // Newest declared package version last.
        match (&b.version, &a.version) {
            (Some(vb), Some(va)) => compare_versions(vb, va),
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (None, None) => std::cmp::Ordering::Equal,
        }
    });
    let (key, variant) = matches.first()?;
    Some(((*key).clone(), (*variant).clone()))
}

fn specificity(variant: &Variant) -> u32 {
    match &variant.distribution {
        Some(filter) if filter.versions.is_some() => 2,
        Some(_) => 1,
        None => 0,
    }
}

fn selection_error(
    package_key: &str,
    host: &HostInfo,
    rejections: Vec<Rejection>,
) -> PortunixError {
    let attempts: Vec<String> = rejections
        .iter()
        .map(|r| format!("{}: {}", r.variant_key, r.reason))
        .collect();
    let mut err = PortunixError::new(
        ErrorCode::NoMatchingVariant,
        format!(
            "no variant of {} matches host {} (attempted: {})",
            package_key,
            host.describe(),
            if attempts.is_empty() {
                "none declared".to_string()
            } else {
                attempts.join("; ")
            }
        ),
    )
    .with_context("host", host.describe())
    .with_context("attempted", &attempts);
    if !attempts.is_empty() {
        err = err.with_hint("declare a fallback variant or pass --variant explicitly");
    }
    err
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::catalog::{OsFamily, PackageCatalog};

    fn catalog() -> PackageCatalog {
        serde_json::from_str(
            r#"{
            "packages": {
                "powershell": {
                    "variants": {
                        "ubuntu": {
                            "os": "linux",
                            "arch": "amd64",
                            "distribution": {
                                "id": "ubuntu",
                                "versions": ["20.04", "22.04", "24.04"]
                            },
                            "method": "native-manager",
                            "package_name": "powershell"
                        },
                        "snap": {
                            "os": "linux",
                            "method": "native-manager",
                            "manager": "snap",
                            "package_name": "powershell"
                        },
                        "windows": {
                            "os": "windows",
                            "method": "native-manager",
                            "manager": "winget",
                            "package_name": "Microsoft.PowerShell"
                        }
                    },
                    "fallback_variants": ["snap"]
                }
            }
        }"#,
        )
        .unwrap()
    }

    fn ubuntu(version: &str) -> HostInfo {
        HostInfo::new(OsFamily::Linux, Some("ubuntu"), Some(version), "amd64")
    }

    #[test]
    fn test_exact_distribution_match() {
        let catalog = catalog();
        let package = catalog.package("powershell").unwrap();
        let selection = select_variant("powershell", package, &ubuntu("24.04"), None).unwrap();
        assert_eq!(selection.variant_key, "ubuntu");
        assert!(!selection.fallback);
    }

    #[test]
    fn test_fallback_selected_when_version_unsupported() {
        let catalog = catalog();
        let package = catalog.package("powershell").unwrap();
        // 25.04 is not in the accepted list; the snap fallback applies.
        let selection = select_variant("powershell", package, &ubuntu("25.04"), None).unwrap();
        assert_eq!(selection.variant_key, "snap");
        assert!(selection.fallback);
    }

    #[test]
    fn test_no_match_lists_every_attempt() {
        let catalog = catalog();
        let package = catalog.package("powershell").unwrap();
        let host = HostInfo::new(OsFamily::Macos, None, None, "arm64");
        let err = select_variant("powershell", package, &host, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoMatchingVariant);
        let message = err.to_string();
        assert!(message.contains("ubuntu:"));
        assert!(message.contains("snap (fallback):"));
        assert!(message.contains("windows:"));
    }

    #[test]
    fn test_hint_narrows_selection() {
        let catalog = catalog();
        let package = catalog.package("powershell").unwrap();
        let selection =
            select_variant("powershell", package, &ubuntu("24.04"), Some("snap")).unwrap();
        assert_eq!(selection.variant_key, "snap");

        // A hint that does not fit the platform is an error, not a
        // silent fallback.
        let host = HostInfo::new(OsFamily::Linux, Some("ubuntu"), Some("24.04"), "amd64");
        let err = select_variant("powershell", package, &host, Some("windows")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoMatchingVariant);
    }

    #[test]
    fn test_priority_wins_over_specificity() {
        let json = r#"{
            "packages": {
                "tool": {
                    "variants": {
                        "specific": {
                            "os": "linux",
                            "distribution": {"id": "ubuntu", "versions": ["24.04"]},
                            "method": "native-manager",
                            "package_name": "tool"
                        },
                        "preferred": {
                            "os": "linux",
                            "method": "native-manager",
                            "package_name": "tool",
                            "priority": 1
                        }
                    }
                }
            }
        }"#;
        let catalog: PackageCatalog = serde_json::from_str(json).unwrap();
        let package = catalog.package("tool").unwrap();
        let selection = select_variant("tool", package, &ubuntu("24.04"), None).unwrap();
        assert_eq!(selection.variant_key, "preferred");
    }

    #[test]
    fn test_specificity_breaks_ties_without_priority() {
        let json = r#"{
            "packages": {
                "tool": {
                    "variants": {
                        "generic": {
                            "os": "linux",
                            "method": "native-manager",
                            "package_name": "tool"
                        },
                        "versioned": {
                            "os": "linux",
                            "distribution": {"id": "ubuntu", "versions": ["24.04"]},
                            "method": "native-manager",
                            "package_name": "tool"
                        }
                    }
                }
            }
        }"#;
        let catalog: PackageCatalog = serde_json::from_str(json).unwrap();
        let package = catalog.package("tool").unwrap();
        let selection = select_variant("tool", package, &ubuntu("24.04"), None).unwrap();
        assert_eq!(selection.variant_key, "versioned");
    }
}
