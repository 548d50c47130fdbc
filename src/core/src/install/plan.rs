//! Install-plan construction: dependency closure and ordering.
//!
//! Each selected variant may declare prerequisite packages. The plan is
//! the dependency closure of the requested set, ordered so that every
//! prerequisite precedes its dependents; cycles are rejected during
//! construction.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{ErrorCode, PortunixError, Result};
use crate::install::catalog::{PackageCatalog, Variant};
use crate::install::hostinfo::HostInfo;
use crate::install::select::select_variant;

/// One step of an install plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// Package key.
    pub package: String,
    /// Selected variant key.
    pub variant_key: String,
    /// The selected variant itself.
    pub variant: Variant,
    /// Whether the variant came from the fallback chain.
    pub fallback: bool,
}

/// A topologically ordered sequence of plan steps.
#[derive(Debug, Clone, Default)]
pub struct InstallPlan {
    pub steps: Vec<PlanStep>,
}

impl InstallPlan {
    /// Package keys in execution order.
    pub fn package_order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.package.as_str()).collect()
    }
}

/// Build the plan for a set of requested `(package, variant_hint)`
/// pairs against one host.
pub fn build_plan(
    catalog: &PackageCatalog,
    host: &HostInfo,
    requests: &[(String, Option<String>)],
) -> Result<InstallPlan> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    let mut selections: HashMap<String, PlanStep> = HashMap::new();

    // Depth-first closure over prerequisites. Hints only apply to the
    // explicitly requested packages.
    let mut stack: Vec<(String, Option<String>)> = requests.to_vec();
    while let Some((package_key, hint)) = stack.pop() {
        if selections.contains_key(&package_key) {
            continue;
        }

        let package = catalog.package(&package_key)?;
        let selection = select_variant(&package_key, package, host, hint.as_deref())?;

        let node = *nodes
            .entry(package_key.clone())
            .or_insert_with(|| graph.add_node(package_key.clone()));

        for prerequisite in &selection.variant.prerequisites {
            stack.push((prerequisite.clone(), None));
            let dep_node = *nodes
                .entry(prerequisite.clone())
                .or_insert_with(|| graph.add_node(prerequisite.clone()));
            // Prerequisite before dependent.
            graph.add_edge(dep_node, node, ());
        }

        selections.insert(
            package_key.clone(),
            PlanStep {
                package: package_key,
                variant_key: selection.variant_key,
                variant: selection.variant,
                fallback: selection.fallback,
            },
        );
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        let package = graph[cycle.node_id()].clone();
        PortunixError::new(
            ErrorCode::PlanCycleDetected,
            format!("prerequisite cycle involving package {}", package),
        )
    })?;

    let steps = order
        .into_iter()
        .filter_map(|idx| selections.remove(&graph[idx]))
        .collect();

    Ok(InstallPlan { steps })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::catalog::OsFamily;

    fn host() -> HostInfo {
        HostInfo::new(OsFamily::Linux, Some("ubuntu"), Some("24.04"), "amd64")
    }

    fn catalog(json: &str) -> PackageCatalog {
        let catalog: PackageCatalog = serde_json::from_str(json).unwrap();
        catalog.validate().unwrap();
        catalog
    }

    #[test]
    fn test_prerequisites_come_first() {
        let catalog = catalog(
            r#"{
            "packages": {
                "app": {
                    "variants": {
                        "linux": {
                            "os": "linux",
                            "method": "native-manager",
                            "package_name": "app",
                            "prerequisites": ["runtime"]
                        }
                    }
                },
                "runtime": {
                    "variants": {
                        "linux": {
                            "os": "linux",
                            "method": "native-manager",
                            "package_name": "runtime",
                            "prerequisites": ["certs"]
                        }
                    }
                },
                "certs": {
                    "variants": {
                        "linux": {
                            "os": "linux",
                            "method": "native-manager",
                            "package_name": "ca-certificates"
                        }
                    }
                }
            }
        }"#,
        );

        let plan = build_plan(&catalog, &host(), &[("app".to_string(), None)]).unwrap();
        let order = plan.package_order();
        assert_eq!(order.len(), 3);
        let position = |name: &str| order.iter().position(|p| *p == name).unwrap();
        assert!(position("certs") < position("runtime"));
        assert!(position("runtime") < position("app"));
    }

    #[test]
    fn test_shared_prerequisite_appears_once() {
        let catalog = catalog(
            r#"{
            "packages": {
                "a": {
                    "variants": {
                        "linux": {
                            "os": "linux", "method": "native-manager",
                            "package_name": "a", "prerequisites": ["base"]
                        }
                    }
                },
                "b": {
                    "variants": {
                        "linux": {
                            "os": "linux", "method": "native-manager",
                            "package_name": "b", "prerequisites": ["base"]
                        }
                    }
                },
                "base": {
                    "variants": {
                        "linux": {
                            "os": "linux", "method": "native-manager",
                            "package_name": "base"
                        }
                    }
                }
            }
        }"#,
        );

        let plan = build_plan(
            &catalog,
            &host(),
            &[("a".to_string(), None), ("b".to_string(), None)],
        )
        .unwrap();
        let order = plan.package_order();
        assert_eq!(order.len(), 3);
        assert_eq!(order.iter().filter(|p| **p == "base").count(), 1);
        assert_eq!(order[0], "base");
    }

    #[test]
    fn test_cycle_detected() {
        let catalog = catalog(
            r#"{
            "packages": {
                "a": {
                    "variants": {
                        "linux": {
                            "os": "linux", "method": "native-manager",
                            "package_name": "a", "prerequisites": ["b"]
                        }
                    }
                },
                "b": {
                    "variants": {
                        "linux": {
                            "os": "linux", "method": "native-manager",
                            "package_name": "b", "prerequisites": ["a"]
                        }
                    }
                }
            }
        }"#,
        );

        let err = build_plan(&catalog, &host(), &[("a".to_string(), None)]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PlanCycleDetected);
    }

    #[test]
    fn test_unknown_package_fails() {
        let catalog = catalog(r#"{"packages": {}}"#);
        let err = build_plan(&catalog, &host(), &[("ghost".to_string(), None)]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PackageNotFound);
    }
}
