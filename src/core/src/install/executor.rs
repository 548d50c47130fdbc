//! Sequential plan execution and reporting.
//!
//! Plan steps run strictly in order (native package managers hold
//! exclusive locks of their own). A failing step aborts the plan;
//! completed steps are not rolled back, but the report names every
//! completed, skipped, failed, and not-run step so a caller can react.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{InstallerConfig, PathsConfig};
use crate::error::{PortunixError, Result};
use crate::fetch::Downloader;
use crate::install::catalog::PackageCatalog;
use crate::install::hostinfo::HostInfo;
use crate::install::methods::{MethodRunner, StepAction};
use crate::install::plan::{build_plan, InstallPlan};
use crate::lockfile::LockFile;
use crate::update::install_root_lock_path;

// ═══════════════════════════════════════════════════════════════════════════════
// Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of one executed (or skipped) step.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum StepStatus {
    /// Work was performed.
    Completed(Vec<String>),
    /// The probe said the package was already present.
    Skipped(String),
    /// Dry-run rendering of the would-be actions.
    WouldPerform(Vec<String>),
    /// The step failed; the plan aborted here.
    Failed(String),
    /// Later step never reached because an earlier one failed.
    NotRun,
}

/// One line of the report.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub package: String,
    pub variant: String,
    pub fallback: bool,
    #[serde(flatten)]
    pub status: StepStatus,
}

/// Structured result of an install invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub host: String,
    pub dry_run: bool,
    pub steps: Vec<StepReport>,
}

impl InstallReport {
    /// Whether every step completed or was skipped.
    pub fn ok(&self) -> bool {
        self.steps.iter().all(|step| {
            matches!(
                step.status,
                StepStatus::Completed(_) | StepStatus::Skipped(_) | StepStatus::WouldPerform(_)
            )
        })
    }

    /// Whether the run mutated nothing (all steps skipped or dry-run
    /// with no pending actions).
    pub fn no_mutations(&self) -> bool {
        self.steps
            .iter()
            .all(|step| matches!(step.status, StepStatus::Skipped(_)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Invocation options for the installer.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub dry_run: bool,
    pub force: bool,
    /// Variant hints per package key, from `--variant K=V`.
    pub variant_hints: Vec<(String, String)>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Installer
// ═══════════════════════════════════════════════════════════════════════════════

/// Facade over catalog loading, planning, and execution.
pub struct Installer {
    config: InstallerConfig,
    paths: PathsConfig,
    catalog: PackageCatalog,
    catalog_dir: PathBuf,
    host: HostInfo,
    downloader: Downloader,
    install_root: PathBuf,
}

impl Installer {
    /// Load the catalog and detect the host.
    pub fn new(
        config: InstallerConfig,
        paths: PathsConfig,
        install_root: PathBuf,
    ) -> Result<Self> {
        let catalog_path = if config.catalog.is_absolute() {
            config.catalog.clone()
        } else {
            paths.data_home.join(&config.catalog)
        };
        let catalog = PackageCatalog::load(&catalog_path)?;
        let catalog_dir = catalog_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let downloader = Downloader::new(config.step_timeout)?;
        Ok(Self {
            config,
            paths,
            catalog,
            catalog_dir,
            host: HostInfo::detect(),
            downloader,
            install_root,
        })
    }

    /// Replace the detected host (tests, remote planning).
    pub fn with_host(mut self, host: HostInfo) -> Self {
        self.host = host;
        self
    }

    /// Use an already-loaded catalog (plugin-contributed entries).
    pub fn with_catalog(mut self, catalog: PackageCatalog, catalog_dir: PathBuf) -> Self {
        self.catalog = catalog;
        self.catalog_dir = catalog_dir;
        self
    }

    /// The loaded catalog.
    pub fn catalog(&self) -> &PackageCatalog {
        &self.catalog
    }

    /// Resolve a request token: a profile name expands to its members,
    /// anything else is a package key.
    pub fn resolve_request(&self, token: &str) -> Result<Vec<(String, Option<String>)>> {
        if self.catalog.profiles.contains_key(token) {
            return self.catalog.resolve_profile(token);
        }
        // Surface unknown package keys before planning.
        self.catalog.package(token)?;
        Ok(vec![(token.to_string(), None)])
    }

    /// Build the plan for a set of request tokens.
    pub fn plan(&self, tokens: &[String], options: &InstallOptions) -> Result<InstallPlan> {
        let mut requests = Vec::new();
        for token in tokens {
            requests.extend(self.resolve_request(token)?);
        }
        for (package, hint) in &mut requests {
            if hint.is_none() {
                if let Some((_, explicit)) = options
                    .variant_hints
                    .iter()
                    .find(|(key, _)| key == package)
                {
                    *hint = Some(explicit.clone());
                }
            }
        }
        build_plan(&self.catalog, &self.host, &requests)
    }

    /// Plan and execute an install invocation.
    pub async fn run(
        &self,
        tokens: &[String],
        options: &InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<InstallReport> {
        // The self-update engine holds this lock for the whole commit
        // phase; refuse rather than race it.
        let lock_path = install_root_lock_path(&self.install_root);
        if LockFile::is_held(&lock_path) {
            return Err(PortunixError::lock_held(
                lock_path.display().to_string(),
                "a running self-update",
            ));
        }

        let plan = self.plan(tokens, options)?;
        info!(
            steps = plan.steps.len(),
            host = %self.host.describe(),
            dry_run = options.dry_run,
            "executing install plan"
        );

        let runner = MethodRunner {
            downloader: &self.downloader,
            data_home: &self.paths.data_home,
            catalog_dir: &self.catalog_dir,
            timeout: self.config.step_timeout,
            dry_run: options.dry_run,
            force: options.force,
            cancel,
        };

        let mut steps = Vec::with_capacity(plan.steps.len());
        let mut failed = false;
        for step in &plan.steps {
            if failed {
                steps.push(StepReport {
                    package: step.package.clone(),
                    variant: step.variant_key.clone(),
                    fallback: step.fallback,
                    status: StepStatus::NotRun,
                });
                continue;
            }

            let status = match runner.run(step).await {
                Ok(StepAction::Performed { actions }) => StepStatus::Completed(actions),
                Ok(StepAction::Skipped { reason }) => StepStatus::Skipped(reason),
                Ok(StepAction::WouldPerform { actions }) => StepStatus::WouldPerform(actions),
                Err(err) => {
                    warn!(package = %step.package, error = %err, "install step failed");
                    failed = true;
                    StepStatus::Failed(err.to_string())
                }
            };
            steps.push(StepReport {
                package: step.package.clone(),
                variant: step.variant_key.clone(),
                fallback: step.fallback,
                status,
            });
        }

        Ok(InstallReport {
            host: self.host.describe(),
            dry_run: options.dry_run,
            steps,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::catalog::OsFamily;
    use tempfile::TempDir;

    fn write_catalog(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("install-packages.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn installer(tmp: &TempDir, catalog: &str) -> Installer {
        let catalog_path = write_catalog(tmp.path(), catalog);
        let paths = PathsConfig {
            data_home: tmp.path().to_path_buf(),
            install_root: None,
        };
        let config = InstallerConfig {
            catalog: catalog_path,
            ..Default::default()
        };
        Installer::new(config, paths, tmp.path().join("root"))
            .unwrap()
            .with_host(HostInfo::new(
                OsFamily::Linux,
                Some("ubuntu"),
                Some("24.04"),
                "amd64",
            ))
    }

    const CATALOG: &str = r#"{
        "packages": {
            "tool": {
                "variants": {
                    "linux": {
                        "os": "linux",
                        "method": "native-manager",
                        "package_name": "tool",
                        "check_command": "true"
                    }
                }
            },
            "other": {
                "variants": {
                    "linux": {
                        "os": "linux",
                        "method": "native-manager",
                        "package_name": "other",
                        "check_command": "false",
                        "prerequisites": ["tool"]
                    }
                }
            }
        },
        "profiles": {
            "everything": ["tool", "other"]
        }
    }"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_satisfied_plan_mutates_nothing() {
        let tmp = TempDir::new().unwrap();
        let installer = installer(&tmp, CATALOG);
        let report = installer
            .run(
                &["tool".to_string()],
                &InstallOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.ok());
        assert!(report.no_mutations());
        assert_eq!(report.steps.len(), 1);
        assert!(matches!(report.steps[0].status, StepStatus::Skipped(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dry_run_renders_commands() {
        let tmp = TempDir::new().unwrap();
        let installer = installer(&tmp, CATALOG);
        let options = InstallOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = installer
            .run(&["other".to_string()], &options, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.dry_run);
        // "tool" probes as installed even in dry-run; "other" renders
        // its would-be command.
        let other = report.steps.iter().find(|s| s.package == "other").unwrap();
        match &other.status {
            StepStatus::WouldPerform(actions) => {
                assert!(actions[0].contains("install"));
            }
            status => panic!("unexpected status: {:?}", status),
        }
    }

    #[tokio::test]
    async fn test_refused_while_update_lock_held() {
        let tmp = TempDir::new().unwrap();
        let installer = installer(&tmp, CATALOG);
        let lock_path = install_root_lock_path(&tmp.path().join("root"));
        let _lock = LockFile::acquire(&lock_path, "self-update commit").unwrap();

        let err = installer
            .run(
                &["tool".to_string()],
                &InstallOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_profile_expands() {
        let tmp = TempDir::new().unwrap();
        let installer = installer(&tmp, CATALOG);
        let plan = installer
            .plan(&["everything".to_string()], &InstallOptions::default())
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
        // Prerequisite ordering holds through profile expansion.
        assert_eq!(plan.package_order(), vec!["tool", "other"]);
    }
}
