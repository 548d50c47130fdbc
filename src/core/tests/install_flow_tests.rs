//! Installer flows against a real catalog file, with shell scripts
//! standing in for native managers and bundled install scripts.

#![cfg(unix)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use portunix_core::config::{InstallerConfig, PathsConfig};
use portunix_core::error::ErrorCode;
use portunix_core::install::catalog::OsFamily;
use portunix_core::install::{HostInfo, InstallOptions, Installer, StepStatus};

struct Fixture {
    tmp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            tmp: TempDir::new().unwrap(),
        }
    }

    fn path(&self) -> &Path {
        self.tmp.path()
    }

    fn installer(&self, catalog: &str, host: HostInfo) -> Installer {
        let catalog_path = self.path().join("install-packages.json");
        std::fs::write(&catalog_path, catalog).unwrap();
        let paths = PathsConfig {
            data_home: self.path().to_path_buf(),
            install_root: None,
        };
        let config = InstallerConfig {
            catalog: catalog_path,
            ..Default::default()
        };
        Installer::new(config, paths, self.path().join("opt"))
            .unwrap()
            .with_host(host)
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }
}

fn ubuntu(version: &str) -> HostInfo {
    HostInfo::new(OsFamily::Linux, Some("ubuntu"), Some(version), "amd64")
}

#[tokio::test]
async fn unsupported_distro_version_falls_back_and_logs_the_decision() {
    let fixture = Fixture::new();
    // The "snap" fallback is a script that records its execution, so
    // the test observes which variant actually ran.
    let marker = fixture.marker("snap-ran");
    std::fs::write(
        fixture.path().join("install-snap.sh"),
        format!("#!/bin/sh\ntouch {}\n", marker.display()),
    )
    .unwrap();

    let catalog = format!(
        r#"{{
        "packages": {{
            "powershell": {{
                "variants": {{
                    "ubuntu": {{
                        "os": "linux",
                        "distribution": {{
                            "id": "ubuntu",
                            "versions": ["20.04", "22.04", "24.04"]
                        }},
                        "method": "native-manager",
                        "package_name": "powershell"
                    }},
                    "snap": {{
                        "os": "linux",
                        "method": "script",
                        "script": "install-snap.sh",
                        "check_command": "test -f {marker}"
                    }}
                }},
                "fallback_variants": ["snap"]
            }}
        }}
    }}"#,
        marker = marker.display()
    );

    let installer = fixture.installer(&catalog, ubuntu("25.04"));
    let report = installer
        .run(
            &["powershell".to_string()],
            &InstallOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.ok(), "report: {:?}", report);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].variant, "snap");
    assert!(report.steps[0].fallback);
    assert!(marker.exists());
}

#[tokio::test]
async fn rerunning_a_satisfied_plan_is_a_no_op() {
    let fixture = Fixture::new();
    let marker = fixture.marker("tool-installed");
    std::fs::write(
        fixture.path().join("install-tool.sh"),
        format!("#!/bin/sh\ntouch {}\n", marker.display()),
    )
    .unwrap();

    let catalog = format!(
        r#"{{
        "packages": {{
            "tool": {{
                "variants": {{
                    "linux": {{
                        "os": "linux",
                        "method": "script",
                        "script": "install-tool.sh",
                        "check_command": "test -f {marker}"
                    }}
                }}
            }}
        }}
    }}"#,
        marker = marker.display()
    );

    let installer = fixture.installer(&catalog, ubuntu("24.04"));
    let options = InstallOptions::default();
    let cancel = CancellationToken::new();

    let first = installer.run(&["tool".to_string()], &options, &cancel).await.unwrap();
    assert!(matches!(first.steps[0].status, StepStatus::Completed(_)));
    let modified = std::fs::metadata(&marker).unwrap().modified().unwrap();

    // Second run: the probe reports satisfied, nothing mutates.
    let second = installer.run(&["tool".to_string()], &options, &cancel).await.unwrap();
    assert!(second.no_mutations());
    assert_eq!(std::fs::metadata(&marker).unwrap().modified().unwrap(), modified);

    // And the dry-run rendering of a satisfied plan carries no actions.
    let dry = installer
        .run(
            &["tool".to_string()],
            &InstallOptions {
                dry_run: true,
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();
    assert!(matches!(dry.steps[0].status, StepStatus::Skipped(_)));
}

#[tokio::test]
async fn failing_step_aborts_the_plan_and_names_survivors() {
    let fixture = Fixture::new();
    std::fs::write(
        fixture.path().join("boom.sh"),
        "#!/bin/sh\necho 'no space left' >&2\nexit 28\n",
    )
    .unwrap();

    let catalog = r#"{
        "packages": {
            "base": {
                "variants": {
                    "linux": {
                        "os": "linux",
                        "method": "script",
                        "script": "boom.sh"
                    }
                }
            },
            "app": {
                "variants": {
                    "linux": {
                        "os": "linux",
                        "method": "native-manager",
                        "package_name": "app",
                        "prerequisites": ["base"]
                    }
                }
            }
        }
    }"#;

    let installer = fixture.installer(catalog, ubuntu("24.04"));
    let report = installer
        .run(
            &["app".to_string()],
            &InstallOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!report.ok());
    let base = report.steps.iter().find(|s| s.package == "base").unwrap();
    match &base.status {
        StepStatus::Failed(detail) => assert!(detail.contains("exit code 28")),
        status => panic!("expected failure, got {:?}", status),
    }
    let app = report.steps.iter().find(|s| s.package == "app").unwrap();
    assert_eq!(app.status, StepStatus::NotRun);
}

#[tokio::test]
async fn no_variant_and_no_fallback_names_every_attempt() {
    let fixture = Fixture::new();
    let catalog = r#"{
        "packages": {
            "winonly": {
                "variants": {
                    "windows": {
                        "os": "windows",
                        "method": "native-manager",
                        "manager": "winget",
                        "package_name": "Tool.Tool"
                    }
                }
            }
        }
    }"#;

    let installer = fixture.installer(catalog, ubuntu("24.04"));
    let err = installer
        .run(
            &["winonly".to_string()],
            &InstallOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::NoMatchingVariant);
    assert_eq!(err.exit_code(), 1);
    let message = err.to_string();
    assert!(message.contains("linux/ubuntu 24.04 amd64"));
    assert!(message.contains("windows:"));
}

#[tokio::test]
async fn tampered_bundled_script_is_refused() {
    let fixture = Fixture::new();
    std::fs::write(fixture.path().join("setup.sh"), "#!/bin/sh\nexit 0\n").unwrap();

    let catalog = r#"{
        "packages": {
            "tool": {
                "variants": {
                    "linux": {
                        "os": "linux",
                        "method": "script",
                        "script": "setup.sh",
                        "sha256": "0000000000000000000000000000000000000000000000000000000000000000"
                    }
                }
            }
        }
    }"#;

    let installer = fixture.installer(catalog, ubuntu("24.04"));
    let report = installer
        .run(
            &["tool".to_string()],
            &InstallOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!report.ok());
    match &report.steps[0].status {
        StepStatus::Failed(detail) => assert!(detail.contains("checksum")),
        status => panic!("expected checksum failure, got {:?}", status),
    }
}
