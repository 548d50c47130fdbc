//! Installation method execution.
//!
//! The method vocabulary is closed: native-manager, archive-download,
//! script, installer-binary. Every method supports dry-run (print the
//! exact commands, mutate nothing) and an is-installed probe consulted
//! before doing work, so re-running a satisfied plan performs zero
//! state mutations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive;
use crate::error::{ErrorCode, PortunixError, Result};
use crate::fetch::{Downloader, ExpectedArtifact};
use crate::fsutil;
use crate::install::catalog::{InstallMethodKind, Variant};
use crate::install::plan::PlanStep;
use crate::process::{run_captured, CommandSpec};

// ═══════════════════════════════════════════════════════════════════════════════
// Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// What executing one plan step did.
#[derive(Debug, Clone)]
pub enum StepAction {
    /// Work was performed; `actions` lists what happened.
    Performed { actions: Vec<String> },
    /// The probe reported the package as already installed.
    Skipped { reason: String },
    /// Dry-run: `actions` lists what would have happened.
    WouldPerform { actions: Vec<String> },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Executes individual plan steps.
pub struct MethodRunner<'a> {
    pub downloader: &'a Downloader,
    /// Data home, used for download caches and relative targets.
    pub data_home: &'a Path,
    /// Directory of the catalog file; bundled scripts resolve here.
    pub catalog_dir: &'a Path,
    pub timeout: Duration,
    pub dry_run: bool,
    pub force: bool,
    pub cancel: &'a CancellationToken,
}

impl MethodRunner<'_> {
    /// Execute one step.
    pub async fn run(&self, step: &PlanStep) -> Result<StepAction> {
        // Idempotence: consult the probe first unless forced.
        if !self.force {
            if let Some(true) = self.is_installed(&step.variant).await {
                return Ok(StepAction::Skipped {
                    reason: "already installed".to_string(),
                });
            }
        }

        match step.variant.method {
            InstallMethodKind::NativeManager => self.native_manager(step).await,
            InstallMethodKind::ArchiveDownload => self.archive_download(step).await,
            InstallMethodKind::Script => self.script(step).await,
            InstallMethodKind::InstallerBinary => self.installer_binary(step).await,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Probes
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether the variant's subject is already installed. `None` when
    /// no probe is available.
    async fn is_installed(&self, variant: &Variant) -> Option<bool> {
        if let Some(check) = &variant.check_command {
            let spec = shell_command(check);
            let output = run_captured(&spec, Some(self.timeout), self.cancel).await.ok()?;
            return Some(output.success());
        }

        if variant.method == InstallMethodKind::NativeManager {
            let manager = self.resolve_manager(variant).ok()?;
            let package = variant.package_name.as_deref()?;
            let probe = manager_probe(&manager, package)?;
            let output = run_captured(&probe, Some(self.timeout), self.cancel).await.ok()?;
            return Some(output.success());
        }

        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // native-manager
    // ─────────────────────────────────────────────────────────────────────────

    async fn native_manager(&self, step: &PlanStep) -> Result<StepAction> {
        let variant = &step.variant;
        let manager = self.resolve_manager(variant)?;
        let package = variant
            .package_name
            .as_deref()
            .ok_or_else(|| PortunixError::internal("validated variant lost package_name"))?;
        let spec = manager_install(&manager, package);

        let mut actions = vec![spec.render()];
        if self.dry_run {
            actions.extend(variant.post_install.iter().cloned());
            return Ok(StepAction::WouldPerform { actions });
        }

        info!(package = %step.package, manager = %manager, "delegating to native manager");
        run_captured(&spec, Some(self.timeout), self.cancel)
            .await?
            .into_result(&manager)?;

        actions.extend(self.run_hooks(&variant.post_install).await?);
        Ok(StepAction::Performed { actions })
    }

    fn resolve_manager(&self, variant: &Variant) -> Result<String> {
        if let Some(manager) = &variant.manager {
            return Ok(manager.clone());
        }
        detect_manager().ok_or_else(|| {
            PortunixError::new(
                ErrorCode::ProviderUnavailable,
                "no supported package manager found on this host",
            )
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // archive-download
    // ─────────────────────────────────────────────────────────────────────────

    async fn archive_download(&self, step: &PlanStep) -> Result<StepAction> {
        let variant = &step.variant;
        let url = variant
            .url
            .as_deref()
            .ok_or_else(|| PortunixError::internal("validated variant lost url"))?;
        let sha256 = variant
            .sha256
            .as_deref()
            .ok_or_else(|| PortunixError::internal("validated variant lost sha256"))?;

        let target = self.resolve_target(variant, &step.package);
        let cache = self.cache_path(url);

        let mut actions = vec![
            format!("download {} -> {}", url, cache.display()),
            format!("verify sha256 {}", sha256),
            format!("extract {} -> {}", cache.display(), target.display()),
        ];
        if self.dry_run {
            actions.extend(variant.post_install.iter().cloned());
            return Ok(StepAction::WouldPerform { actions });
        }

        let expected = ExpectedArtifact {
            sha256: sha256.to_string(),
            size: None,
        };
        self.downloader
            .download(url, &cache, Some(&expected), self.cancel)
            .await?;
        archive::extract(&cache, &target)?;
        mark_binaries_executable(&target)?;

        actions.extend(self.run_hooks(&variant.post_install).await?);
        Ok(StepAction::Performed { actions })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // script
    // ─────────────────────────────────────────────────────────────────────────

    async fn script(&self, step: &PlanStep) -> Result<StepAction> {
        let variant = &step.variant;
        let script_rel = variant
            .script
            .as_deref()
            .ok_or_else(|| PortunixError::internal("validated variant lost script"))?;
        let script = self.catalog_dir.join(script_rel);

        // Bundled scripts ship with a checksum; refuse tampered ones.
        if let Some(sha256) = &variant.sha256 {
            let actual = fsutil::sha256_file(&script)?;
            if !actual.eq_ignore_ascii_case(sha256) {
                return Err(PortunixError::checksum_mismatch(
                    script.display().to_string(),
                    sha256.clone(),
                    actual,
                ));
            }
        }

        let spec = interpreter_command(&script);
        let actions = vec![spec.render()];
        if self.dry_run {
            return Ok(StepAction::WouldPerform { actions });
        }

        run_captured(&spec, Some(self.timeout), self.cancel)
            .await?
            .into_result(&script.display().to_string())?;
        Ok(StepAction::Performed { actions })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // installer-binary
    // ─────────────────────────────────────────────────────────────────────────

    async fn installer_binary(&self, step: &PlanStep) -> Result<StepAction> {
        let variant = &step.variant;
        let url = variant
            .url
            .as_deref()
            .ok_or_else(|| PortunixError::internal("validated variant lost url"))?;
        let sha256 = variant
            .sha256
            .as_deref()
            .ok_or_else(|| PortunixError::internal("validated variant lost sha256"))?;

        let cache = self.cache_path(url);
        let spec = installer_command(&cache, &variant.silent_args);

        let actions = vec![
            format!("download {} -> {}", url, cache.display()),
            spec.render(),
        ];
        if self.dry_run {
            return Ok(StepAction::WouldPerform { actions });
        }

        let expected = ExpectedArtifact {
            sha256: sha256.to_string(),
            size: None,
        };
        self.downloader
            .download(url, &cache, Some(&expected), self.cancel)
            .await?;
        fsutil::set_executable(&cache)?;
        run_captured(&spec, Some(self.timeout), self.cancel)
            .await?
            .into_result("installer")?;
        Ok(StepAction::Performed { actions })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shared plumbing
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_hooks(&self, hooks: &[String]) -> Result<Vec<String>> {
        let mut performed = Vec::new();
        for hook in hooks {
            debug!(hook = %hook, "running post-install hook");
            let spec = shell_command(hook);
            run_captured(&spec, Some(self.timeout), self.cancel)
                .await?
                .into_result("post-install hook")?;
            performed.push(hook.clone());
        }
        Ok(performed)
    }

    fn resolve_target(&self, variant: &Variant, package: &str) -> PathBuf {
        match &variant.target_dir {
            Some(target) => {
                let path = Path::new(target);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.data_home.join(path)
                }
            }
            None => self.data_home.join("tools").join(package),
        }
    }

    fn cache_path(&self, url: &str) -> PathBuf {
        let name = url.rsplit('/').next().unwrap_or("artifact");
        self.data_home.join("cache").join(name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command tables
// ═══════════════════════════════════════════════════════════════════════════════

const LINUX_MANAGERS: &[&str] = &["apt-get", "dnf", "yum", "pacman", "zypper", "apk", "snap"];
const MACOS_MANAGERS: &[&str] = &["brew"];
const WINDOWS_MANAGERS: &[&str] = &["winget", "choco"];

/// First supported manager present on PATH.
pub fn detect_manager() -> Option<String> {
    let candidates: &[&str] = if cfg!(target_os = "windows") {
        WINDOWS_MANAGERS
    } else if cfg!(target_os = "macos") {
        MACOS_MANAGERS
    } else {
        LINUX_MANAGERS
    };
    candidates
        .iter()
        .find(|candidate| which::which(candidate).is_ok())
        .map(|candidate| (*candidate).to_string())
}

/// The install invocation for a manager.
pub fn manager_install(manager: &str, package: &str) -> CommandSpec {
    match manager {
        "apt-get" => CommandSpec::new("apt-get", ["install", "-y", package])
            .with_env("DEBIAN_FRONTEND", "noninteractive"),
        "dnf" => CommandSpec::new("dnf", ["install", "-y", package]),
        "yum" => CommandSpec::new("yum", ["install", "-y", package]),
        "pacman" => CommandSpec::new("pacman", ["-S", "--noconfirm", package]),
        "zypper" => CommandSpec::new("zypper", ["--non-interactive", "install", package]),
        "apk" => CommandSpec::new("apk", ["add", package]),
        "snap" => CommandSpec::new("snap", ["install", package]),
        "brew" => CommandSpec::new("brew", ["install", package]),
        "winget" => CommandSpec::new(
            "winget",
            [
                "install",
                "--silent",
                "--accept-package-agreements",
                "--accept-source-agreements",
                "--id",
                package,
            ],
        ),
        "choco" => CommandSpec::new("choco", ["install", "-y", package]),
        other => CommandSpec::new(other, ["install", package]),
    }
}

/// The is-installed probe for a manager, when one exists.
pub fn manager_probe(manager: &str, package: &str) -> Option<CommandSpec> {
    let spec = match manager {
        "apt-get" => CommandSpec::new("dpkg", ["-s", package]),
        "dnf" | "yum" | "zypper" => CommandSpec::new("rpm", ["-q", package]),
        "pacman" => CommandSpec::new("pacman", ["-Qi", package]),
        "apk" => CommandSpec::new("apk", ["info", "-e", package]),
        "snap" => CommandSpec::new("snap", ["list", package]),
        "brew" => CommandSpec::new("brew", ["list", package]),
        "winget" => CommandSpec::new("winget", ["list", "--exact", "--id", package]),
        "choco" => CommandSpec::new("choco", ["list", "--exact", package]),
        _ => return None,
    };
    Some(spec)
}

/// Run a catalog-authored command line through the OS shell.
fn shell_command(line: &str) -> CommandSpec {
    if cfg!(target_os = "windows") {
        CommandSpec::new("powershell", ["-NoProfile", "-Command", line])
    } else {
        CommandSpec::new("sh", ["-c", line])
    }
}

/// Interpreter invocation for a bundled script.
fn interpreter_command(script: &Path) -> CommandSpec {
    let script = script.display().to_string();
    if cfg!(target_os = "windows") {
        CommandSpec::new(
            "powershell",
            vec![
                "-NoProfile".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-File".to_string(),
                script,
            ],
        )
    } else {
        CommandSpec::new("sh", vec![script])
    }
}

/// Silent invocation for a downloaded installer.
fn installer_command(installer: &Path, silent_args: &[String]) -> CommandSpec {
    let path = installer.display().to_string();
    let extension = installer
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "msi" => {
            let mut args = vec!["/i".to_string(), path, "/qn".to_string()];
            args.extend(silent_args.iter().cloned());
            CommandSpec::new("msiexec", args)
        }
        "deb" => {
            let mut args = vec!["-i".to_string(), path];
            args.extend(silent_args.iter().cloned());
            CommandSpec::new("dpkg", args)
        }
        _ => CommandSpec::new(path, silent_args.iter().cloned()),
    }
}

/// Make files under `bin/` and top-level files executable after an
/// archive extraction.
fn mark_binaries_executable(target: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let bin = target.join("bin");
        for dir in [target, bin.as_path()] {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() {
                    fsutil::set_executable(&path)?;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = target;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_install_commands() {
        assert_eq!(
            manager_install("apt-get", "powershell").render(),
            "apt-get install -y powershell"
        );
        assert_eq!(
            manager_install("snap", "powershell").render(),
            "snap install powershell"
        );
        assert_eq!(
            manager_install("pacman", "tool").render(),
            "pacman -S --noconfirm tool"
        );
    }

    #[test]
    fn test_manager_probe_commands() {
        assert_eq!(
            manager_probe("apt-get", "powershell").unwrap().render(),
            "dpkg -s powershell"
        );
        assert_eq!(manager_probe("dnf", "x").unwrap().render(), "rpm -q x");
        assert!(manager_probe("unknown-manager", "x").is_none());
    }

    #[test]
    fn test_installer_command_by_extension() {
        let msi = installer_command(Path::new("/tmp/setup.msi"), &[]);
        assert_eq!(msi.render(), "msiexec /i /tmp/setup.msi /qn");

        let deb = installer_command(Path::new("/tmp/tool.deb"), &[]);
        assert_eq!(deb.render(), "dpkg -i /tmp/tool.deb");

        let exe = installer_command(Path::new("/tmp/setup.exe"), &["/S".to_string()]);
        assert_eq!(exe.render(), "/tmp/setup.exe /S");
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_command_wraps_line() {
        assert_eq!(shell_command("echo hi").render(), "sh -c 'echo hi'");
    }
}
