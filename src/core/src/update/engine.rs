//! The self-update state machine.
//!
//! ```text
//!   Idle ──start──► Checking ──found──► Staging ──► BackingUp ──►
//!   Verifying ──► Committing ──► Done
//!   (any error) ──► RollingBack ──► previous version intact
//! ```
//!
//! The update is atomic from the user's perspective: after a successful
//! run every binary in the install root carries the new version and the
//! descriptor's hash; after a failed run every binary carries its
//! pre-update hash. A run killed mid-commit is detected on the next
//! invocation by comparing live hashes against the staged and backup
//! trees, and resolved in whichever direction restores a consistent
//! version.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PathsConfig, UpdateConfig};
use crate::error::{ErrorCode, PortunixError, Result};
use crate::fetch::{Downloader, ExpectedArtifact};
use crate::fsutil;
use crate::lockfile::LockFile;
use crate::update::descriptor::ReleaseDescriptor;
use crate::version;

/// Descriptor copy kept inside the staging tree for crash recovery.
const STAGED_DESCRIPTOR: &str = "release.json";

/// Name of the install-root lock file. The installer refuses to run
/// while this is held.
pub const INSTALL_ROOT_LOCK: &str = ".portunix.lock";

/// Path of the install-root lock.
pub fn install_root_lock_path(install_root: &Path) -> PathBuf {
    install_root.join(INSTALL_ROOT_LOCK)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outcomes
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of `update --check`.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub current: semver::Version,
    pub latest: semver::Version,
    pub newer: bool,
}

/// Result of a completed update run.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The release source offers nothing newer.
    AlreadyCurrent { current: semver::Version },
    /// The binary set was replaced.
    Updated {
        from: semver::Version,
        to: semver::Version,
        backup_dir: PathBuf,
    },
}

/// How a partial commit left by a killed run was resolved.
#[derive(Debug, Clone)]
pub enum Recovery {
    /// Remaining renames were completed; install root is on `version`.
    RolledForward { version: semver::Version },
    /// Backups were restored; install root is on the pre-update set.
    RolledBack,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Drives update sessions against one install root.
pub struct UpdateEngine {
    config: UpdateConfig,
    paths: PathsConfig,
    install_root: PathBuf,
    downloader: Downloader,
    current: semver::Version,
}

impl UpdateEngine {
    pub fn new(config: UpdateConfig, paths: PathsConfig, install_root: PathBuf) -> Result<Self> {
        let downloader = Downloader::new(config.download_timeout)?;
        Ok(Self {
            config,
            paths,
            install_root,
            downloader,
            current: version::current_version(),
        })
    }

    /// Override the version considered current (tests, forced reruns).
    pub fn with_current_version(mut self, current: semver::Version) -> Self {
        self.current = current;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Checking
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch the release descriptor and compare versions; mutates
    /// nothing.
    pub async fn check(&self) -> Result<CheckReport> {
        let descriptor: ReleaseDescriptor =
            self.downloader.fetch_json(&self.config.source).await?;
        Ok(CheckReport {
            newer: descriptor.version > self.current,
            current: self.current.clone(),
            latest: descriptor.version,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Full run
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a full update session.
    pub async fn update(&self, force: bool, cancel: &CancellationToken) -> Result<UpdateOutcome> {
        // Checking
        let descriptor: ReleaseDescriptor =
            self.downloader.fetch_json(&self.config.source).await?;
        if descriptor.version <= self.current && !force {
            info!(current = %self.current, latest = %descriptor.version, "already current");
            return Ok(UpdateOutcome::AlreadyCurrent {
                current: self.current.clone(),
            });
        }
        info!(from = %self.current, to = %descriptor.version, "update found");

        // Staging
        let staging_dir = self.paths.update_staging_dir(&descriptor.version);
        self.stage(&descriptor, &staging_dir, cancel).await?;

        // BackingUp
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let backup_dir = self.paths.update_backup_dir(&timestamp);
        let backed_up = self.back_up(&descriptor, &backup_dir)?;

        // Verifying
        self.verify(&descriptor, &staging_dir).await?;

        // Committing, under the exclusive install-root lock.
        let lock = LockFile::acquire(
            &install_root_lock_path(&self.install_root),
            "self-update commit",
        )?;
        let commit = self.commit(&descriptor, &staging_dir).await;
        drop(lock);

        match commit {
            Ok(()) => {
                let _ = std::fs::remove_dir_all(&staging_dir);
                info!(version = %descriptor.version, backup = %backup_dir.display(), "update committed");
                Ok(UpdateOutcome::Updated {
                    from: self.current.clone(),
                    to: descriptor.version,
                    backup_dir,
                })
            }
            Err(err) => {
                warn!(error = %err, "commit failed, rolling back");
                self.roll_back(&backed_up)?;
                Err(err)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Phases
    // ─────────────────────────────────────────────────────────────────────────

    async fn stage(
        &self,
        descriptor: &ReleaseDescriptor,
        staging_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        std::fs::create_dir_all(staging_dir)?;
        // Persist the descriptor first so a killed run can be resolved.
        fsutil::atomic_write(
            &staging_dir.join(STAGED_DESCRIPTOR),
            &serde_json::to_vec_pretty(descriptor)?,
        )?;

        for (name, artifact) in &descriptor.artifacts {
            let dest = staging_dir.join(name);
            let expected = ExpectedArtifact {
                sha256: artifact.sha256.clone(),
                size: artifact.size,
            };
            self.downloader
                .download(&artifact.url, &dest, Some(&expected), cancel)
                .await
                .map_err(|err| {
                    // Integrity and cancellation keep their own codes
                    // (and exit codes); only plain transport trouble is
                    // reported as a staging failure.
                    match err.kind() {
                        crate::error::ErrorKind::Cancelled
                        | crate::error::ErrorKind::Integrity => err,
                        _ => PortunixError::with_internal(
                            ErrorCode::StagingFailed,
                            format!("failed to stage {}", name),
                            err.to_string(),
                        ),
                    }
                })?;
            debug!(artifact = %name, "staged");
        }
        Ok(())
    }

    /// Copy every live binary named by the descriptor into the backup
    /// directory. Returns the (backup, live) pairs for rollback.
    fn back_up(
        &self,
        descriptor: &ReleaseDescriptor,
        backup_dir: &Path,
    ) -> Result<Vec<(PathBuf, PathBuf)>> {
        std::fs::create_dir_all(backup_dir)?;
        let mut pairs = Vec::new();
        for name in descriptor.artifacts.keys() {
            let live = self.install_root.join(name);
            if !live.exists() {
                // A brand-new helper has no pre-update state to save.
                debug!(binary = %name, "no live binary to back up");
                continue;
            }
            let backup = backup_dir.join(name);
            std::fs::copy(&live, &backup).map_err(|e| {
                PortunixError::with_internal(
                    ErrorCode::BackupFailed,
                    format!("cannot back up {}", live.display()),
                    e.to_string(),
                )
            })?;
            pairs.push((backup, live));
        }
        Ok(pairs)
    }

    async fn verify(&self, descriptor: &ReleaseDescriptor, staging_dir: &Path) -> Result<()> {
        for (name, artifact) in &descriptor.artifacts {
            let staged = staging_dir.join(name);

            // Integrity: the staged file must still match the
            // descriptor (a resumed or tampered staging tree must not
            // reach the install root).
            let actual = fsutil::sha256_file(&staged)?;
            if !actual.eq_ignore_ascii_case(&artifact.sha256) {
                return Err(PortunixError::checksum_mismatch(
                    staged.display().to_string(),
                    artifact.sha256.clone(),
                    actual,
                ));
            }

            // The staged binary must announce the release's version.
            fsutil::set_executable(&staged)?;
            let reported = version::probe_version(&staged).await.map_err(|err| {
                PortunixError::with_internal(
                    ErrorCode::VersionSkew,
                    format!("staged binary {} did not report a version", name),
                    err.to_string(),
                )
            })?;
            if reported != descriptor.version {
                return Err(PortunixError::new(
                    ErrorCode::VersionSkew,
                    format!(
                        "staged binary {} reports {} but the release is {}",
                        name, reported, descriptor.version
                    ),
                ));
            }
            debug!(binary = %name, version = %reported, "staged binary verified");
        }
        Ok(())
    }

    async fn commit(&self, descriptor: &ReleaseDescriptor, staging_dir: &Path) -> Result<()> {
        for name in descriptor.artifacts.keys() {
            let staged = staging_dir.join(name);
            let live = self.install_root.join(name);
            fsutil::atomic_replace(&staged, &live).map_err(|e| {
                PortunixError::with_internal(
                    ErrorCode::CommitFailed,
                    format!("failed to install {}", name),
                    e.to_string(),
                )
            })?;
            fsutil::set_executable(&live)?;
            debug!(binary = %name, "committed");
        }
        Ok(())
    }

    fn roll_back(&self, backed_up: &[(PathBuf, PathBuf)]) -> Result<()> {
        for (backup, live) in backed_up.iter().rev() {
            let restore = std::fs::copy(backup, live);
            if let Err(e) = restore {
                return Err(PortunixError::with_internal(
                    ErrorCode::RollbackFailed,
                    format!("failed to restore {}", live.display()),
                    e.to_string(),
                )
                .with_hint("restore manually from the backup directory, then rerun"));
            }
            let _ = fsutil::set_executable(live);
        }
        info!(count = backed_up.len(), "previous binary set restored");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Detect and resolve a partial commit left by a killed run.
    ///
    /// Returns `None` when there is nothing to recover. Rolls forward
    /// when every staged artifact is still present; otherwise restores
    /// from the newest backup.
    pub async fn recover(&self) -> Result<Option<Recovery>> {
        let update_dir = self.paths.data_home.join("update");
        let Some(staging_dir) = newest_dir_with_prefix(&update_dir, "staged-") else {
            return Ok(None);
        };
        let descriptor_path = staging_dir.join(STAGED_DESCRIPTOR);
        let Ok(bytes) = std::fs::read(&descriptor_path) else {
            // No descriptor means staging never completed; discard.
            let _ = std::fs::remove_dir_all(&staging_dir);
            return Ok(None);
        };
        let descriptor: ReleaseDescriptor = serde_json::from_slice(&bytes)?;

        let mut committed = 0usize;
        let mut pending = Vec::new();
        for (name, artifact) in &descriptor.artifacts {
            let live = self.install_root.join(name);
            let live_hash = fsutil::sha256_file(&live).ok();
            if live_hash.as_deref().is_some_and(|h| h.eq_ignore_ascii_case(&artifact.sha256)) {
                committed += 1;
            } else {
                pending.push(name.clone());
            }
        }

        if pending.is_empty() {
            // Fully committed; only the staging tree was left behind.
            let _ = std::fs::remove_dir_all(&staging_dir);
            return Ok(None);
        }
        if committed == 0 {
            // Nothing was committed; the staging tree is a harmless
            // leftover and the next update will rebuild it.
            return Ok(None);
        }

        warn!(
            committed,
            pending = pending.len(),
            version = %descriptor.version,
            "partial self-update commit detected"
        );

        let staged_complete = pending
            .iter()
            .all(|name| staging_dir.join(name).is_file());

        if staged_complete {
            for name in &pending {
                let staged = staging_dir.join(name);
                let live = self.install_root.join(name);
                fsutil::atomic_replace(&staged, &live)?;
                fsutil::set_executable(&live)?;
            }
            let _ = std::fs::remove_dir_all(&staging_dir);
            info!(version = %descriptor.version, "partial commit rolled forward");
            return Ok(Some(Recovery::RolledForward {
                version: descriptor.version,
            }));
        }

        let Some(backup_dir) = newest_dir_with_prefix(&update_dir, "backup-") else {
            return Err(PortunixError::new(
                ErrorCode::RecoveryRequired,
                "partial update detected but neither staged files nor backups are complete",
            )
            .with_hint("reinstall from the release archive"));
        };

        let mut pairs = Vec::new();
        for name in descriptor.artifacts.keys() {
            let backup = backup_dir.join(name);
            if backup.is_file() {
                pairs.push((backup, self.install_root.join(name)));
            }
        }
        self.roll_back(&pairs)?;
        let _ = std::fs::remove_dir_all(&staging_dir);
        info!("partial commit rolled back to the previous version");
        Ok(Some(Recovery::RolledBack))
    }
}

fn newest_dir_with_prefix(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix))
        })
        .collect();
    candidates.sort();
    candidates.pop()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests (pure pieces; full-session tests live in tests/)
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_newest_dir_with_prefix() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("staged-1.7.4")).unwrap();
        std::fs::create_dir_all(tmp.path().join("staged-1.7.5")).unwrap();
        std::fs::create_dir_all(tmp.path().join("backup-20250101000000")).unwrap();

        assert_eq!(
            newest_dir_with_prefix(tmp.path(), "staged-").unwrap(),
            tmp.path().join("staged-1.7.5")
        );
        assert_eq!(
            newest_dir_with_prefix(tmp.path(), "backup-").unwrap(),
            tmp.path().join("backup-20250101000000")
        );
        assert!(newest_dir_with_prefix(tmp.path(), "missing-").is_none());
    }

    #[test]
    fn test_install_root_lock_path() {
        assert_eq!(
            install_root_lock_path(Path::new("/opt/portunix")),
            Path::new("/opt/portunix/.portunix.lock")
        );
    }
}
