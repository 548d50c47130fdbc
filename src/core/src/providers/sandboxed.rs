//! The no-engine local sandbox provider.
//!
//! Environments are plain directories under the data home; `exec` runs
//! commands on the host with the environment's filesystem as working
//! directory, transfers are filesystem copies, and snapshots are whole
//! tree copies. Developer machines without Docker or a hypervisor can
//! still run environment workflows, and the suite exercises provider
//! semantics against it on any build host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ErrorCode, PortunixError, Result};
use crate::fsutil;
use crate::process::{run_captured, CommandOutput, CommandSpec};
use crate::providers::{
    EnvState, EnvironmentProvider, EnvironmentSpec, ExecRequest, IngressCredentials, SnapshotInfo,
};

/// Deadline for sandboxed exec.
const EXEC_DEADLINE: Duration = Duration::from_secs(600);

/// Directory-backed environments.
pub struct SandboxProvider {
    root: PathBuf,
}

impl SandboxProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn env_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn fs_dir(&self, id: &str) -> PathBuf {
        self.env_dir(id).join("fs")
    }

    fn snapshot_dir(&self, id: &str, label: &str) -> PathBuf {
        self.env_dir(id).join("snapshots").join(label)
    }

    fn state_file(&self, id: &str) -> PathBuf {
        self.env_dir(id).join("state")
    }

    fn read_state(&self, id: &str) -> Result<EnvState> {
        if !self.env_dir(id).is_dir() {
            return Err(PortunixError::new(
                ErrorCode::EnvironmentNotFound,
                format!("environment not found: {}", id),
            ));
        }
        let state = std::fs::read_to_string(self.state_file(id)).unwrap_or_default();
        Ok(match state.trim() {
            "running" => EnvState::Running,
            "stopped" => EnvState::Stopped,
            "defined" | "" => EnvState::Defined,
            _ => EnvState::Error,
        })
    }

    fn write_state(&self, id: &str, state: EnvState) -> Result<()> {
        let tag = match state {
            EnvState::Defined => "defined",
            EnvState::Running => "running",
            EnvState::Stopped => "stopped",
            EnvState::Error => "error",
        };
        fsutil::atomic_write(&self.state_file(id), tag.as_bytes())
    }

    fn guest_path(&self, id: &str, remote: &str) -> PathBuf {
        // Guest paths are rooted at the environment filesystem.
        self.fs_dir(id).join(remote.trim_start_matches('/'))
    }
}

#[async_trait]
impl EnvironmentProvider for SandboxProvider {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn create(&self, spec: &EnvironmentSpec, _cancel: &CancellationToken) -> Result<String> {
        let fs = self.fs_dir(&spec.name);
        if self.env_dir(&spec.name).is_dir() {
            debug!(name = %spec.name, "sandbox environment already exists");
            return Ok(spec.name.clone());
        }
        std::fs::create_dir_all(&fs)?;
        self.write_state(&spec.name, EnvState::Defined)?;
        info!(name = %spec.name, "sandbox environment created");
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str, _cancel: &CancellationToken) -> Result<()> {
        self.read_state(id)?;
        self.write_state(id, EnvState::Running)
    }

    async fn stop(&self, id: &str, _grace: Duration, _cancel: &CancellationToken) -> Result<()> {
        self.read_state(id)?;
        self.write_state(id, EnvState::Stopped)
    }

    async fn destroy(&self, id: &str, _purge_data: bool, _cancel: &CancellationToken) -> Result<()> {
        self.read_state(id)?;
        std::fs::remove_dir_all(self.env_dir(id))?;
        info!(id, "sandbox environment destroyed");
        Ok(())
    }

    async fn state(&self, id: &str, _cancel: &CancellationToken) -> Result<EnvState> {
        self.read_state(id)
    }

    async fn exec(
        &self,
        id: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        if self.read_state(id)? != EnvState::Running {
            return Err(PortunixError::new(
                ErrorCode::InvalidInput,
                format!("environment {} is not running", id),
            ));
        }
        let Some((program, args)) = request.argv.split_first() else {
            return Err(PortunixError::invalid_input("empty command"));
        };

        let cwd = match &request.work_dir {
            Some(dir) => self.guest_path(id, dir),
            None => self.fs_dir(id),
        };
        let mut spec = CommandSpec::new(program.clone(), args.iter().cloned()).with_cwd(cwd);
        for (key, value) in &request.env {
            spec = spec.with_env(key.clone(), value.clone());
        }
        if let Some(stdin) = &request.stdin {
            spec = spec.with_stdin(stdin.clone());
        }
        run_captured(&spec, Some(EXEC_DEADLINE), cancel).await
    }

    async fn copy_in(
        &self,
        id: &str,
        local: &Path,
        remote: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.read_state(id)?;
        let target = self.guest_path(id, remote);
        if local.is_dir() {
            fsutil::copy_dir_all(local, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(local, &target)?;
        }
        Ok(())
    }

    async fn copy_out(
        &self,
        id: &str,
        remote: &str,
        local: &Path,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.read_state(id)?;
        let source = self.guest_path(id, remote);
        if source.is_dir() {
            fsutil::copy_dir_all(&source, local)?;
        } else {
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, local)?;
        }
        Ok(())
    }

    async fn snapshot_create(
        &self,
        id: &str,
        label: &str,
        _cancel: &CancellationToken,
    ) -> Result<SnapshotInfo> {
        self.read_state(id)?;
        let snapshot = self.snapshot_dir(id, label);
        if snapshot.exists() {
            std::fs::remove_dir_all(&snapshot)?;
        }
        fsutil::copy_dir_all(&self.fs_dir(id), &snapshot)?;
        info!(id, label, "sandbox snapshot created");
        Ok(SnapshotInfo {
            environment: id.to_string(),
            label: label.to_string(),
            created_at: Some(Utc::now()),
        })
    }

    async fn snapshot_list(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<SnapshotInfo>> {
        self.read_state(id)?;
        let dir = self.env_dir(id).join("snapshots");
        let mut snapshots = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    let created = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .ok()
                        .map(chrono::DateTime::from);
                    snapshots.push(SnapshotInfo {
                        environment: id.to_string(),
                        label: entry.file_name().to_string_lossy().into_owned(),
                        created_at: created,
                    });
                }
            }
        }
        snapshots.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(snapshots)
    }

    async fn snapshot_revert(
        &self,
        id: &str,
        label: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.read_state(id)?;
        let snapshot = self.snapshot_dir(id, label);
        if !snapshot.is_dir() {
            return Err(PortunixError::new(
                ErrorCode::SnapshotNotFound,
                format!("no snapshot {} for environment {}", label, id),
            ));
        }
        // Revert implies stop + rewind.
        self.write_state(id, EnvState::Stopped)?;
        let fs = self.fs_dir(id);
        std::fs::remove_dir_all(&fs)?;
        fsutil::copy_dir_all(&snapshot, &fs)?;
        info!(id, label, "sandbox environment reverted");
        Ok(())
    }

    async fn snapshot_delete(
        &self,
        id: &str,
        label: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.read_state(id)?;
        let snapshot = self.snapshot_dir(id, label);
        if !snapshot.is_dir() {
            return Err(PortunixError::new(
                ErrorCode::SnapshotNotFound,
                format!("no snapshot {} for environment {}", label, id),
            ));
        }
        std::fs::remove_dir_all(&snapshot)?;
        Ok(())
    }

    async fn ssh_deploy(
        &self,
        id: &str,
        binaries: &[PathBuf],
        remote_dir: &str,
        credentials: &IngressCredentials,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.read_state(id)?;
        // No real users in a directory sandbox; record the key material
        // where a real guest would keep it.
        if let Some(key) = &credentials.public_key {
            let ssh_dir = self
                .fs_dir(id)
                .join("home")
                .join(&credentials.user)
                .join(".ssh");
            std::fs::create_dir_all(&ssh_dir)?;
            fsutil::atomic_write(
                &ssh_dir.join("authorized_keys"),
                format!("{}\n", key.trim()).as_bytes(),
            )?;
        }

        let target_dir = self.guest_path(id, remote_dir);
        std::fs::create_dir_all(&target_dir)?;
        for binary in binaries {
            let name = binary
                .file_name()
                .ok_or_else(|| PortunixError::invalid_input("binary path has no file name"))?;
            let target = target_dir.join(name);
            std::fs::copy(binary, &target)?;
            fsutil::set_executable(&target)?;
        }
        info!(id, binaries = binaries.len(), "binary set deployed into sandbox");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn spec(name: &str) -> EnvironmentSpec {
        EnvironmentSpec {
            name: name.to_string(),
            image: "scratch".to_string(),
            mounts: vec![],
            ports: vec![],
            env: HashMap::new(),
            resources: Default::default(),
            credentials: None,
        }
    }

    async fn provider() -> (SandboxProvider, TempDir) {
        let tmp = TempDir::new().unwrap();
        (SandboxProvider::new(tmp.path().join("sandbox")), tmp)
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (provider, _tmp) = provider().await;
        let cancel = CancellationToken::new();

        let id = provider.create(&spec("dev"), &cancel).await.unwrap();
        assert_eq!(provider.state(&id, &cancel).await.unwrap(), EnvState::Defined);

        provider.start(&id, &cancel).await.unwrap();
        assert_eq!(provider.state(&id, &cancel).await.unwrap(), EnvState::Running);

        provider
            .stop(&id, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(provider.state(&id, &cancel).await.unwrap(), EnvState::Stopped);

        provider.destroy(&id, true, &cancel).await.unwrap();
        assert!(provider.state(&id, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (provider, _tmp) = provider().await;
        let cancel = CancellationToken::new();
        let a = provider.create(&spec("dev"), &cancel).await.unwrap();
        provider.start(&a, &cancel).await.unwrap();
        // Re-creating the same name neither fails nor resets state.
        let b = provider.create(&spec("dev"), &cancel).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.state(&b, &cancel).await.unwrap(), EnvState::Running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_and_transfer() {
        let (provider, tmp) = provider().await;
        let cancel = CancellationToken::new();
        let id = provider.create(&spec("dev"), &cancel).await.unwrap();
        provider.start(&id, &cancel).await.unwrap();

        let local = tmp.path().join("input.txt");
        std::fs::write(&local, "payload").unwrap();
        provider
            .copy_in(&id, &local, "/work/input.txt", &cancel)
            .await
            .unwrap();

        let request = ExecRequest {
            argv: vec!["cat".into(), "work/input.txt".into()],
            ..Default::default()
        };
        let output = provider.exec(&id, &request, &cancel).await.unwrap();
        assert_eq!(output.stdout, "payload");

        let out = tmp.path().join("output.txt");
        provider
            .copy_out(&id, "/work/input.txt", &out, &cancel)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_snapshot_revert_restores_tree() {
        let (provider, _tmp) = provider().await;
        let cancel = CancellationToken::new();
        let id = provider.create(&spec("dev"), &cancel).await.unwrap();
        provider.start(&id, &cancel).await.unwrap();

        let file = provider.guest_path(&id, "/data.txt");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "before").unwrap();

        provider.snapshot_create(&id, "clean", &cancel).await.unwrap();
        std::fs::write(&file, "mutated").unwrap();
        std::fs::write(provider.guest_path(&id, "/extra.txt"), "junk").unwrap();

        provider.snapshot_revert(&id, "clean", &cancel).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "before");
        assert!(!provider.guest_path(&id, "/extra.txt").exists());
        // Revert implies stop.
        assert_eq!(provider.state(&id, &cancel).await.unwrap(), EnvState::Stopped);
    }

    #[tokio::test]
    async fn test_snapshot_delete_and_missing() {
        let (provider, _tmp) = provider().await;
        let cancel = CancellationToken::new();
        let id = provider.create(&spec("dev"), &cancel).await.unwrap();

        provider.snapshot_create(&id, "s1", &cancel).await.unwrap();
        assert_eq!(provider.snapshot_list(&id, &cancel).await.unwrap().len(), 1);
        provider.snapshot_delete(&id, "s1", &cancel).await.unwrap();
        assert!(provider.snapshot_list(&id, &cancel).await.unwrap().is_empty());

        let err = provider
            .snapshot_revert(&id, "ghost", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SnapshotNotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ssh_deploy_places_binaries() {
        let (provider, tmp) = provider().await;
        let cancel = CancellationToken::new();
        let id = provider.create(&spec("dev"), &cancel).await.unwrap();

        let binary = tmp.path().join("portunix");
        std::fs::write(&binary, "#!/bin/sh\n").unwrap();

        let credentials = IngressCredentials {
            user: "portunix".into(),
            public_key: Some("ssh-ed25519 AAAA test@host".into()),
            port: None,
        };
        provider
            .ssh_deploy(&id, &[binary], "/opt/portunix", &credentials, &cancel)
            .await
            .unwrap();

        let deployed = provider.guest_path(&id, "/opt/portunix/portunix");
        assert!(fsutil::is_executable(&deployed));
        let keys = provider.guest_path(&id, "/home/portunix/.ssh/authorized_keys");
        assert!(std::fs::read_to_string(keys).unwrap().contains("ssh-ed25519"));
    }
}
