//! VirtualBox virtual machines via `VBoxManage`.
//!
//! Environments are clones of a registered template VM. An SSH port
//! forward (`natpf1`) is attached at creation so exec, transfer, and
//! deployment use the same SSH plumbing as the QEMU provider. Snapshots
//! map directly onto the `VBoxManage snapshot` family.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, PortunixError, Result};
use crate::fsutil;
use crate::process::{run_captured, CommandOutput, CommandSpec};
use crate::providers::ssh::{shell_join, shell_quote, SshTarget};
use crate::providers::{
    EnvState, EnvironmentProvider, EnvironmentSpec, ExecRequest, IngressCredentials, SnapshotInfo,
};

const VBOX_DEADLINE: Duration = Duration::from_secs(300);

/// Per-VM metadata persisted under the data home (no secrets).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VboxMeta {
    template: String,
    ssh_user: String,
    ssh_port: u16,
}

/// VirtualBox-backed environments.
pub struct VirtualBoxProvider {
    meta_root: PathBuf,
}

impl VirtualBoxProvider {
    pub fn new(meta_root: impl Into<PathBuf>) -> Self {
        Self {
            meta_root: meta_root.into(),
        }
    }

    fn meta_file(&self, id: &str) -> PathBuf {
        self.meta_root.join(format!("{}.json", id))
    }

    fn meta(&self, id: &str) -> Result<VboxMeta> {
        let bytes = std::fs::read(self.meta_file(id)).map_err(|_| {
            PortunixError::new(
                ErrorCode::EnvironmentNotFound,
                format!("environment not found: {}", id),
            )
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn ssh_target(&self, meta: &VboxMeta) -> SshTarget {
        SshTarget::loopback(meta.ssh_port, meta.ssh_user.clone())
    }

    async fn manage(
        &self,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        run_captured(&CommandSpec::new("VBoxManage", args), Some(VBOX_DEADLINE), cancel)
            .await?
            .into_result("VBoxManage")
    }

    async fn vm_state_raw(&self, id: &str, cancel: &CancellationToken) -> Result<String> {
        let output = run_captured(
            &CommandSpec::new(
                "VBoxManage",
                ["showvminfo", id, "--machinereadable"],
            ),
            Some(VBOX_DEADLINE),
            cancel,
        )
        .await?;
        if !output.success() {
            return Err(PortunixError::new(
                ErrorCode::EnvironmentNotFound,
                format!("environment not found: {}", id),
            ));
        }
        Ok(parse_vm_state(&output.stdout))
    }
}

#[async_trait]
impl EnvironmentProvider for VirtualBoxProvider {
    fn name(&self) -> &'static str {
        "virtualbox"
    }

    fn is_available(&self) -> bool {
        which::which("VBoxManage").is_ok()
    }

    async fn create(&self, spec: &EnvironmentSpec, cancel: &CancellationToken) -> Result<String> {
        if self.meta_file(&spec.name).exists() {
            debug!(name = %spec.name, "virtualbox environment already exists");
            return Ok(spec.name.clone());
        }

        self.manage(
            vec![
                "clonevm".into(),
                spec.image.clone(),
                "--name".into(),
                spec.name.clone(),
                "--register".into(),
            ],
            cancel,
        )
        .await?;

        if let Some(memory) = spec.resources.memory_mb {
            self.manage(
                vec![
                    "modifyvm".into(),
                    spec.name.clone(),
                    "--memory".into(),
                    memory.to_string(),
                ],
                cancel,
            )
            .await?;
        }
        if let Some(cpus) = spec.resources.cpus {
            self.manage(
                vec![
                    "modifyvm".into(),
                    spec.name.clone(),
                    "--cpus".into(),
                    (cpus.max(1.0) as u32).to_string(),
                ],
                cancel,
            )
            .await?;
        }

        let credentials = spec.credentials.as_ref();
        let ssh_port = credentials
            .and_then(|c| c.port)
            .or_else(|| spec.ports.iter().find(|p| p.guest == 22).map(|p| p.host))
            .unwrap_or(2222);
        self.manage(
            vec![
                "modifyvm".into(),
                spec.name.clone(),
                "--natpf1".into(),
                format!("ssh,tcp,127.0.0.1,{},,22", ssh_port),
            ],
            cancel,
        )
        .await?;

        let meta = VboxMeta {
            template: spec.image.clone(),
            ssh_user: credentials.map_or_else(|| "root".to_string(), |c| c.user.clone()),
            ssh_port,
        };
        std::fs::create_dir_all(&self.meta_root)?;
        fsutil::atomic_write(&self.meta_file(&spec.name), &serde_json::to_vec_pretty(&meta)?)?;
        info!(name = %spec.name, template = %spec.image, ssh_port, "virtualbox environment created");
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.meta(id)?;
        self.manage(
            vec!["startvm".into(), id.to_string(), "--type".into(), "headless".into()],
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration, cancel: &CancellationToken) -> Result<()> {
        self.meta(id)?;
        // ACPI first, then a hard poweroff once the grace expires.
        if let Err(err) = self
            .manage(
                vec!["controlvm".into(), id.to_string(), "acpipowerbutton".into()],
                cancel,
            )
            .await
        {
            warn!(id, error = %err, "acpi power button failed");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.vm_state_raw(id, cancel).await? != "running" {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        if self.vm_state_raw(id, cancel).await? == "running" {
            self.manage(
                vec!["controlvm".into(), id.to_string(), "poweroff".into()],
                cancel,
            )
            .await?;
        }
        info!(id, "virtualbox environment stopped");
        Ok(())
    }

    async fn destroy(&self, id: &str, _purge_data: bool, cancel: &CancellationToken) -> Result<()> {
        self.meta(id)?;
        if self.vm_state_raw(id, cancel).await? == "running" {
            self.stop(id, Duration::from_secs(5), cancel).await?;
        }
        self.manage(
            vec!["unregistervm".into(), id.to_string(), "--delete".into()],
            cancel,
        )
        .await?;
        let _ = std::fs::remove_file(self.meta_file(id));
        info!(id, "virtualbox environment destroyed");
        Ok(())
    }

    async fn state(&self, id: &str, cancel: &CancellationToken) -> Result<EnvState> {
        self.meta(id)?;
        let raw = self.vm_state_raw(id, cancel).await?;
        Ok(match raw.as_str() {
            "running" | "starting" => EnvState::Running,
            "poweroff" | "saved" | "paused" => EnvState::Stopped,
            "" => EnvState::Defined,
            _ => EnvState::Error,
        })
    }

    async fn exec(
        &self,
        id: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let meta = self.meta(id)?;
        let target = self.ssh_target(&meta);

        let mut script = String::new();
        for (key, value) in &request.env {
            script.push_str(&format!(
                "export {}={}; ",
                shell_quote(key),
                shell_quote(value)
            ));
        }
        if let Some(dir) = &request.work_dir {
            script.push_str(&format!("cd {} && ", shell_quote(dir)));
        }
        script.push_str(&shell_join(&request.argv));
        target.run(&script, cancel).await
    }

    async fn copy_in(
        &self,
        id: &str,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let meta = self.meta(id)?;
        self.ssh_target(&meta).copy_to(local, remote, cancel).await
    }

    async fn copy_out(
        &self,
        id: &str,
        remote: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let meta = self.meta(id)?;
        self.ssh_target(&meta).copy_from(remote, local, cancel).await
    }

    async fn snapshot_create(
        &self,
        id: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotInfo> {
        self.meta(id)?;
        self.manage(
            vec![
                "snapshot".into(),
                id.to_string(),
                "take".into(),
                label.to_string(),
            ],
            cancel,
        )
        .await?;
        info!(id, label, "virtualbox snapshot created");
        Ok(SnapshotInfo {
            environment: id.to_string(),
            label: label.to_string(),
            created_at: Some(Utc::now()),
        })
    }

    async fn snapshot_list(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SnapshotInfo>> {
        self.meta(id)?;
        let output = self
            .manage(
                vec![
                    "snapshot".into(),
                    id.to_string(),
                    "list".into(),
                    "--machinereadable".into(),
                ],
                cancel,
            )
            .await?;
        Ok(parse_snapshot_list(id, &output.stdout))
    }

    async fn snapshot_revert(
        &self,
        id: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.meta(id)?;
        // Revert implies stop + rewind.
        if self.vm_state_raw(id, cancel).await? == "running" {
            self.stop(id, Duration::from_secs(5), cancel).await?;
        }
        self.manage(
            vec![
                "snapshot".into(),
                id.to_string(),
                "restore".into(),
                label.to_string(),
            ],
            cancel,
        )
        .await
        .map_err(|err| {
            PortunixError::with_internal(
                ErrorCode::SnapshotNotFound,
                format!("cannot revert {} to snapshot {}", id, label),
                err.to_string(),
            )
        })?;
        info!(id, label, "virtualbox environment reverted");
        Ok(())
    }

    async fn snapshot_delete(
        &self,
        id: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.meta(id)?;
        self.manage(
            vec![
                "snapshot".into(),
                id.to_string(),
                "delete".into(),
                label.to_string(),
            ],
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn ssh_deploy(
        &self,
        id: &str,
        binaries: &[PathBuf],
        remote_dir: &str,
        credentials: &IngressCredentials,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let meta = self.meta(id)?;
        self.ssh_target(&meta)
            .deploy(binaries, remote_dir, credentials, cancel)
            .await
    }
}

/// Extract `VMState="..."` from machine-readable output.
fn parse_vm_state(stdout: &str) -> String {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("VMState="))
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_default()
}

/// Extract snapshot names from machine-readable snapshot list output.
fn parse_snapshot_list(id: &str, stdout: &str) -> Vec<SnapshotInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            if key.starts_with("SnapshotName") {
                Some(SnapshotInfo {
                    environment: id.to_string(),
                    label: value.trim_matches('"').to_string(),
                    created_at: None,
                })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_state() {
        let stdout = "name=\"dev\"\nVMState=\"running\"\nVMStateChangeTime=\"...\"\n";
        assert_eq!(parse_vm_state(stdout), "running");
        assert_eq!(parse_vm_state(""), "");
    }

    #[test]
    fn test_parse_snapshot_list() {
        let stdout = "SnapshotName=\"clean\"\nSnapshotUUID=\"x\"\n\
                      SnapshotName-1=\"post-install\"\nSnapshotUUID-1=\"y\"\n";
        let snapshots = parse_snapshot_list("dev", stdout);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].label, "clean");
        assert_eq!(snapshots[1].label, "post-install");
    }
}
