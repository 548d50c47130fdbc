//! QEMU/KVM virtual machines.
//!
//! Each environment is a copy-on-write qcow2 overlay of a base image,
//! kept under `vm/<name>/` in the data home next to a small metadata
//! document (image, SSH user, forwarded port; never any secret). The
//! guest is reached over a user-mode-network hostfwd of port 22, so
//! exec, transfer, and deployment ride the SSH plumbing. Snapshots are
//! qcow2-internal via `qemu-img`.

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

const IMG_DEADLINE: Duration = Duration::from_secs(120);
const BOOT_DEADLINE: Duration = Duration::from_secs(60);

/// Per-VM metadata persisted next to the disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VmMeta {
    image: String,
    ssh_user: String,
    ssh_port: u16,
    memory_mb: u64,
    cpus: u32,
}

/// QEMU-backed environments.
pub struct QemuProvider {
    root: PathBuf,
    system_binary: &'static str,
}

impl QemuProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            system_binary: "qemu-system-x86_64",
        }
    }

    fn vm_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn disk(&self, id: &str) -> PathBuf {
        self.vm_dir(id).join("disk.qcow2")
    }

    fn pidfile(&self, id: &str) -> PathBuf {
        self.vm_dir(id).join("qemu.pid")
    }

    fn meta_file(&self, id: &str) -> PathBuf {
        self.vm_dir(id).join("vm.json")
    }

    fn meta(&self, id: &str) -> Result<VmMeta> {
        let bytes = std::fs::read(self.meta_file(id)).map_err(|_| {
            PortunixError::new(
                ErrorCode::EnvironmentNotFound,
                format!("environment not found: {}", id),
            )
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn ssh_target(&self, meta: &VmMeta) -> SshTarget {
        SshTarget::loopback(meta.ssh_port, meta.ssh_user.clone())
    }

    fn running_pid(&self, id: &str) -> Option<u32> {
        let pid: u32 = std::fs::read_to_string(self.pidfile(id))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        #[cfg(unix)]
        {
            // SAFETY: signal 0 performs only an existence check.
            (unsafe { libc::kill(pid as libc::pid_t, 0) } == 0).then_some(pid)
        }
        #[cfg(not(unix))]
        {
            Some(pid)
        }
    }

    async fn qemu_img(
        &self,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        run_captured(&CommandSpec::new("qemu-img", args), Some(IMG_DEADLINE), cancel)
            .await?
            .into_result("qemu-img")
    }

    fn require_stopped(&self, id: &str, operation: &str) -> Result<()> {
        if self.running_pid(id).is_some() {
            return Err(PortunixError::new(
                ErrorCode::ResourceBusy,
                format!("environment {} must be stopped for {}", id, operation),
            )
            .with_hint(format!("run `portunix vm stop {}` first", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EnvironmentProvider for QemuProvider {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn is_available(&self) -> bool {
        which::which(self.system_binary).is_ok() && which::which("qemu-img").is_ok()
    }

    async fn create(&self, spec: &EnvironmentSpec, cancel: &CancellationToken) -> Result<String> {
        if self.meta_file(&spec.name).exists() {
            debug!(name = %spec.name, "qemu environment already exists");
            return Ok(spec.name.clone());
        }
        std::fs::create_dir_all(self.vm_dir(&spec.name))?;

        // Copy-on-write overlay over the base image.
        self.qemu_img(
            vec![
                "create".into(),
                "-f".into(),
                "qcow2".into(),
                "-b".into(),
                spec.image.clone(),
                "-F".into(),
                "qcow2".into(),
                self.disk(&spec.name).display().to_string(),
            ],
            cancel,
        )
        .await?;

        let credentials = spec.credentials.as_ref();
        let ssh_port = credentials
            .and_then(|c| c.port)
            .or_else(|| spec.ports.iter().find(|p| p.guest == 22).map(|p| p.host))
            .unwrap_or(2222);
        let meta = VmMeta {
            image: spec.image.clone(),
            ssh_user: credentials.map_or_else(|| "root".to_string(), |c| c.user.clone()),
            ssh_port,
            memory_mb: spec.resources.memory_mb.unwrap_or(2048),
            cpus: spec.resources.cpus.map_or(2, |c| c.max(1.0) as u32),
        };
        fsutil::atomic_write(&self.meta_file(&spec.name), &serde_json::to_vec_pretty(&meta)?)?;
        info!(name = %spec.name, image = %spec.image, ssh_port, "qemu environment created");
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let meta = self.meta(id)?;
        if self.running_pid(id).is_some() {
            return Ok(());
        }

        let args = vec![
            "-m".to_string(),
            meta.memory_mb.to_string(),
            "-smp".to_string(),
            meta.cpus.to_string(),
            "-drive".to_string(),
            format!("file={},format=qcow2,if=virtio", self.disk(id).display()),
            "-netdev".to_string(),
            format!("user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22", meta.ssh_port),
            "-device".to_string(),
            "virtio-net-pci,netdev=net0".to_string(),
            "-display".to_string(),
            "none".to_string(),
            "-daemonize".to_string(),
            "-pidfile".to_string(),
            self.pidfile(id).display().to_string(),
        ];
        run_captured(
            &CommandSpec::new(self.system_binary, args),
            Some(BOOT_DEADLINE),
            cancel,
        )
        .await?
        .into_result(self.system_binary)?;
        info!(id, port = meta.ssh_port, "qemu environment started");
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration, cancel: &CancellationToken) -> Result<()> {
        let meta = self.meta(id)?;
        let Some(pid) = self.running_pid(id) else {
            return Ok(());
        };

        // Ask the guest nicely first.
        let target = self.ssh_target(&meta);
        if let Err(err) = target.run("sudo poweroff", cancel).await {
            warn!(id, error = %err, "guest poweroff failed, will signal qemu");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.running_pid(id).is_none() {
                let _ = std::fs::remove_file(self.pidfile(id));
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        #[cfg(unix)]
        {
            // SAFETY: pid read from our own pidfile and verified alive.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            if self.running_pid(id).is_some() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }
        let _ = std::fs::remove_file(self.pidfile(id));
        info!(id, "qemu environment stopped");
        Ok(())
    }

    async fn destroy(&self, id: &str, _purge_data: bool, cancel: &CancellationToken) -> Result<()> {
        self.meta(id)?;
        self.stop(id, Duration::from_secs(5), cancel).await?;
        std::fs::remove_dir_all(self.vm_dir(id))?;
        info!(id, "qemu environment destroyed");
        Ok(())
    }

    async fn state(&self, id: &str, _cancel: &CancellationToken) -> Result<EnvState> {
        self.meta(id)?;
        if self.running_pid(id).is_some() {
            Ok(EnvState::Running)
        } else if self.disk(id).exists() {
            Ok(EnvState::Stopped)
        } else {
            Ok(EnvState::Error)
        }
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
        self.require_stopped(id, "snapshot creation")?;
        self.qemu_img(
            vec![
                "snapshot".into(),
                "-c".into(),
                label.into(),
                self.disk(id).display().to_string(),
            ],
            cancel,
        )
        .await?;
        info!(id, label, "qemu snapshot created");
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
            .qemu_img(
                vec![
                    "snapshot".into(),
                    "-l".into(),
                    self.disk(id).display().to_string(),
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
        let meta = self.meta(id)?;
        let _ = meta;
        // Revert implies stop + rewind.
        self.stop(id, Duration::from_secs(5), cancel).await?;
        let result = self
            .qemu_img(
                vec![
                    "snapshot".into(),
                    "-a".into(),
                    label.into(),
                    self.disk(id).display().to_string(),
                ],
                cancel,
            )
            .await;
        match result {
            Ok(_) => {
                info!(id, label, "qemu environment reverted");
                Ok(())
            }
            Err(err) => Err(PortunixError::with_internal(
                ErrorCode::SnapshotNotFound,
                format!("cannot revert {} to snapshot {}", id, label),
                err.to_string(),
            )),
        }
    }

    async fn snapshot_delete(
        &self,
        id: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.meta(id)?;
        self.qemu_img(
            vec![
                "snapshot".into(),
                "-d".into(),
                label.into(),
                self.disk(id).display().to_string(),
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

/// Parse `qemu-img snapshot -l` output.
///
/// ```text
/// Snapshot list:
/// ID        TAG               VM SIZE                DATE     VM CLOCK
/// 1         clean                  0 B 2025-01-01 12:00:00 00:00:00.000
/// ```
fn parse_snapshot_list(id: &str, stdout: &str) -> Vec<SnapshotInfo> {
    stdout
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("ID"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _id = fields.next()?;
            let tag = fields.next()?;
            Some(SnapshotInfo {
                environment: id.to_string(),
                label: tag.to_string(),
                created_at: None,
            })
        })
        .collect()
}
