//! Uniform lifecycle-and-I/O surface over heterogeneous environment
//! engines (Docker, Podman, QEMU, VirtualBox, and a no-engine local
//! sandbox).
//!
//! Every provider implements [`EnvironmentProvider`]; the
//! [`ProviderManager`] owns a bounded worker pool per provider and an
//! id-keyed lock per environment, so operations on distinct
//! environments run in parallel up to the pool size while operations on
//! one environment are strictly serialised.

pub mod cli_engine;
pub mod pool;
pub mod qemu;
pub mod sandboxed;
pub mod ssh;
pub mod virtualbox;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ErrorCode, PortunixError, Result};
use crate::process::CommandOutput;

pub use pool::ProviderManager;
pub use ssh::SshTarget;

// ═══════════════════════════════════════════════════════════════════════════════
// Specs and state
// ═══════════════════════════════════════════════════════════════════════════════

/// Host/guest mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: PathBuf,
    pub guest: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Host/guest port mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMap {
    pub host: u16,
    pub guest: u16,
}

/// Resource bounds applied at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

/// Credentials for reaching into an environment (SSH-style ingress).
/// Never persisted in plaintext by the host; they live only in the
/// spec for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressCredentials {
    pub user: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Everything needed to create an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Stable name; creation is idempotent on (name, provider).
    pub name: String,
    /// Base image (containers) or template/base disk (VMs).
    pub image: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub ports: Vec<PortMap>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub credentials: Option<IngressCredentials>,
}

/// Observable lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvState {
    Defined,
    Running,
    Stopped,
    Error,
}

/// A managed environment as reported by its provider.
#[derive(Debug, Clone, Serialize)]
pub struct Environment {
    pub id: String,
    pub provider: String,
    pub image: String,
    pub state: EnvState,
}

/// Command execution request inside an environment.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub work_dir: Option<String>,
    pub env: HashMap<String, String>,
}

/// A VM snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub environment: String,
    pub label: String,
    pub created_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Provider trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The uniform surface every engine implements.
///
/// Container providers answer `SnapshotUnsupported` for the snapshot
/// family; VM providers implement it fully.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Provider tag (`docker`, `podman`, `qemu`, `virtualbox`,
    /// `sandbox`).
    fn name(&self) -> &'static str;

    /// Whether the underlying engine is present on this host.
    fn is_available(&self) -> bool;

    /// Create an environment; idempotent on (name, provider). Returns
    /// the environment id.
    async fn create(&self, spec: &EnvironmentSpec, cancel: &CancellationToken) -> Result<String>;

    /// Defined/Stopped → Running.
    async fn start(&self, id: &str, cancel: &CancellationToken) -> Result<()>;

    /// Graceful stop with bounded grace, then force.
    async fn stop(&self, id: &str, grace: Duration, cancel: &CancellationToken) -> Result<()>;

    /// Remove runtime state; optionally data volumes.
    async fn destroy(&self, id: &str, purge_data: bool, cancel: &CancellationToken) -> Result<()>;

    /// Current state.
    async fn state(&self, id: &str, cancel: &CancellationToken) -> Result<EnvState>;

    /// Run a command, capturing stdout/stderr/exit code.
    async fn exec(
        &self,
        id: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput>;

    /// Copy a local path into the environment.
    async fn copy_in(
        &self,
        id: &str,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Copy a path out of the environment.
    async fn copy_out(
        &self,
        id: &str,
        remote: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Create a snapshot (VM providers).
    async fn snapshot_create(
        &self,
        id: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotInfo> {
        let _ = (label, cancel);
        Err(snapshot_unsupported(self.name(), id))
    }

    /// List snapshots (VM providers).
    async fn snapshot_list(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SnapshotInfo>> {
        let _ = cancel;
        Err(snapshot_unsupported(self.name(), id))
    }

    /// Revert to a snapshot; implies stop + rewind (VM providers).
    async fn snapshot_revert(
        &self,
        id: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _ = (label, cancel);
        Err(snapshot_unsupported(self.name(), id))
    }

    /// Delete a snapshot (VM providers).
    async fn snapshot_delete(
        &self,
        id: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _ = (label, cancel);
        Err(snapshot_unsupported(self.name(), id))
    }

    /// Deploy the main + helper binary set into a freshly provisioned
    /// environment: create the ingress user if missing, install the
    /// authorized key material, copy the binaries, set execute bits.
    async fn ssh_deploy(
        &self,
        id: &str,
        binaries: &[PathBuf],
        remote_dir: &str,
        credentials: &IngressCredentials,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

fn snapshot_unsupported(provider: &str, id: &str) -> PortunixError {
    PortunixError::new(
        ErrorCode::SnapshotUnsupported,
        format!("provider {} does not support snapshots (environment {})", provider, id),
    )
    .with_hint("use a VM provider (qemu, virtualbox) for snapshot workflows")
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transient retry
// ═══════════════════════════════════════════════════════════════════════════════

/// Run `op` with exponential backoff on transient errors, up to
/// `attempts` tries. Non-transient errors surface immediately.
pub async fn retry_transient<T, F, Fut>(
    attempts: u32,
    base_backoff: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = base_backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(attempt, error = %err, "transient failure, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => {
                        return Err(PortunixError::cancelled("retry wait"));
                    }
                }
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(
            3,
            Duration::from_millis(10),
            &CancellationToken::new(),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PortunixError::new(
                            ErrorCode::NetworkError,
                            "flaky",
                        ))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_touch_precondition_errors() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(
            3,
            Duration::from_millis(1),
            &CancellationToken::new(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(PortunixError::new(
                        ErrorCode::EnvironmentNotFound,
                        "gone",
                    ))
                }
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::EnvironmentNotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_surfaces_error() {
        let err = retry_transient(
            2,
            Duration::from_millis(1),
            &CancellationToken::new(),
            || async {
                Err::<(), _>(PortunixError::new(ErrorCode::NetworkError, "down"))
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NetworkError);
    }
}
