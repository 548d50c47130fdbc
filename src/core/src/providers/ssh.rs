//! SSH plumbing for VM providers.
//!
//! QEMU and VirtualBox guests are reached over a forwarded SSH port;
//! exec, file transfer, and self-deployment all go through the system
//! `ssh`/`scp` binaries so host key and agent configuration behave
//! exactly as they do for the operator's own sessions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PortunixError, Result};
use crate::process::{run_captured, CommandOutput, CommandSpec};
use crate::providers::IngressCredentials;

/// Deadline for a single remote command.
const SSH_DEADLINE: Duration = Duration::from_secs(300);

/// Quote one word for transport through `ssh host '<script>'` or a
/// guest `sh -c`. Anything outside a conservative safe set is wrapped
/// in single quotes with embedded quotes escaped, so usernames, paths,
/// and key comments can never splice into the remote command line.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Quote a full argv for a remote shell.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A reachable SSH endpoint. Only the user, address, and public key
/// material are ever persisted; private keys stay in the operator's
/// agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub identity: Option<PathBuf>,
}

impl SshTarget {
    /// Loopback target used for hostfwd'ed VM guests.
    pub fn loopback(port: u16, user: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            user: user.into(),
            identity: None,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    /// Run a shell line on the target.
    pub async fn run(&self, script: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        let mut args = self.common_args();
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(self.destination());
        args.push(script.to_string());
        let spec = CommandSpec::new("ssh", args);
        debug!(command = %spec.render(), "remote command");
        run_captured(&spec, Some(SSH_DEADLINE), cancel).await
    }

    /// Run a shell line, failing on non-zero exit.
    pub async fn run_checked(&self, script: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(script, cancel).await?.into_result("ssh")?;
        Ok(())
    }

    /// Copy a local file to the target.
    pub async fn copy_to(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut args = self.common_args();
        args.push("-P".to_string());
        args.push(self.port.to_string());
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.destination(), remote));
        run_captured(&CommandSpec::new("scp", args), Some(SSH_DEADLINE), cancel)
            .await?
            .into_result("scp")?;
        Ok(())
    }

    /// Copy a remote file to the local filesystem.
    pub async fn copy_from(
        &self,
        remote: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut args = self.common_args();
        args.push("-P".to_string());
        args.push(self.port.to_string());
        args.push(format!("{}:{}", self.destination(), remote));
        args.push(local.display().to_string());
        run_captured(&CommandSpec::new("scp", args), Some(SSH_DEADLINE), cancel)
            .await?
            .into_result("scp")?;
        Ok(())
    }

    /// Self-deployment of the binary set: create the ingress user if
    /// missing, install the authorized key, copy the binaries into
    /// `remote_dir`, and set execute bits.
    ///
    /// Every operator-supplied value is quoted before it reaches the
    /// remote shell.
    pub async fn deploy(
        &self,
        binaries: &[PathBuf],
        remote_dir: &str,
        credentials: &IngressCredentials,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let user = shell_quote(&credentials.user);
        let dir = shell_quote(remote_dir);
        let setup = format!(
            "id -u {user} >/dev/null 2>&1 || sudo useradd -m {user}; \
             sudo mkdir -p /home/{user}/.ssh {dir}; \
             sudo chown {user}:{user} /home/{user}/.ssh {dir}",
            user = user,
            dir = dir,
        );
        self.run_checked(&setup, cancel).await?;

        if let Some(key) = &credentials.public_key {
            let install_key = format!(
                "echo {key} | sudo tee -a /home/{user}/.ssh/authorized_keys >/dev/null && \
                 sudo chmod 600 /home/{user}/.ssh/authorized_keys && \
                 sudo chown {user}:{user} /home/{user}/.ssh/authorized_keys",
                key = shell_quote(key.trim()),
                user = user,
            );
            self.run_checked(&install_key, cancel).await?;
        }

        for binary in binaries {
            let name = binary
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| PortunixError::invalid_input("binary path has no file name"))?;
            let staged = format!("/tmp/{}", name);
            let target = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
            self.copy_to(binary, &staged, cancel).await?;
            self.run_checked(
                &format!(
                    "sudo mv {staged} {target} && sudo chmod 755 {target}",
                    staged = shell_quote(&staged),
                    target = shell_quote(&target)
                ),
                cancel,
            )
            .await?;
        }

        info!(
            target = %self.destination(),
            binaries = binaries.len(),
            remote_dir,
            "binary set deployed over SSH"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_target() {
        let target = SshTarget::loopback(2222, "portunix");
        assert_eq!(target.destination(), "portunix@127.0.0.1");
        assert_eq!(target.port, 2222);
    }

    #[test]
    fn test_identity_flag_included() {
        let mut target = SshTarget::loopback(22, "dev");
        target.identity = Some(PathBuf::from("/keys/id_ed25519"));
        let args = target.common_args();
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"/keys/id_ed25519".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_shell_quote_only_when_needed() {
        assert_eq!(shell_quote("portunix"), "portunix");
        assert_eq!(shell_quote("/opt/portunix"), "/opt/portunix");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_shell_quote_defuses_metacharacters() {
        assert_eq!(shell_quote("a; rm -rf /"), "'a; rm -rf /'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
        // Embedded single quotes cannot close the quoting.
        assert_eq!(shell_quote("o'brien"), r"'o'\''brien'");
    }

    #[test]
    fn test_shell_join() {
        let argv = vec![
            "ls".to_string(),
            "-la".to_string(),
            "/opt/portunix".to_string(),
            "a b".to_string(),
        ];
        assert_eq!(shell_join(&argv), "ls -la /opt/portunix 'a b'");
    }
}
