//! Docker and Podman, driven through their CLIs.
//!
//! The two engines share a command dialect, so one implementation
//! parameterised by binary name covers both. Environments are addressed
//! by container name; creation is idempotent on (name, provider).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ErrorCode, PortunixError, Result};
use crate::process::{run_captured, CommandOutput, CommandSpec};
use crate::providers::ssh::shell_quote;
use crate::providers::{
    EnvState, EnvironmentProvider, EnvironmentSpec, ExecRequest, IngressCredentials,
};

/// Deadline for ordinary engine invocations.
const ENGINE_DEADLINE: Duration = Duration::from_secs(120);

/// Deadline for image-pulling creations.
const CREATE_DEADLINE: Duration = Duration::from_secs(600);

/// A container engine addressed through its CLI.
pub struct CliEngine {
    binary: &'static str,
}

impl CliEngine {
    pub fn docker() -> Self {
        Self { binary: "docker" }
    }

    pub fn podman() -> Self {
        Self { binary: "podman" }
    }

    fn spec(&self, args: impl IntoIterator<Item = impl Into<String>>) -> CommandSpec {
        CommandSpec::new(self.binary, args)
    }

    async fn run(
        &self,
        spec: &CommandSpec,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        run_captured(spec, Some(deadline), cancel)
            .await?
            .into_result(self.binary)
    }

    async fn inspect_format(
        &self,
        id: &str,
        format: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let spec = self.spec(["inspect", "--format", format, id]);
        let output = run_captured(&spec, Some(ENGINE_DEADLINE), cancel).await?;
        if !output.success() {
            return Err(PortunixError::new(
                ErrorCode::EnvironmentNotFound,
                format!("environment not found: {}", id),
            ));
        }
        Ok(output.stdout.trim().to_string())
    }
}

#[async_trait]
impl EnvironmentProvider for CliEngine {
    fn name(&self) -> &'static str {
        self.binary
    }

    fn is_available(&self) -> bool {
        which::which(self.binary).is_ok()
    }

    async fn create(&self, spec: &EnvironmentSpec, cancel: &CancellationToken) -> Result<String> {
        // Idempotence: an existing container with this name is the
        // environment.
        if self
            .inspect_format(&spec.name, "{{.Id}}", cancel)
            .await
            .is_ok()
        {
            debug!(name = %spec.name, engine = self.binary, "environment already exists");
            return Ok(spec.name.clone());
        }

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.clone(),
        ];
        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.host.display(), mount.guest);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("-v".into());
            args.push(volume);
        }
        for port in &spec.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", port.host, port.guest));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        if let Some(cpus) = spec.resources.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        if let Some(memory) = spec.resources.memory_mb {
            args.push("--memory".into());
            args.push(format!("{}m", memory));
        }
        args.push(spec.image.clone());

        self.run(&self.spec(args), CREATE_DEADLINE, cancel).await?;
        info!(name = %spec.name, image = %spec.image, engine = self.binary, "environment created");
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(&self.spec(["start", id]), ENGINE_DEADLINE, cancel)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration, cancel: &CancellationToken) -> Result<()> {
        // The engine implements graceful-then-kill itself via -t.
        let grace_secs = grace.as_secs().to_string();
        self.run(
            &self.spec(["stop", "-t", grace_secs.as_str(), id]),
            grace + ENGINE_DEADLINE,
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn destroy(&self, id: &str, purge_data: bool, cancel: &CancellationToken) -> Result<()> {
        let mut args = vec!["rm", "-f"];
        if purge_data {
            args.push("-v");
        }
        args.push(id);
        self.run(&self.spec(args), ENGINE_DEADLINE, cancel).await?;
        info!(id, engine = self.binary, purge_data, "environment destroyed");
        Ok(())
    }

    async fn state(&self, id: &str, cancel: &CancellationToken) -> Result<EnvState> {
        let status = self
            .inspect_format(id, "{{.State.Status}}", cancel)
            .await?;
        Ok(match status.as_str() {
            "created" => EnvState::Defined,
            "running" => EnvState::Running,
            "exited" | "paused" | "dead" => EnvState::Stopped,
            _ => EnvState::Error,
        })
    }

    async fn exec(
        &self,
        id: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let mut args: Vec<String> = vec!["exec".into()];
        if request.stdin.is_some() {
            args.push("-i".into());
        }
        if let Some(dir) = &request.work_dir {
            args.push("-w".into());
            args.push(dir.clone());
        }
        for (key, value) in &request.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(id.to_string());
        args.extend(request.argv.iter().cloned());

        let mut spec = self.spec(args);
        if let Some(stdin) = &request.stdin {
            spec = spec.with_stdin(stdin.clone());
        }
        // Surface the guest command's own exit code to the caller
        // instead of flattening it into an engine failure.
        run_captured(&spec, Some(ENGINE_DEADLINE), cancel).await
    }

    async fn copy_in(
        &self,
        id: &str,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = format!("{}:{}", id, remote);
        self.run(
            &self.spec(["cp", &local.display().to_string(), &target]),
            ENGINE_DEADLINE,
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn copy_out(
        &self,
        id: &str,
        remote: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source = format!("{}:{}", id, remote);
        self.run(
            &self.spec(["cp", &source, &local.display().to_string()]),
            ENGINE_DEADLINE,
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
        // Quote every operator-supplied value before it reaches the
        // guest shell.
        let user = shell_quote(&credentials.user);
        let dir = shell_quote(remote_dir);

        // Create the user if missing and prepare its key material.
        let setup = format!(
            "id -u {user} >/dev/null 2>&1 || useradd -m {user}; \
             mkdir -p /home/{user}/.ssh {dir}",
            user = user,
            dir = dir,
        );
        self.exec_sh(id, &setup, cancel).await?;

        if let Some(key) = &credentials.public_key {
            let request = ExecRequest {
                argv: vec![
                    "sh".into(),
                    "-c".into(),
                    format!(
                        "cat >> /home/{user}/.ssh/authorized_keys && \
                         chmod 600 /home/{user}/.ssh/authorized_keys",
                        user = user
                    ),
                ],
                stdin: Some(format!("{}\n", key.trim()).into_bytes()),
                ..Default::default()
            };
            self.exec(id, &request, cancel)
                .await?
                .into_result(self.binary)?;
        }

        for binary in binaries {
            let name = binary
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| PortunixError::invalid_input("binary path has no file name"))?;
            let remote = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
            self.copy_in(id, binary, &remote, cancel).await?;
            self.exec_sh(id, &format!("chmod 755 {}", shell_quote(&remote)), cancel)
                .await?;
        }

        let ownership = format!(
            "chown -R {user}:{user} /home/{user}/.ssh {dir}",
            user = user,
            dir = dir
        );
        self.exec_sh(id, &ownership, cancel).await?;

        info!(
            id,
            engine = self.binary,
            binaries = binaries.len(),
            remote_dir,
            "binary set deployed"
        );
        Ok(())
    }
}

impl CliEngine {
    async fn exec_sh(&self, id: &str, script: &str, cancel: &CancellationToken) -> Result<()> {
        let request = ExecRequest {
            argv: vec!["sh".into(), "-c".into(), script.into()],
            ..Default::default()
        };
        self.exec(id, &request, cancel)
            .await?
            .into_result(self.binary)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_names() {
        assert_eq!(CliEngine::docker().name(), "docker");
        assert_eq!(CliEngine::podman().name(), "podman");
    }

    #[test]
    fn test_create_args_render() {
        // The command surface is the contract with the engine; pin the
        // flag layout for one representative spec.
        let engine = CliEngine::docker();
        let spec = engine.spec([
            "create", "--name", "dev", "-v", "/src:/work", "-p", "8080:80", "-e", "A=1",
            "ubuntu:24.04",
        ]);
        assert_eq!(
            spec.render(),
            "docker create --name dev -v /src:/work -p 8080:80 -e A=1 ubuntu:24.04"
        );
    }
}
