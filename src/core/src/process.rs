//! Subprocess execution with deadlines and cooperative cancellation.
//!
//! Every component that shells out (dispatcher, installer methods,
//! providers, update verification) goes through this module so that
//! termination semantics are uniform: on cancellation or deadline the
//! child receives a graceful signal, then a hard kill after a bounded
//! grace period.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorCode, PortunixError, Result};

/// Grace period between the graceful signal and the hard kill.
const TERM_GRACE: Duration = Duration::from_secs(5);

// ═══════════════════════════════════════════════════════════════════════════════
// Command Specification
// ═══════════════════════════════════════════════════════════════════════════════

/// A fully described command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program to execute (resolved against PATH if not absolute)
    pub program: String,
    /// Arguments, not including the program itself
    pub args: Vec<String>,
    /// Working directory (inherited when None)
    pub cwd: Option<PathBuf>,
    /// Environment additions on top of the inherited environment
    pub env: HashMap<String, String>,
    /// Data written to stdin before waiting
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    /// Create a spec for `program` with the given arguments.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Provide stdin data.
    pub fn with_stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Render the invocation for dry-run output and diagnostics.
    pub fn render(&self) -> String {
        let mut parts = vec![self.program.clone()];
        for arg in &self.args {
            if arg.contains(' ') {
                parts.push(format!("'{}'", arg));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Output
// ═══════════════════════════════════════════════════════════════════════════════

/// Captured result of a completed subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Captured stdout, lossily decoded
    pub stdout: String,
    /// Captured stderr, lossily decoded
    pub stderr: String,
    /// Exit code; None when terminated by a signal
    pub exit_code: Option<i32>,
    /// Wall-clock duration
    pub duration: Duration,
}

impl CommandOutput {
    /// Whether the process exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert a failure into the External error taxonomy, capturing
    /// exit code and stderr verbatim.
    pub fn into_result(self, tool: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(PortunixError::external_tool(tool, self.exit_code, &self.stderr))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Run a command to completion, capturing stdout and stderr.
///
/// `deadline` bounds the total runtime; `cancel` aborts early. Either
/// way the child is signalled gracefully, then killed after the grace
/// period, and a `Cancelled`/`DeadlineExceeded` error is returned.
pub async fn run_captured(
    spec: &CommandSpec,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = build_command(spec);
    command
        .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(command = %spec.render(), "spawning subprocess");

    let mut child = command.spawn().map_err(|e| {
        PortunixError::with_internal(
            ErrorCode::ExternalToolFailed,
            format!("failed to spawn {}", spec.program),
            e.to_string(),
        )
        .with_source(e)
    })?;

    if let Some(data) = &spec.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
            drop(stdin);
        }
    }

    // Drain the pipes concurrently so a chatty child cannot deadlock on
    // a full pipe buffer while we wait for it.
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(drain_pipe(stdout_pipe));
    let stderr_task = tokio::spawn(drain_pipe(stderr_pipe));

    let expiry = async {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = expiry => {
            terminate(&mut child, None).await;
            return Err(PortunixError::deadline_exceeded(spec.program.clone()));
        }
        _ = cancel.cancelled() => {
            terminate(&mut child, None).await;
            return Err(PortunixError::cancelled(spec.program.clone()));
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code(),
        duration: start.elapsed(),
    })
}

async fn drain_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// Run a command with inherited stdio, working directory, and
/// environment, returning its exit code. Used by the dispatcher to
/// forward to helper binaries transparently.
pub async fn run_inherited(spec: &CommandSpec) -> Result<i32> {
    let mut command = build_command(spec);
    command
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let mut child = command.spawn().map_err(|e| {
        PortunixError::with_internal(
            ErrorCode::HelperSpawnFailed,
            format!("failed to spawn {}", spec.program),
            e.to_string(),
        )
        .with_source(e)
    })?;

    let status = child.wait().await?;
    // A signal-terminated helper surfaces as the generic failure code.
    Ok(status.code().unwrap_or(1))
}

/// Terminate a child gracefully, then kill after the grace period.
///
/// On Unix the graceful signal is SIGTERM; on Windows there is no
/// portable graceful signal for arbitrary processes, so the grace
/// period only gives the child time to notice its closed pipes.
pub async fn terminate(child: &mut Child, grace: Option<Duration>) {
    let grace = grace.unwrap_or(TERM_GRACE);

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) with a known-live child pid.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(code = ?status.code(), "subprocess exited after graceful signal");
            return;
        }
        Ok(Err(err)) => {
            warn!(error = %err, "wait after graceful signal failed");
        }
        Err(_) => {
            debug!("grace period elapsed, killing subprocess");
        }
    }

    if let Err(err) = child.kill().await {
        warn!(error = %err, "hard kill failed");
    }
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command.kill_on_drop(true);
    command
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_quotes_spaced_args() {
        let spec = CommandSpec::new("docker", ["run", "--name", "my env"]);
        assert_eq!(spec.render(), "docker run --name 'my env'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_success() {
        let spec = CommandSpec::new("sh", ["-c", "echo out; echo err >&2"]);
        let cancel = CancellationToken::new();
        let out = run_captured(&spec, None, &cancel).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_nonzero_exit() {
        let spec = CommandSpec::new("sh", ["-c", "echo broken >&2; exit 3"]);
        let cancel = CancellationToken::new();
        let out = run_captured(&spec, None, &cancel).await.unwrap();
        assert_eq!(out.exit_code, Some(3));

        let err = out.into_result("sh").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExternalToolFailed);
        assert!(err.to_string().contains("exit code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_deadline() {
        let spec = CommandSpec::new("sleep", ["5"]);
        let cancel = CancellationToken::new();
        let err = run_captured(&spec, Some(Duration::from_millis(50)), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captured_cancellation() {
        let spec = CommandSpec::new("sleep", ["5"]);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = run_captured(&spec, None, &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_piped() {
        let spec = CommandSpec::new("cat", Vec::<String>::new()).with_stdin("hello");
        let cancel = CancellationToken::new();
        let out = run_captured(&spec, None, &cancel).await.unwrap();
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_external() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-4d2f", Vec::<String>::new());
        let cancel = CancellationToken::new();
        let err = run_captured(&spec, None, &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExternalToolFailed);
    }
}
