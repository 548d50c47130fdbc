//! Git-style multi-binary dispatch.
//!
//! The dispatcher classifies the first non-flag token of argv. When the
//! token belongs to a registered helper binary the helper is executed
//! with the full argument tail (owning token retained, so the helper
//! sees it as its own subcommand), inherited stdio, working directory,
//! and environment; its exit code is propagated verbatim. Any other
//! token falls through to the in-process router.
//!
//! The helper table is static: adding a helper is a source change, and
//! routing is an exhaustive match over declared commands.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PortunixError, Result};
use crate::fsutil;
use crate::process::{run_inherited, CommandSpec};
use crate::version;

// ═══════════════════════════════════════════════════════════════════════════════
// Helper Table
// ═══════════════════════════════════════════════════════════════════════════════

/// A helper binary co-located with the main executable.
#[derive(Debug, Clone, Copy)]
pub struct HelperDescriptor {
    /// Helper name, unique in the table
    pub name: &'static str,
    /// Top-level command tokens this helper owns
    pub commands: &'static [&'static str],
    /// Expected binary filename, without the platform suffix
    pub binary: &'static str,
    /// Required helpers make a missing binary fatal; optional helpers
    /// only produce a warning and fall through to the router
    pub required: bool,
}

/// The static helper registration table.
pub const HELPERS: &[HelperDescriptor] = &[
    HelperDescriptor {
        name: "container",
        commands: &["container", "docker", "podman", "vm"],
        binary: "ptx-container",
        required: true,
    },
    HelperDescriptor {
        name: "mcp",
        commands: &["mcp"],
        binary: "ptx-mcp",
        required: false,
    },
];

/// Look up the helper owning a command token.
pub fn helper_for(token: &str) -> Option<&'static HelperDescriptor> {
    HELPERS.iter().find(|h| h.commands.contains(&token))
}

/// The expected on-disk path of a helper inside `install_root`.
pub fn helper_path(install_root: &Path, helper: &HelperDescriptor) -> PathBuf {
    install_root.join(format!("{}{}", helper.binary, fsutil::EXE_SUFFIX))
}

/// Find the first argv token that is not a global flag. Returns the
/// index and the token.
pub fn first_command_token(args: &[String]) -> Option<(usize, &str)> {
    args.iter()
        .enumerate()
        .find(|(_, arg)| !arg.starts_with('-'))
        .map(|(idx, arg)| (idx, arg.as_str()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a dispatch attempt.
#[derive(Debug)]
pub enum Dispatch {
    /// A helper ran; the caller should exit with this code.
    Forwarded(i32),
    /// No helper owns the command; the in-process router takes over.
    NotHandled,
}

/// Route `args` (argv without the program name) to a helper binary if
/// one owns the first command token.
///
/// `install_root` is the directory of the running executable unless
/// overridden by configuration.
pub async fn dispatch(install_root: &Path, args: &[String]) -> Result<Dispatch> {
    let Some((index, token)) = first_command_token(args) else {
        return Ok(Dispatch::NotHandled);
    };

    let Some(helper) = helper_for(token) else {
        return Ok(Dispatch::NotHandled);
    };

    let binary = helper_path(install_root, helper);
    if !fsutil::is_executable(&binary) {
        if helper.required {
            return Err(PortunixError::helper_not_found(
                token,
                binary.display().to_string(),
            ));
        }
        warn!(
            helper = helper.name,
            expected = %binary.display(),
            "optional helper binary missing, falling back to in-process handling"
        );
        return Ok(Dispatch::NotHandled);
    }

    enforce_version_compatibility(helper, &binary).await?;

    // Forward the full tail from the owning token; the helper sees the
    // command name as its own subcommand.
    let tail = &args[index..];
    debug!(
        helper = helper.name,
        binary = %binary.display(),
        args = ?tail,
        "forwarding to helper"
    );

    let spec = CommandSpec::new(binary.display().to_string(), tail.iter().cloned());
    let code = run_inherited(&spec).await?;
    Ok(Dispatch::Forwarded(code))
}

async fn enforce_version_compatibility(
    helper: &HelperDescriptor,
    binary: &Path,
) -> Result<()> {
    let main_version = version::current_version();
    match version::probe_version(binary).await {
        Ok(helper_version) => {
            if !version::compatible(&helper_version, &main_version) {
                return Err(PortunixError::helper_version_incompatible(
                    helper.name,
                    &helper_version,
                    &main_version,
                ));
            }
            Ok(())
        }
        Err(err) => {
            // A helper that cannot report its version is suspicious but
            // not provably incompatible; surface the problem and keep
            // going so a broken probe cannot brick the whole CLI.
            warn!(
                helper = helper.name,
                error = %err,
                "helper version probe failed"
            );
            Ok(())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
