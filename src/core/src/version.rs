//! Version handling shared by the dispatcher and the self-update
//! engine.
//!
//! Every binary in the install root answers `--version` with a single
//! line ending in its semver (`portunix 1.7.5`). The dispatcher uses
//! this to refuse major-mismatched helpers; the update engine uses it
//! to validate staged binaries before committing.

use std::path::Path;

use semver::Version;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, PortunixError, Result};
use crate::process::{run_captured, CommandSpec};

/// Deadline for a `--version` probe; a binary that cannot answer this
/// quickly is treated as broken.
const PROBE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);

/// The version of the running binary.
pub fn current_version() -> Version {
    // The crate version is always valid semver; a failure here is a
    // build-system bug.
    Version::parse(env!("CARGO_PKG_VERSION")).expect("crate version is valid semver")
}

/// Parse the semver out of a `--version` line such as
/// `ptx-container 1.7.5`.
pub fn parse_version_output(output: &str) -> Result<Version> {
    let line = output
        .lines()
        .next()
        .ok_or_else(|| PortunixError::validation("empty version output"))?;
    let token = line
        .split_whitespace()
        .last()
        .ok_or_else(|| PortunixError::validation("blank version line"))?;
    Ok(Version::parse(token.trim_start_matches('v'))?)
}

/// Execute `<binary> --version` and parse the reported semver.
pub async fn probe_version(binary: &Path) -> Result<Version> {
    let spec = CommandSpec::new(binary.display().to_string(), ["--version"]);
    let output = run_captured(&spec, Some(PROBE_DEADLINE), &CancellationToken::new()).await?;
    if !output.success() {
        return Err(PortunixError::with_internal(
            ErrorCode::ExternalToolFailed,
            format!("{} did not answer --version", binary.display()),
            output.stderr,
        ));
    }
    parse_version_output(&output.stdout)
}

/// Whether two versions may run side by side: identical majors, and for
/// the pre-1.0 series identical minors as well.
pub fn compatible(a: &Version, b: &Version) -> bool {
    if a.major == 0 || b.major == 0 {
        a.major == b.major && a.minor == b.minor
    } else {
        a.major == b.major
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_output() {
        assert_eq!(
            parse_version_output("portunix 1.7.5\n").unwrap(),
            Version::new(1, 7, 5)
        );
        assert_eq!(
            parse_version_output("ptx-container v0.9.2").unwrap(),
            Version::new(0, 9, 2)
        );
        assert!(parse_version_output("").is_err());
        assert!(parse_version_output("no version here").is_err());
    }

    #[test]
    fn test_compatibility_rules() {
        let v = |s: &str| Version::parse(s).unwrap();
        assert!(compatible(&v("1.7.5"), &v("1.9.0")));
        assert!(!compatible(&v("1.7.5"), &v("2.0.0")));
        // Pre-1.0: minor acts as the breaking axis.
        assert!(compatible(&v("0.9.2"), &v("0.9.7")));
        assert!(!compatible(&v("0.9.2"), &v("0.10.0")));
    }
}
