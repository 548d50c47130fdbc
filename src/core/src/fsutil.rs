//! Filesystem primitives shared by the registry, the self-update
//! engine, and the installer.
//!
//! The two-phase write discipline (temp file + atomic rename) lives
//! here so that every persistent mutation in the codebase goes through
//! the same code path.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{PortunixError, Result};

/// Platform executable suffix (".exe" on Windows, empty elsewhere).
pub const EXE_SUFFIX: &str = std::env::consts::EXE_SUFFIX;

/// Write `contents` to `path` atomically: write to a `.tmp` sibling,
/// flush, then rename into place. Readers never observe a partial file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PortunixError::internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let tmp = tmp_sibling(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Atomically replace `live` with `staged` using a platform-appropriate
/// strategy.
///
/// On POSIX a plain rename suffices because staging directories are
/// created adjacent to the install root (same filesystem). On Windows
/// the live file is first renamed to a `.old` sibling, which is allowed
/// while the binary is executing, then the staged file is renamed into
/// place; the `.old` sibling is removed on the next run.
pub fn atomic_replace(staged: &Path, live: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        fs::rename(staged, live)?;
        Ok(())
    }

    #[cfg(windows)]
    {
        let old = old_sibling(live);
        if live.exists() {
            fs::rename(live, &old)?;
        }
        if let Err(err) = fs::rename(staged, live) {
            // Restore the live file before surfacing the failure.
            let _ = fs::rename(&old, live);
            return Err(err.into());
        }
        Ok(())
    }
}

/// The `.old` sibling left behind by a Windows commit.
pub fn old_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".old");
    path.with_file_name(name)
}

/// Remove `.old` siblings left behind by a previous Windows commit.
/// Failures are reported but do not block the caller.
pub fn sweep_old_siblings(dir: &Path) -> Vec<PathBuf> {
    let mut failed = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return failed;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "old") && fs::remove_file(&path).is_err() {
            failed.push(path);
        }
    }
    failed
}

/// Compute the SHA-256 digest of a file, hex-encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| {
        PortunixError::with_internal(
            crate::error::ErrorCode::IoError,
            format!("cannot read {}", path.display()),
            e.to_string(),
        )
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recursively copy a directory tree.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Mark a file executable (no-op on Windows, where execution is
/// extension-driven).
pub fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Whether a path exists and carries an execute bit (always true for
/// existing files on Windows).
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Directory of the currently running executable, with symlinks
/// resolved. This is the default install root.
pub fn current_exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let resolved = fs::canonicalize(&exe)?;
    resolved
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| PortunixError::internal("running executable has no parent directory"))
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry").join("plugins.json");
        atomic_write(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
        // No stray temp file left behind.
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_sha256_known_vector() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_copy_dir_all() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a"), b"1").unwrap();
        fs::write(src.join("nested/b"), b"2").unwrap();

        let dst = tmp.path().join("dst");
        copy_dir_all(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("a")).unwrap(), b"1");
        assert_eq!(fs::read(dst.join("nested/b")).unwrap(), b"2");
    }

    #[cfg(unix)]
    #[test]
    fn test_set_executable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bin");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        assert!(!is_executable(&path));
        set_executable(&path).unwrap();
        assert!(is_executable(&path));
    }

    #[test]
    fn test_old_sibling_name() {
        assert_eq!(
            old_sibling(Path::new("/opt/portunix/portunix")),
            PathBuf::from("/opt/portunix/portunix.old")
        );
    }
}
