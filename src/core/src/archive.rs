//! Archive extraction for plugin packages and downloaded artifacts.
//!
//! Supported formats are zip and gzipped tar, selected by file
//! extension. Entries escaping the destination directory are rejected.

use std::fs::File;
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{ErrorCode, PortunixError, Result};

/// Extract `archive` into `dest`, creating it as needed.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if name.ends_with(".zip") {
        extract_zip(archive, dest)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        extract_tar_gz(archive, dest)
    } else {
        Err(PortunixError::new(
            ErrorCode::InvalidInput,
            format!("unsupported archive format: {}", name),
        ))
    }
}

/// Whether a path looks like an archive this module can extract.
pub fn is_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    name.ends_with(".zip") || name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| PortunixError::with_internal(ErrorCode::IoError, "corrupt zip archive", e.to_string()))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| PortunixError::with_internal(ErrorCode::IoError, "corrupt zip entry", e.to_string()))?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(escape_error(entry.name()));
        };
        let target = dest.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }
    debug!(archive = %archive.display(), dest = %dest.display(), "zip extracted");
    Ok(())
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    for entry in tar.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        if !is_safe_relative(&rel) {
            return Err(escape_error(&rel.display().to_string()));
        }
        entry.unpack_in(dest)?;
    }
    debug!(archive = %archive.display(), dest = %dest.display(), "tarball extracted");
    Ok(())
}

fn is_safe_relative(path: &Path) -> bool {
    !path.is_absolute()
        && path
            .components()
            .all(|c| !matches!(c, Component::ParentDir | Component::Prefix(_)))
}

fn escape_error(entry: &str) -> PortunixError {
    PortunixError::new(
        ErrorCode::ValidationError,
        format!("archive entry escapes the extraction directory: {}", entry),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_tar_gz_round_trip() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pkg.tar.gz");

        // Build a small tarball with a nested file.
        {
            let file = File::create(&archive).unwrap();
            let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(gz);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "dir/hello.txt", &b"hello"[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = tmp.path().join("out");
        extract(&archive, &dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("dir/hello.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_zip_round_trip() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pkg.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file("bin/tool", zip::write::FileOptions::default())
                .unwrap();
            zip.write_all(b"#!/bin/sh\n").unwrap();
            zip.finish().unwrap();
        }

        let dest = tmp.path().join("out");
        extract(&archive, &dest).unwrap();
        assert!(dest.join("bin/tool").exists());
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pkg.rar");
        std::fs::write(&archive, b"x").unwrap();
        let err = extract(&archive, &tmp.path().join("out")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative(Path::new("a/b/c")));
        assert!(!is_safe_relative(Path::new("../escape")));
        assert!(!is_safe_relative(Path::new("/absolute")));
    }
}
