//! HTTPS fetching for release descriptors and installation artifacts.
//!
//! Downloads stream to a `.part` sibling and rename into place only
//! after size and SHA-256 verification. An existing `.part` file is
//! resumed with a `Range` request; explicit cancellation removes it.
//! Standard `HTTPS_PROXY` / `NO_PROXY` variables are honored by the
//! underlying client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderValue, RANGE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, PortunixError, Result};
use crate::fsutil;

/// Expected properties of a downloaded artifact, from the release
/// descriptor or package catalog.
#[derive(Debug, Clone)]
pub struct ExpectedArtifact {
    /// Hex-encoded SHA-256 of the complete file
    pub sha256: String,
    /// Total size in bytes, when declared
    pub size: Option<u64>,
}

/// HTTPS client wrapper shared by the update engine and the installer.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    /// Build a client with the given total-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("portunix/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Fetch and deserialize a JSON document. Unknown fields are
    /// ignored by the serde models.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    /// Download `url` to `dest`, verifying against `expected` when
    /// given. The destination directory is created as needed.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        expected: Option<&ExpectedArtifact>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let part = part_sibling(dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let resume_from = match fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let result = self
            .stream_to_part(url, &part, resume_from, expected, cancel)
            .await;

        match result {
            Ok(()) => {}
            Err(err) => {
                if err.code() == ErrorCode::Cancelled {
                    // Cancellation removes the partial staging file;
                    // only an unexpected process death leaves one to
                    // resume from.
                    let _ = fs::remove_file(&part).await;
                }
                return Err(err);
            }
        }

        if let Some(expected) = expected {
            verify_part(&part, expected).await?;
        }

        fs::rename(&part, dest).await?;
        info!(url, dest = %dest.display(), "download complete");
        Ok(())
    }

    async fn stream_to_part(
        &self,
        url: &str,
        part: &Path,
        resume_from: u64,
        expected: Option<&ExpectedArtifact>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut request = self.client.get(url);
        if resume_from > 0 {
            debug!(url, offset = resume_from, "resuming partial download");
            request = request.header(
                RANGE,
                HeaderValue::from_str(&format!("bytes={}-", resume_from))
                    .map_err(|e| PortunixError::internal(e.to_string()))?,
            );
        }

        let response = request.send().await?;
        let status = response.status();

        // A server that ignores the Range header restarts the body from
        // zero; truncate so the part file matches.
        let (mut file, mut written) = if resume_from > 0 && status == StatusCode::PARTIAL_CONTENT {
            let file = fs::OpenOptions::new().append(true).open(part).await?;
            (file, resume_from)
        } else {
            if resume_from > 0 {
                warn!(url, "server does not support range requests, restarting download");
            }
            (fs::File::create(part).await?, 0)
        };

        let response = response.error_for_status()?;

        if let (Some(expected_size), Some(total)) = (
            expected.and_then(|e| e.size),
            response.content_length().map(|len| len + written),
        ) {
            if total != expected_size {
                return Err(PortunixError::with_internal(
                    ErrorCode::DownloadFailed,
                    format!("unexpected size for {}", url),
                    format!("declared {} bytes, server reports {}", expected_size, total),
                ));
            }
        }

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    return Err(PortunixError::cancelled(format!("download of {}", url)));
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(url, bytes = written, "body streamed");
        Ok(())
    }
}

async fn verify_part(part: &Path, expected: &ExpectedArtifact) -> Result<()> {
    if let Some(size) = expected.size {
        let actual = fs::metadata(part).await?.len();
        if actual != size {
            let _ = fs::remove_file(part).await;
            return Err(PortunixError::with_internal(
                ErrorCode::DownloadFailed,
                "downloaded file has the wrong size",
                format!("expected {} bytes, got {}", size, actual),
            ));
        }
    }

    let path = part.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || fsutil::sha256_file(&path))
        .await
        .map_err(|e| PortunixError::internal(e.to_string()))??;

    if !actual.eq_ignore_ascii_case(&expected.sha256) {
        let _ = fs::remove_file(part).await;
        return Err(PortunixError::checksum_mismatch(
            part.display().to_string(),
            expected.sha256.clone(),
            actual,
        ));
    }
    Ok(())
}

fn part_sibling(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_download_verifies_checksum() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("artifact.bin");
        let downloader = Downloader::new(Duration::from_secs(5)).unwrap();
        let expected = ExpectedArtifact {
            sha256: sha256_hex(b"payload"),
            size: Some(7),
        };

        downloader
            .download(
                &format!("{}/artifact", server.uri()),
                &dest,
                Some(&expected),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert!(!part_sibling(&dest).exists());
    }

    #[tokio::test]
    async fn test_download_rejects_checksum_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("artifact.bin");
        let downloader = Downloader::new(Duration::from_secs(5)).unwrap();
        let expected = ExpectedArtifact {
            sha256: sha256_hex(b"payload"),
            size: None,
        };

        let err = downloader
            .download(
                &format!("{}/artifact", server.uri()),
                &dest,
                Some(&expected),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ChecksumMismatch);
        assert_eq!(err.exit_code(), 6);
        assert!(!dest.exists());
        // The offending part file is removed as well.
        assert!(!part_sibling(&dest).exists());
    }

    #[tokio::test]
    async fn test_cancelled_download_removes_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 1 << 20])
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("slow.bin");
        let downloader = Downloader::new(Duration::from_secs(30)).unwrap();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = downloader
            .download(&format!("{}/slow", server.uri()), &dest, None, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert!(!part_sibling(&dest).exists());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_json_ignores_unknown_fields() {
        #[derive(serde::Deserialize)]
        struct Doc {
            version: String,
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"version": "1.7.5", "release_notes": "ignored"}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let downloader = Downloader::new(Duration::from_secs(5)).unwrap();
        let doc: Doc = downloader
            .fetch_json(&format!("{}/latest.json", server.uri()))
            .await
            .unwrap();
        assert_eq!(doc.version, "1.7.5");
    }
}
