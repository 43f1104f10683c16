//! HTTP downloads from the Apple CDN, with retry and hash verification.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use md5::Md5;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Attempts per download before giving up; each attempt uses a fresh
/// connection because the CDN occasionally wedges a keep-alive socket
/// mid-transfer.
const DOWNLOAD_ATTEMPTS: u32 = 5;

/// Errors raised while fetching artifacts from Apple.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// The request itself failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Writing the body to disk failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Every attempt of the retry budget failed.
    #[error("download of {url} failed after {DOWNLOAD_ATTEMPTS} attempts: {last_error}")]
    AttemptsExhausted {
        /// The URL being fetched.
        url: String,
        /// The final attempt's failure.
        last_error: String,
    },
}

/// Download `url` to `dest`, streaming to disk.
///
/// Retries transient failures up to the attempt budget with a fresh
/// client per attempt. The destination is truncated on each attempt, so a
/// partial body from a failed attempt never survives.
pub async fn download_url_to_file(url: &str, dest: &Path) -> Result<(), DownloadError> {
    let mut last_error = String::new();

    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        match try_download(url, dest).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(url, attempt, error = %err, "download attempt failed");
                last_error = err.to_string();
            }
        }
    }

    Err(DownloadError::AttemptsExhausted {
        url: url.to_string(),
        last_error,
    })
}

async fn try_download(url: &str, dest: &Path) -> Result<(), DownloadError> {
    let client = reqwest::Client::new();
    let response = client.get(url).send().await?.error_for_status()?;

    if let Some(total) = response.content_length() {
        tracing::debug!(url, total_mib = total / (1024 * 1024), "starting download");
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Whether the file at `path` hashes (SHA-1) to `expected` (hex).
pub async fn check_sha1(expected: &str, path: &Path) -> std::io::Result<bool> {
    let actual = file_digest_hex::<Sha1>(path.to_path_buf()).await?;
    Ok(actual.eq_ignore_ascii_case(expected))
}

/// Hex MD5 of a local file, for comparison against store-blob hashes.
pub async fn file_md5_hex(path: &Path) -> std::io::Result<String> {
    file_digest_hex::<Md5>(path.to_path_buf()).await
}

async fn file_digest_hex<D: Digest>(path: PathBuf) -> std::io::Result<String>
where
    D: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = D::new();
        let mut buffer = [0u8; 1 << 16];
        loop {
            let count = file.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}
