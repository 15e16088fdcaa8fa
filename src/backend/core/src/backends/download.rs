use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::Progress;
use crate::error::{ErrorCode, ForgeError, Result};

/// Share of the overall progress bar covered by the download.
pub(super) const DOWNLOAD_START: u8 = 10;
pub(super) const DOWNLOAD_END: u8 = 70;

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn scaled(done: u64, total: u64) -> u8 {
    if total == 0 {
        return DOWNLOAD_START;
    }
    let span = u64::from(DOWNLOAD_END - DOWNLOAD_START);
    DOWNLOAD_START + (done.min(total) * span / total) as u8
}

/// Stream `url` into `dest` through a `.part` file, verifying the sha256
/// when one is given. Progress is reported at every `chunk_size` boundary.
pub(super) async fn download_file(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    expected_sha256: Option<&str>,
    chunk_size: u64,
    progress: Progress<'_>,
) -> Result<u64> {
    let response = http.get(url).send().await.map_err(|e| download_failed(url, e.to_string()))?;
    if !response.status().is_success() {
        return Err(download_failed(url, format!("HTTP {}", response.status())));
    }
    let total = response.content_length().unwrap_or(0);

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = part_path(dest);
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();
    let chunk_size = chunk_size.max(1);
    let mut downloaded = 0u64;
    let mut next_report = chunk_size;

    progress(DOWNLOAD_START, "Downloading");
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(download_failed(url, e.to_string()));
            }
        };
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if downloaded >= next_report {
            next_report = (downloaded / chunk_size + 1) * chunk_size;
            let message = if total > 0 {
                format!("Downloading {} / {} MiB", downloaded >> 20, total >> 20)
            } else {
                format!("Downloading {} MiB", downloaded >> 20)
            };
            progress(scaled(downloaded, total), &message);
        }
    }
    file.flush().await?;
    drop(file);

    if let Some(expected) = expected_sha256 {
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ForgeError::new(ErrorCode::DigestMismatch, "Downloaded file failed sha256 verification")
                .with_context("expected", expected)
                .with_context("actual", actual));
        }
        debug!(url, "sha256 verified");
    }

    tokio::fs::rename(&tmp, dest).await?;
    progress(DOWNLOAD_END, "Download complete");
    info!(url, bytes = downloaded, path = %dest.display(), "Downloaded");
    Ok(downloaded)
}

fn download_failed(url: &str, reason: String) -> ForgeError {
    ForgeError::new(ErrorCode::DownloadFailed, "Download failed")
        .with_internal_message(format!("{}: {}", url, reason))
        .with_context("url", url)
}
