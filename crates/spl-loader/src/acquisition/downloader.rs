//! Streaming archive download with MD5 verification

use futures::StreamExt;
use reqwest::Client;
use spl_common::checksum::{checksums_match, verify_file_checksum, ChecksumAlgorithm, StreamingChecksum};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::with_retry;
use crate::config::HttpConfig;
use crate::error::{EtlError, Result};
use crate::models::Archive;

pub struct ArchiveDownloader {
    client: Client,
    http: HttpConfig,
    download_dir: PathBuf,
    reuse_verified: bool,
}

impl ArchiveDownloader {
    pub fn new(client: Client, http: HttpConfig, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            http,
            download_dir: download_dir.into(),
            reuse_verified: false,
        }
    }

    /// Skip the transfer when a file with a matching checksum is already on disk
    pub fn reuse_verified_files(mut self, reuse: bool) -> Self {
        self.reuse_verified = reuse;
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn archive_path(&self, archive: &Archive) -> PathBuf {
        self.download_dir.join(&archive.name)
    }

    /// Download `archive` and verify its checksum.
    ///
    /// Transient failures are retried with backoff. A checksum mismatch is
    /// final: the file is deleted and the error returned without retrying.
    pub async fn download(&self, archive: &Archive) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self.archive_path(archive);

        if self.reuse_verified && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let existing = path.clone();
            let expected = archive.checksum.clone();
            let verified = tokio::task::spawn_blocking(move || {
                verify_file_checksum(&existing, &expected, ChecksumAlgorithm::Md5)
            })
            .await?;
            if verified.is_ok() {
                info!("Reusing verified {} at {}", archive.name, path.display());
                return Ok(path);
            }
            debug!("Existing {} does not verify, downloading again", archive.name);
        }

        info!("Downloading {} to {}", archive.url, path.display());

        let result = with_retry(&self.http, &format!("Download of {}", archive.name), || {
            self.download_once(archive, &path)
        })
        .await;

        match result {
            Ok(actual) if checksums_match(&archive.checksum, &actual) => {
                info!("Checksum verified for {}", archive.name);
                Ok(path)
            },
            Ok(actual) => {
                error!(
                    "Data integrity error for {}: expected {}, got {}",
                    archive.name, archive.checksum, actual
                );
                remove_partial(&path).await;
                Err(EtlError::ChecksumMismatch {
                    archive: archive.name.clone(),
                    expected: archive.checksum.clone(),
                    actual,
                })
            },
            Err(e) => {
                error!("Download of {} failed: {}", archive.name, e);
                remove_partial(&path).await;
                Err(e)
            },
        }
    }

    /// One transfer attempt; returns the MD5 of the bytes written.
    async fn download_once(&self, archive: &Archive, path: &Path) -> Result<String> {
        let response = self.client.get(&archive.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EtlError::HttpStatus {
                status: status.as_u16(),
                url: archive.url.clone(),
            });
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut checksum = StreamingChecksum::new(ChecksumAlgorithm::Md5);
        let mut written: u64 = 0;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            checksum.update(&chunk);
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Wrote {} bytes for {}", written, archive.name);
        Ok(checksum.finalize_hex())
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!("Could not remove partial download {}: {}", path.display(), e);
        }
    }
}
