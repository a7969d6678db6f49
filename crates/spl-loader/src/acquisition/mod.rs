//! Archive acquisition
//!
//! - [`listing`]: scrape the source page for archive names, URLs and MD5s
//! - [`downloader`]: streaming download with checksum verification
//! - [`coordinator`]: new-vs-processed dedup and bounded parallel fetch

pub mod coordinator;
pub mod downloader;
pub mod listing;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::HttpConfig;
use crate::error::{EtlError, Result};

pub use coordinator::AcquisitionCoordinator;
pub use downloader::ArchiveDownloader;
pub use listing::{parse_archive_list, ArchiveListing};

/// One archive that could not be fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFailure {
    pub archive: String,
    pub url: String,
    pub cause: String,
}

/// HTTP client shared by listing and download
pub fn build_client(http: &HttpConfig) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(http.timeout_secs))
        .user_agent(http.user_agent.clone())
        .build()?)
}

/// Run `op` until it succeeds, fails permanently, or exhausts
/// `http.max_retries` attempts. Only [`EtlError::is_retryable`] failures are
/// retried.
pub async fn with_retry<T, F, Fut>(http: &HttpConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = http.max_retries.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = http.backoff_delay(attempt);
                warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {:?}",
                    what, attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Extract every entry of `archive_path` under `dest`.
///
/// Entries whose names would escape `dest` are skipped. Returns the extracted
/// file paths.
pub async fn unzip_archive(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let archive_path = archive_path.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || extract_zip(&archive_path, &dest)).await?
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    info!("Extracting '{}' to '{}'", archive_path.display(), dest.display());

    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut extracted = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        let Some(relative) = entry.enclosed_name() else {
            warn!(
                "Skipping zip entry with unsafe path '{}' in {}",
                entry.name(),
                archive_path.display()
            );
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
        extracted.push(out_path);
    }

    info!(
        "Extracted {} file(s) from '{}'",
        extracted.len(),
        archive_path.display()
    );
    Ok(extracted)
}

/// Extract `archive_path` and, one level deep, any zip files it contained.
///
/// The full release ships label archives inside the outer archive; nested
/// archives are removed once expanded.
pub async fn unzip_nested(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in unzip_archive(archive_path, dest).await? {
        if is_zip(&path) {
            let inner_dest = path.with_extension("");
            files.extend(unzip_archive(&path, &inner_dest).await?);
            tokio::fs::remove_file(&path).await?;
        } else {
            files.push(path);
        }
    }
    Ok(files)
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Every `*.xml` file under `dir`, sorted
pub fn find_xml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
            {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

impl From<(&crate::models::Archive, &EtlError)> for ArchiveFailure {
    fn from((archive, error): (&crate::models::Archive, &EtlError)) -> Self {
        Self {
            archive: archive.name.clone(),
            url: archive.url.clone(),
            cause: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_unzip_and_find_xml() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("labels.zip");
        write_zip(
            &archive,
            &[
                ("a/one.xml", b"<document/>"),
                ("two.XML", b"<document/>"),
                ("image.jpg", b"\xff\xd8"),
            ],
        );

        let out = dir.path().join("out");
        let extracted = unzip_archive(&archive, &out).await.unwrap();
        assert_eq!(extracted.len(), 3);

        let xml = find_xml_files(&out).unwrap();
        assert_eq!(xml.len(), 2);
        assert!(xml.iter().all(|p| p.starts_with(&out)));
    }

    #[tokio::test]
    async fn test_unzip_nested_expands_inner_archives() {
        let dir = TempDir::new().unwrap();
        let inner = dir.path().join("inner.zip");
        write_zip(&inner, &[("label.xml", b"<document/>")]);
        let inner_bytes = std::fs::read(&inner).unwrap();

        let outer = dir.path().join("outer.zip");
        write_zip(&outer, &[("prescription/inner.zip", &inner_bytes)]);

        let out = dir.path().join("out");
        let files = unzip_nested(&outer, &out).await.unwrap();

        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("prescription/inner/label.xml"));
        assert!(!out.join("prescription/inner.zip").exists());
    }

    #[tokio::test]
    async fn test_unzip_rejects_corrupt_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("bad.zip");
        std::fs::write(&archive, b"not a zip").unwrap();

        let result = unzip_archive(&archive, dir.path()).await;
        assert!(matches!(result, Err(EtlError::Archive(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_permanent_error() {
        let http = HttpConfig::default();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&http, "listing fetch", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EtlError::HttpStatus {
                status: 404,
                url: "u".to_string(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_retries_transient_errors_up_to_ceiling() {
        let http = HttpConfig::default().with_max_retries(3);
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&http, "listing fetch", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EtlError::HttpStatus {
                status: 503,
                url: "u".to_string(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
