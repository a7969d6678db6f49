//! Stateful acquisition
//!
//! Compares what the source publishes with the durable processed-archive
//! ledger and fetches only the difference, `max_workers` downloads at a time.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

use super::{build_client, ArchiveDownloader, ArchiveFailure, ArchiveListing};
use crate::config::Settings;
use crate::error::{EtlError, Result};
use crate::models::Archive;
use crate::storage::LoaderBackend;

pub struct AcquisitionCoordinator {
    listing: ArchiveListing,
    downloader: ArchiveDownloader,
    max_workers: usize,
}

impl AcquisitionCoordinator {
    pub fn new(listing: ArchiveListing, downloader: ArchiveDownloader, max_workers: usize) -> Self {
        Self {
            listing,
            downloader,
            max_workers: max_workers.max(1),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let client = build_client(&settings.http)?;
        let listing = ArchiveListing::new(
            client.clone(),
            settings.http.clone(),
            settings.source_url.clone(),
        );
        // A batch that failed after downloading leaves verified archives behind
        let downloader =
            ArchiveDownloader::new(client, settings.http.clone(), settings.download_path.clone())
                .reuse_verified_files(true);
        Ok(Self::new(listing, downloader, settings.max_workers))
    }

    pub fn downloader(&self) -> &ArchiveDownloader {
        &self.downloader
    }

    /// Archives in `available` whose names are not in `processed`, sorted by
    /// name. Duplicate names keep their first listing.
    pub fn select_new(available: Vec<Archive>, processed: &BTreeSet<String>) -> Vec<Archive> {
        let mut by_name: BTreeMap<String, Archive> = BTreeMap::new();
        for archive in available {
            if !processed.contains(&archive.name) {
                by_name.entry(archive.name.clone()).or_insert(archive);
            }
        }
        by_name.into_values().collect()
    }

    /// Download every published archive not yet recorded as processed.
    ///
    /// An unreadable ledger yields an empty result instead of re-fetching
    /// everything. Download failures come back as
    /// [`EtlError::PartialBatch`], which still carries the successes.
    pub async fn acquire_new(&self, backend: &dyn LoaderBackend) -> Result<Vec<Archive>> {
        info!("Starting stateful SPL data acquisition");

        let processed = match backend.processed_archives().await {
            Ok(processed) => processed,
            Err(e) => {
                error!(
                    "Could not read processed archives, aborting acquisition: {}",
                    e
                );
                return Ok(Vec::new());
            },
        };

        let available = self.listing.fetch().await?;
        if available.is_empty() {
            warn!("No archives found at source. Nothing to download.");
            return Ok(Vec::new());
        }

        let new_archives = Self::select_new(available, &processed);
        if new_archives.is_empty() {
            info!("No new archives to download. Database is up to date.");
            return Ok(Vec::new());
        }

        info!(
            "Found {} new archive(s) ({} already processed)",
            new_archives.len(),
            processed.len()
        );
        self.download_batch(new_archives).await
    }

    /// Download every published archive, ignoring the ledger.
    pub async fn acquire_all(&self) -> Result<Vec<Archive>> {
        info!("Starting download of all SPL archives");

        let available = self.listing.fetch().await?;
        if available.is_empty() {
            warn!("No archives found at source. Nothing to download.");
            return Ok(Vec::new());
        }

        let archives = Self::select_new(available, &BTreeSet::new());
        info!("Found {} archive(s) to download", archives.len());
        self.download_batch(archives).await
    }

    /// Download `archives` concurrently.
    ///
    /// Every archive is attempted. Returns the successful downloads sorted by
    /// name, or a [`EtlError::PartialBatch`] naming each failure.
    pub async fn download_batch(&self, archives: Vec<Archive>) -> Result<Vec<Archive>> {
        let total = archives.len();
        let downloader = &self.downloader;

        let results: Vec<(Archive, Result<std::path::PathBuf>)> = stream::iter(archives)
            .map(|archive| async move {
                let result = downloader.download(&archive).await;
                (archive, result)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let mut downloaded = Vec::new();
        let mut failures = Vec::new();
        for (archive, result) in results {
            match result {
                Ok(_) => downloaded.push(archive),
                Err(e) => {
                    error!(
                        "Failed to download {} from {}: {}",
                        archive.name, archive.url, e
                    );
                    failures.push(ArchiveFailure::from((&archive, &e)));
                },
            }
        }

        downloaded.sort_by(|a, b| a.name.cmp(&b.name));
        failures.sort_by(|a, b| a.archive.cmp(&b.archive));

        if !failures.is_empty() {
            return Err(EtlError::PartialBatch {
                failures,
                downloaded,
            });
        }

        info!(
            "Data acquisition complete: downloaded {} of {} archive(s)",
            downloaded.len(),
            total
        );
        Ok(downloaded)
    }
}
