//! Parallel extraction with quarantine
//!
//! Files are extracted on blocking worker threads, at most `max_workers` at a
//! time. Successful records are handed downstream over a bounded channel as
//! they complete, so memory stays flat regardless of batch size. A file that
//! fails extraction is moved into the quarantine directory and the batch
//! carries on.

use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ExtractedDocument, RecordExtractor};
use crate::error::Result;

/// Counts reported once every file has been handled
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub parsed: u64,
    pub quarantined: u64,
    /// Where failed files ended up
    pub quarantined_files: Vec<PathBuf>,
}

/// Lazily produced extraction results.
///
/// Dropping the stream early is allowed: the remaining files are still
/// extracted (and quarantined when they fail) but their records are discarded.
pub struct ParsedStream {
    records: mpsc::Receiver<ExtractedDocument>,
    producer: JoinHandle<ParseSummary>,
}

impl ParsedStream {
    /// Next successfully extracted record, `None` once all files are done
    pub async fn next(&mut self) -> Option<ExtractedDocument> {
        self.records.recv().await
    }

    /// Stop consuming and wait for the remaining files to be handled.
    pub async fn finish(self) -> Result<ParseSummary> {
        drop(self.records);
        Ok(self.producer.await?)
    }
}

/// Extract every file in `files`, quarantining failures under
/// `quarantine_dir`.
pub fn parse_with_quarantine(
    extractor: Arc<dyn RecordExtractor>,
    files: Vec<PathBuf>,
    quarantine_dir: PathBuf,
    max_workers: usize,
) -> ParsedStream {
    let workers = max_workers.max(1);
    let (tx, rx) = mpsc::channel(workers * 2);

    let producer = tokio::spawn(async move {
        let total = files.len();
        info!("Parsing {} file(s) with {} worker(s)", total, workers);

        let mut summary = ParseSummary::default();
        let mut downstream_open = true;

        let mut results = stream::iter(files.into_iter().enumerate())
            .map(|(index, path)| {
                let extractor = Arc::clone(&extractor);
                async move {
                    let worker_path = path.clone();
                    let joined =
                        tokio::task::spawn_blocking(move || extractor.extract(&worker_path)).await;
                    let outcome = match joined {
                        Ok(result) => result
                            .map(|document| ExtractedDocument {
                                source_index: index,
                                ..document
                            })
                            .map_err(|e| e.to_string()),
                        Err(e) => Err(format!("extraction worker failed: {}", e)),
                    };
                    (path, outcome)
                }
            })
            .buffer_unordered(workers);

        while let Some((path, outcome)) = results.next().await {
            match outcome {
                Ok(document) => {
                    summary.parsed += 1;
                    if downstream_open && tx.send(document).await.is_err() {
                        debug!("Record consumer went away, discarding remaining records");
                        downstream_open = false;
                    }
                },
                Err(cause) => {
                    error!("Failed to parse {}: {}", path.display(), cause);
                    summary.quarantined += 1;
                    if let Some(dest) = quarantine_file(&path, &quarantine_dir).await {
                        summary.quarantined_files.push(dest);
                    }
                },
            }
        }

        info!(
            "Parsing complete: {} parsed, {} quarantined (of {})",
            summary.parsed, summary.quarantined, total
        );
        summary
    });

    ParsedStream {
        records: rx,
        producer,
    }
}

/// Move `path` into `quarantine_dir`, keeping its file name unless a file
/// of that name is already there, in which case a `-N` suffix is added.
///
/// Returns the new location, or `None` when the file could not be moved.
pub async fn quarantine_file(path: &Path, quarantine_dir: &Path) -> Option<PathBuf> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        warn!(
            "Cannot quarantine {}: source file no longer exists",
            path.display()
        );
        return None;
    }

    if let Err(e) = tokio::fs::create_dir_all(quarantine_dir).await {
        error!(
            "Cannot create quarantine directory {}: {}",
            quarantine_dir.display(),
            e
        );
        return None;
    }

    let dest = free_destination(path, quarantine_dir).await?;

    if tokio::fs::rename(path, &dest).await.is_ok() {
        warn!("Quarantined {} -> {}", path.display(), dest.display());
        return Some(dest);
    }

    // rename fails across filesystems
    let moved = async {
        tokio::fs::copy(path, &dest).await?;
        tokio::fs::remove_file(path).await
    }
    .await;

    match moved {
        Ok(()) => {
            warn!("Quarantined {} -> {}", path.display(), dest.display());
            Some(dest)
        },
        Err(e) => {
            error!("Failed to quarantine {}: {}", path.display(), e);
            None
        },
    }
}

/// First name in `quarantine_dir` not taken yet: `bad.xml`, `bad-1.xml`, ...
async fn free_destination(path: &Path, quarantine_dir: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?;
    let dest = quarantine_dir.join(file_name);
    if !tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        return Some(dest);
    }

    let stem = path.file_stem()?.to_string_lossy().into_owned();
    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    for n in 1u32.. {
        let candidate = quarantine_dir.join(format!("{}-{}{}", stem, n, extension));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }
    None
}
