//! Full and delta load drivers
//!
//! Both drivers share one chain: parse with quarantine, transform into
//! intermediate files, stage, check counts, merge. Every run that gets past
//! schema verification leaves exactly one closed record in
//! `etl_load_history`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::acquisition::{find_xml_files, unzip_nested, AcquisitionCoordinator};
use crate::config::Settings;
use crate::error::{EtlError, Result};
use crate::models::{Archive, LoadMode, RunOutcome, RunRecord};
use crate::parsing::{parse_with_quarantine, RecordExtractor, SplXmlExtractor};
use crate::storage::{bulk_load_to_staging, LoaderBackend, MergeEngine, OptimizationManager};
use crate::transform::{create_writer, Transformer};

/// Outcome of one successful run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: i64,
    /// Rows persisted to staging and merged
    pub records_loaded: u64,
    pub documents: u64,
    pub quarantined: u64,
    /// Archives recorded as processed by this run
    pub archives: Vec<String>,
}

/// What the shared chain produced for one batch
#[derive(Debug, Default)]
struct BatchOutcome {
    records_loaded: u64,
    documents: u64,
    quarantined: u64,
}

/// Snapshot for `spl-loader status`
#[derive(Debug, Clone)]
pub struct LoaderStatus {
    pub recent_runs: Vec<RunRecord>,
    pub processed_archives: usize,
    pub deferred_schema_objects: usize,
}

pub struct Pipeline {
    settings: Settings,
    backend: Arc<dyn LoaderBackend>,
    extractor: Arc<dyn RecordExtractor>,
}

impl Pipeline {
    pub fn new(settings: Settings, backend: Arc<dyn LoaderBackend>) -> Self {
        Self {
            settings,
            backend,
            extractor: Arc::new(SplXmlExtractor::new()),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn RecordExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn backend(&self) -> &dyn LoaderBackend {
        self.backend.as_ref()
    }

    /// Create every table.
    pub async fn init(&self) -> Result<()> {
        info!("Initializing database schema ({})", self.backend.name());
        self.backend.initialize_schema().await
    }

    /// Replace production with the documents under `source`, or with every
    /// archive the source currently lists when `source` is `None`.
    pub async fn run_full_load(&self, source: Option<&Path>) -> Result<RunReport> {
        match source {
            Some(dir) => info!("Starting full data load from '{}'", dir.display()),
            None => info!("Starting full data load from {}", self.settings.source_url),
        }

        self.backend.verify_schema().await?;
        let run_id = self.backend.start_run(LoadMode::Full).await?;

        let result = self.full_load(source).await;
        self.finish_run(run_id, result, Vec::new()).await
    }

    /// Fetch archives not yet processed, merge them, and record them.
    pub async fn run_delta_load(&self) -> Result<RunReport> {
        info!("Starting delta data load from {}", self.settings.source_url);

        self.backend.verify_schema().await?;
        let run_id = self.backend.start_run(LoadMode::Delta).await?;

        let mut recorded = Vec::new();
        let result = self.delta_load(&mut recorded).await;
        self.finish_run(run_id, result, recorded).await
    }

    /// Recreate index/constraint definitions a crashed full load left dropped.
    pub async fn restore_schema(&self) -> Result<usize> {
        self.backend.verify_schema().await?;
        OptimizationManager::restore_pending(self.backend()).await
    }

    pub async fn status(&self, limit: u32) -> Result<LoaderStatus> {
        self.backend.verify_schema().await?;
        Ok(LoaderStatus {
            recent_runs: self.backend.recent_runs(limit).await?,
            processed_archives: self.backend.processed_archives().await?.len(),
            deferred_schema_objects: self.backend.pending_schema_objects().await?.len(),
        })
    }

    async fn full_load(&self, source: Option<&Path>) -> Result<BatchOutcome> {
        OptimizationManager::check_degraded(self.backend()).await?;
        let work = self.work_dir("spl-full-")?;

        let files = match source {
            Some(dir) => {
                info!("Step 1: Finding XML files in {}", dir.display());
                find_xml_files(dir)?
            },
            None => {
                info!("Step 1: Downloading every published archive");
                let coordinator = AcquisitionCoordinator::from_settings(&self.settings)?;
                let archives = coordinator.acquire_all().await?;
                self.extract_archives(&coordinator, &archives, work.path())
                    .await?
            },
        };

        self.process_batch(files, LoadMode::Full, work.path()).await
    }

    async fn delta_load(&self, recorded: &mut Vec<String>) -> Result<BatchOutcome> {
        OptimizationManager::check_degraded(self.backend()).await?;

        info!("Step 1: Checking for and downloading new archives");
        let coordinator = AcquisitionCoordinator::from_settings(&self.settings)?;
        let archives = coordinator.acquire_new(self.backend()).await?;
        if archives.is_empty() {
            info!("No new archives found. Database is up to date.");
            return Ok(BatchOutcome::default());
        }
        info!("Downloaded {} new archive(s)", archives.len());

        let work = self.work_dir("spl-delta-")?;
        let files = self
            .extract_archives(&coordinator, &archives, work.path())
            .await?;
        let outcome = self.process_batch(files, LoadMode::Delta, work.path()).await?;

        info!("Step 5: Recording processed archives");
        for archive in &archives {
            self.backend
                .record_processed_archive(&archive.name, &archive.checksum)
                .await?;
            recorded.push(archive.name.clone());
        }

        Ok(outcome)
    }

    fn work_dir(&self, prefix: &str) -> Result<TempDir> {
        std::fs::create_dir_all(&self.settings.data_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.settings.data_dir)?;
        info!("Working files will be stored in {}", dir.path().display());
        Ok(dir)
    }

    async fn extract_archives(
        &self,
        coordinator: &AcquisitionCoordinator,
        archives: &[Archive],
        work: &Path,
    ) -> Result<Vec<PathBuf>> {
        let xml_dir = work.join("xml");
        for archive in archives {
            let archive_path = coordinator.downloader().archive_path(archive);
            let stem = archive.name.trim_end_matches(".zip");
            unzip_nested(&archive_path, &xml_dir.join(stem)).await?;
        }

        if !xml_dir.exists() {
            return Ok(Vec::new());
        }
        find_xml_files(&xml_dir)
    }

    /// Parse, transform, stage, verify counts and merge one batch.
    async fn process_batch(
        &self,
        files: Vec<PathBuf>,
        mode: LoadMode,
        work: &Path,
    ) -> Result<BatchOutcome> {
        if files.is_empty() {
            warn!("No XML files found in the source. Nothing to load.");
            return Ok(BatchOutcome::default());
        }
        info!("Found {} XML file(s) to process", files.len());

        info!(
            "Step 2: Parsing and transforming in parallel (max_workers={})",
            self.settings.max_workers
        );
        let stream = parse_with_quarantine(
            Arc::clone(&self.extractor),
            files,
            self.settings.quarantine_path.clone(),
            self.settings.max_workers,
        );
        let intermediate_dir = work.join("intermediate");
        let writer = create_writer(self.settings.intermediate_format, &intermediate_dir)?;
        let summary = Transformer::new().transform_stream(stream, writer).await?;

        if summary.parse.quarantined > 0 {
            warn!("Quarantined {} file(s)", summary.parse.quarantined);
        }
        if summary.duplicates > 0 {
            warn!(
                "Kept the last of several copies for {} document(s)",
                summary.duplicates
            );
        }

        info!("Step 3: Loading data into staging");
        let backend = self.backend();
        let loaded = bulk_load_to_staging(backend, &intermediate_dir).await?;

        let transformed = summary.total_rows();
        if loaded != transformed {
            error!(
                transformed,
                loaded, "Data integrity check failed, aborting before merge"
            );
            return Err(EtlError::IntegrityMismatch {
                transformed,
                loaded,
            });
        }
        info!(
            "Data integrity check passed: {} transformed, {} loaded",
            transformed, loaded
        );

        info!("Step 4: Merging staged data into production");
        let mut optimizer =
            OptimizationManager::new(backend, self.settings.database.optimize_full_load());
        optimizer.pre_load(mode).await?;

        let merged = MergeEngine::new(backend).merge(mode).await;

        match (merged, optimizer.post_load().await) {
            (Ok(_), Ok(_)) => {},
            (Ok(_), Err(restore_error)) => return Err(restore_error),
            (Err(merge_error), Ok(_)) => return Err(merge_error),
            (Err(merge_error), Err(restore_error)) => {
                error!(
                    alarm = "schema_degraded",
                    "Restoring indexes after a failed merge also failed: {}", restore_error
                );
                return Err(merge_error);
            },
        }

        if let Err(e) = backend.maintenance().await {
            warn!("Post-load maintenance failed: {}", e);
        }
        info!("Database loading complete");

        Ok(BatchOutcome {
            records_loaded: loaded,
            documents: summary.documents,
            quarantined: summary.parse.quarantined,
        })
    }

    /// Close the run record exactly once, whatever `result` is.
    async fn finish_run(
        &self,
        run_id: i64,
        result: Result<BatchOutcome>,
        archives: Vec<String>,
    ) -> Result<RunReport> {
        match result {
            Ok(outcome) => {
                self.backend
                    .end_run(run_id, &RunOutcome::success(outcome.records_loaded))
                    .await?;
                info!(
                    run_id,
                    records = outcome.records_loaded,
                    "Load finished successfully"
                );
                Ok(RunReport {
                    run_id,
                    records_loaded: outcome.records_loaded,
                    documents: outcome.documents,
                    quarantined: outcome.quarantined,
                    archives,
                })
            },
            Err(e) => {
                error!(run_id, "Load failed: {}", e);
                let outcome = RunOutcome::failed(&e);
                if let Err(close_error) = self.backend.end_run(run_id, &outcome).await {
                    error!(run_id, "Could not close run record: {}", close_error);
                }
                Err(e)
            },
        }
    }
}
