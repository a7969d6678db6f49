//! Staging loader
//!
//! Maps every intermediate file in a directory to its staging table and hands
//! it to the backend's bulk path. Staging is emptied first so rows left by an
//! earlier failed merge never leak into this batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::LoaderBackend;
use crate::error::{EtlError, Result};
use crate::tables::TableKind;
use crate::transform::file_format;

/// Intermediate files (`.csv` or `.parquet`) in `dir` keyed by table.
/// Unrecognized names are logged and ignored; two files for one table are an
/// error.
pub fn staging_files(dir: &Path) -> Result<BTreeMap<TableKind, PathBuf>> {
    let mut files = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || file_format(&path).is_none() {
            continue;
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        match TableKind::from_file_stem(&stem) {
            Some(table) => {
                if let Some(other) = files.insert(table, path.clone()) {
                    return Err(EtlError::config(format!(
                        "both {} and {} hold rows for {}",
                        other.display(),
                        path.display(),
                        table
                    )));
                }
            },
            None => warn!(
                "No staging table for intermediate file {}, skipping",
                path.display()
            ),
        }
    }

    Ok(files)
}

/// Load every intermediate file in `dir` into staging, parents first.
///
/// Returns the total rows persisted across all staging tables.
pub async fn bulk_load_to_staging(backend: &dyn LoaderBackend, dir: &Path) -> Result<u64> {
    info!("Starting bulk load to staging from {}", dir.display());

    let files = staging_files(dir)?;
    backend.clear_staging().await?;

    let mut total = 0;
    for (table, path) in &files {
        total += backend.load_staging_file(*table, path).await?;
    }

    info!(
        "Bulk load complete: {} row(s) staged across {} file(s)",
        total,
        files.len()
    );
    Ok(total)
}
