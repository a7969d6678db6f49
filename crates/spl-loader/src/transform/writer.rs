//! Intermediate files
//!
//! One file per table, named after [`TableKind::file_stem`], columns in
//! [`TableKind::columns`] order. The CSV variant is headerless with SQL NULL
//! written as `\N`, the format Postgres `COPY ... (FORMAT CSV, NULL '\N')`
//! reads natively. The Parquet variant lives in [`super::columnar`].
//!
//! Rows can be discarded after they were written (a later copy of the same
//! document superseded them); [`IntermediateWriter::finish`] rewrites the
//! affected files without them.

use csv::{ReaderBuilder, Writer, WriterBuilder};
use std::collections::BTreeMap;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::columnar::ParquetIntermediateWriter;
use crate::config::IntermediateFormat;
use crate::error::{EtlError, Result};
use crate::tables::TableKind;

/// Marker for SQL NULL in intermediate CSV files
pub const NULL_MARKER: &str = "\\N";

/// Rows written per table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub rows: BTreeMap<TableKind, u64>,
}

impl WriterStats {
    pub fn total(&self) -> u64 {
        self.rows.values().sum()
    }

    pub fn get(&self, table: TableKind) -> u64 {
        self.rows.get(&table).copied().unwrap_or(0)
    }
}

/// Row positions (0-based, per table file) to leave out of the final files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowDiscards {
    ranges: BTreeMap<TableKind, Vec<Range<u64>>>,
}

impl RowDiscards {
    pub fn add(&mut self, table: TableKind, rows: Range<u64>) {
        if !rows.is_empty() {
            self.ranges.entry(table).or_default().push(rows);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = TableKind> + '_ {
        self.ranges.keys().copied()
    }

    pub fn contains(&self, table: TableKind, row: u64) -> bool {
        self.ranges
            .get(&table)
            .is_some_and(|ranges| ranges.iter().any(|r| r.contains(&row)))
    }

    pub fn count(&self, table: TableKind) -> u64 {
        self.ranges
            .get(&table)
            .map_or(0, |ranges| ranges.iter().map(|r| r.end - r.start).sum())
    }
}

/// Sink for validated rows, one file per table.
pub trait IntermediateWriter: Send {
    fn format(&self) -> IntermediateFormat;

    fn output_dir(&self) -> &Path;

    /// Append one row of `table`; `None` is SQL NULL
    fn write_fields(&mut self, table: TableKind, fields: Vec<Option<String>>) -> Result<()>;

    fn stats(&self) -> &WriterStats;

    /// Flush and close every file, leaving out the `discarded` rows.
    fn finish(self: Box<Self>, discarded: &RowDiscards) -> Result<WriterStats>;
}

/// Open a writer of the configured format in `output_dir`.
pub fn create_writer(
    format: IntermediateFormat,
    output_dir: impl Into<PathBuf>,
) -> Result<Box<dyn IntermediateWriter>> {
    info!("Writing {} intermediate files", format);
    Ok(match format {
        IntermediateFormat::Csv => Box::new(CsvIntermediateWriter::create(output_dir)?),
        IntermediateFormat::Parquet => Box::new(ParquetIntermediateWriter::create(output_dir)?),
    })
}

/// Path of the intermediate file for `table` in `output_dir`
pub fn intermediate_path(output_dir: &Path, table: TableKind, format: IntermediateFormat) -> PathBuf {
    output_dir.join(format!("{}.{}", table.file_stem(), format.extension()))
}

pub struct CsvIntermediateWriter {
    output_dir: PathBuf,
    writers: BTreeMap<TableKind, Writer<File>>,
    stats: WriterStats,
}

impl CsvIntermediateWriter {
    /// Create `output_dir` and one empty file per table.
    pub fn create(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;

        let mut writers = BTreeMap::new();
        for table in TableKind::DEPENDENCY_ORDER {
            let path = Self::file_path(&output_dir, table);
            let writer = WriterBuilder::new().has_headers(false).from_path(&path)?;
            writers.insert(table, writer);
        }

        debug!("Opened intermediate files in {}", output_dir.display());

        Ok(Self {
            output_dir,
            writers,
            stats: WriterStats::default(),
        })
    }

    pub fn file_path(output_dir: &Path, table: TableKind) -> PathBuf {
        intermediate_path(output_dir, table, IntermediateFormat::Csv)
    }

    /// Rewrite one closed file without the discarded rows
    fn compact(&self, table: TableKind, discarded: &RowDiscards) -> Result<u64> {
        let path = Self::file_path(&self.output_dir, table);
        let tmp = path.with_extension("csv.tmp");

        let mut reader = ReaderBuilder::new().has_headers(false).from_path(&path)?;
        let mut writer = WriterBuilder::new().has_headers(false).from_path(&tmp)?;

        let mut removed = 0;
        for (row, record) in reader.byte_records().enumerate() {
            let record = record?;
            if discarded.contains(table, row as u64) {
                removed += 1;
                continue;
            }
            writer.write_byte_record(&record)?;
        }
        writer.flush()?;
        drop(writer);

        std::fs::rename(&tmp, &path)?;
        Ok(removed)
    }
}

impl IntermediateWriter for CsvIntermediateWriter {
    fn format(&self) -> IntermediateFormat {
        IntermediateFormat::Csv
    }

    fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn write_fields(&mut self, table: TableKind, fields: Vec<Option<String>>) -> Result<()> {
        let writer = self.writers.get_mut(&table).ok_or_else(|| {
            EtlError::config(format!("no intermediate file open for {}", table))
        })?;

        let record = fields
            .into_iter()
            .map(|field| field.unwrap_or_else(|| NULL_MARKER.to_string()));
        writer.write_record(record)?;

        *self.stats.rows.entry(table).or_insert(0) += 1;
        Ok(())
    }

    fn stats(&self) -> &WriterStats {
        &self.stats
    }

    fn finish(mut self: Box<Self>, discarded: &RowDiscards) -> Result<WriterStats> {
        for (_, mut writer) in std::mem::take(&mut self.writers) {
            writer.flush()?;
        }

        for table in discarded.tables() {
            let removed = self.compact(table, discarded)?;
            if let Some(rows) = self.stats.rows.get_mut(&table) {
                *rows -= removed;
            }
            debug!("Removed {} superseded row(s) from {}", removed, table);
        }

        info!(
            "Intermediate files closed. Total rows written: {}",
            self.stats.total()
        );
        Ok(self.stats.clone())
    }
}
