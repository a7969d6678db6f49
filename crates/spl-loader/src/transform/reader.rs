//! Batched reading of intermediate files
//!
//! Both formats come back as rows of optional strings in the textual form
//! of the CSV files, so backends bind or re-encode them without caring which
//! format the transform stage wrote.

use csv::{ByteRecord, Reader, ReaderBuilder, WriterBuilder};
use parquet::arrow::arrow_reader::ParquetRecordBatchReader;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

use super::columnar;
use super::writer::NULL_MARKER;
use crate::config::IntermediateFormat;
use crate::error::{EtlError, Result};
use crate::tables::TableKind;

/// One intermediate row; `None` is SQL NULL
pub type FieldRow = Vec<Option<String>>;

/// Format of an intermediate file, from its extension
pub fn file_format(path: &Path) -> Option<IntermediateFormat> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(IntermediateFormat::from_extension)
}

enum Source {
    Csv {
        reader: Reader<File>,
        record: ByteRecord,
    },
    Parquet(ParquetRecordBatchReader),
}

pub struct IntermediateReader {
    table: TableKind,
    path: PathBuf,
    batch_rows: usize,
    rows_read: u64,
    source: Source,
}

impl IntermediateReader {
    pub fn open(table: TableKind, path: &Path, batch_rows: usize) -> Result<Self> {
        let source = match file_format(path) {
            Some(IntermediateFormat::Csv) => Source::Csv {
                reader: ReaderBuilder::new().has_headers(false).from_path(path)?,
                record: ByteRecord::new(),
            },
            Some(IntermediateFormat::Parquet) => {
                Source::Parquet(columnar::open_reader(path, batch_rows)?)
            },
            None => {
                return Err(EtlError::Parse {
                    file: path.display().to_string(),
                    message: "not a .csv or .parquet intermediate file".to_string(),
                })
            },
        };

        Ok(Self {
            table,
            path: path.to_path_buf(),
            batch_rows: batch_rows.max(1),
            rows_read: 0,
            source,
        })
    }

    /// Rows returned so far
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Up to `batch_rows` further rows; empty once the file is exhausted.
    pub fn next_batch(&mut self) -> Result<Vec<FieldRow>> {
        let rows = match &mut self.source {
            Source::Csv { reader, record } => {
                let width = self.table.columns().len();
                let mut rows = Vec::with_capacity(self.batch_rows);
                while rows.len() < self.batch_rows && reader.read_byte_record(record)? {
                    let line = self.rows_read + rows.len() as u64 + 1;
                    if record.len() != width {
                        return Err(EtlError::Parse {
                            file: self.path.display().to_string(),
                            message: format!(
                                "record {} has {} field(s), {} expects {}",
                                line,
                                record.len(),
                                self.table.staging_table_name(),
                                width
                            ),
                        });
                    }
                    rows.push(decode_record(record, &self.path, line)?);
                }
                rows
            },
            Source::Parquet(batches) => match batches.next() {
                Some(batch) => columnar::batch_to_rows(self.table, &self.path, &batch?)?,
                None => Vec::new(),
            },
        };

        self.rows_read += rows.len() as u64;
        Ok(rows)
    }
}

fn decode_record(record: &ByteRecord, path: &Path, line: u64) -> Result<FieldRow> {
    record
        .iter()
        .map(|field| {
            if field == NULL_MARKER.as_bytes() {
                return Ok(None);
            }
            String::from_utf8(field.to_vec())
                .map(Some)
                .map_err(|_| EtlError::Parse {
                    file: path.display().to_string(),
                    message: format!("record {} is not valid UTF-8", line),
                })
        })
        .collect()
}

/// Read `path` on a blocking thread, handing batches over a bounded channel.
///
/// The channel ends after the last batch or after the first error.
pub fn stream_batches(
    table: TableKind,
    path: PathBuf,
    batch_rows: usize,
) -> mpsc::Receiver<Result<Vec<FieldRow>>> {
    let (tx, rx) = mpsc::channel(2);

    tokio::task::spawn_blocking(move || {
        let mut reader = match IntermediateReader::open(table, &path, batch_rows) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            },
        };

        loop {
            match reader.next_batch() {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    if tx.blocking_send(Ok(batch)).is_err() {
                        debug!("Reader for {} dropped, stopping early", path.display());
                        break;
                    }
                },
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                },
            }
        }
        debug!("Read {} row(s) from {}", reader.rows_read(), path.display());
    });

    rx
}

/// Encode rows as headerless CSV with `\N` for NULL
pub fn encode_csv(rows: &[FieldRow]) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    for row in rows {
        writer.write_record(row.iter().map(|f| f.as_deref().unwrap_or(NULL_MARKER)))?;
    }
    writer
        .into_inner()
        .map_err(|e| EtlError::Io(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntermediateFormat;
    use crate::transform::writer::{create_writer, intermediate_path, IntermediateWriter, RowDiscards};
    use tempfile::TempDir;

    #[test]
    fn test_csv_rows_decode_null_and_quoted_commas() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("packaging.csv");
        std::fs::write(&path, "d1,0001-0001-01,\"30 TABLET in 1 BOTTLE, PLASTIC\",\\N\n").unwrap();

        let mut reader = IntermediateReader::open(TableKind::Packaging, &path, 10).unwrap();
        let rows = reader.next_batch().unwrap();
        assert_eq!(
            rows,
            vec![vec![
                Some("d1".to_string()),
                Some("0001-0001-01".to_string()),
                Some("30 TABLET in 1 BOTTLE, PLASTIC".to_string()),
                None
            ]]
        );
        assert!(reader.next_batch().unwrap().is_empty());
    }

    #[test]
    fn test_csv_wrong_width_names_the_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("product_ndcs.csv");
        std::fs::write(&path, "a1,0001-0001\na2\n").unwrap();

        let mut reader = IntermediateReader::open(TableKind::ProductNdcs, &path, 10).unwrap();
        let err = reader.next_batch().unwrap_err();
        assert!(err.to_string().contains("record 2"));
    }

    #[test]
    fn test_batches_are_bounded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("product_ndcs.csv");
        let content: String = (0..7).map(|i| format!("d{},0001-000{}\n", i, i)).collect();
        std::fs::write(&path, content).unwrap();

        let mut reader = IntermediateReader::open(TableKind::ProductNdcs, &path, 3).unwrap();
        let sizes: Vec<usize> = std::iter::from_fn(|| {
            let batch = reader.next_batch().unwrap();
            (!batch.is_empty()).then_some(batch.len())
        })
        .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(reader.rows_read(), 7);
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("products.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(IntermediateReader::open(TableKind::Products, &path, 10).is_err());
    }

    #[tokio::test]
    async fn test_stream_reads_both_formats_alike() {
        let dir = TempDir::new().unwrap();
        let row = vec![Some("d1".to_string()), Some("0777-3105-02".to_string())];

        for format in [IntermediateFormat::Csv, IntermediateFormat::Parquet] {
            let out = dir.path().join(format.as_str());
            let mut writer = create_writer(format, &out).unwrap();
            for _ in 0..5 {
                writer.write_fields(TableKind::ProductNdcs, row.clone()).unwrap();
            }
            writer.finish(&RowDiscards::default()).unwrap();

            let path = intermediate_path(&out, TableKind::ProductNdcs, format);
            let mut rx = stream_batches(TableKind::ProductNdcs, path, 2);
            let mut rows = Vec::new();
            while let Some(batch) = rx.recv().await {
                rows.extend(batch.unwrap());
            }
            assert_eq!(rows, vec![row.clone(); 5], "{} rows differ", format);
        }
    }

    #[test]
    fn test_encode_csv_matches_writer_output() {
        let rows = vec![vec![
            Some("d1".to_string()),
            Some("a, b".to_string()),
            None,
        ]];
        let bytes = encode_csv(&rows).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "d1,\"a, b\",\\N\n");
    }
}
