//! Parquet intermediate files
//!
//! Typed columns (`Utf8`, `Int64`, `Boolean`, `Date32`, UTC microsecond
//! timestamps) derived from [`TableKind::columns`]. Rows are buffered per
//! table and written as one record batch every [`ROWS_PER_BATCH`] rows.

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Date32Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::compute::filter_record_batch;
use arrow::datatypes::{
    DataType, Date32Type, Field, Int64Type, Schema, SchemaRef, TimeUnit, TimestampMicrosecondType,
};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::writer::{intermediate_path, IntermediateWriter, RowDiscards, WriterStats};
use crate::config::IntermediateFormat;
use crate::error::{EtlError, Result};
use crate::models::{parse_iso_date, INTERMEDIATE_DATE_FORMAT};
use crate::tables::{Column, ColumnType, TableKind};

pub const ROWS_PER_BATCH: usize = 10_000;

/// `0001-01-01` to `1970-01-01` in days
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn data_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Uuid | ColumnType::Text | ColumnType::Json => DataType::Utf8,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Date => DataType::Date32,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

/// Arrow schema of the intermediate file for `table`
pub fn table_schema(table: TableKind) -> SchemaRef {
    let fields: Vec<Field> = table
        .columns()
        .iter()
        .map(|c| Field::new(c.name, data_type(c.column_type), true))
        .collect();
    Arc::new(Schema::new(fields))
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_created_by(concat!("spl-loader ", env!("CARGO_PKG_VERSION")).to_string())
        .build()
}

fn invalid(path: &Path, message: String) -> EtlError {
    EtlError::Parse {
        file: path.display().to_string(),
        message,
    }
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
}

/// Typed array for one column of buffered string rows
fn build_column(
    path: &Path,
    column: &Column,
    values: Vec<Option<&str>>,
) -> Result<ArrayRef> {
    let bad = |value: &str, expected: &str| {
        invalid(
            path,
            format!("column {}: '{}' is not {}", column.name, value, expected),
        )
    };

    let array: ArrayRef = match column.column_type {
        ColumnType::Uuid | ColumnType::Text | ColumnType::Json => {
            Arc::new(StringArray::from(values))
        },
        ColumnType::Integer => Arc::new(Int64Array::from(
            values
                .into_iter()
                .map(|v| {
                    v.map(|s| s.trim().parse::<i64>().map_err(|_| bad(s, "an integer")))
                        .transpose()
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnType::Boolean => Arc::new(BooleanArray::from(
            values
                .into_iter()
                .map(|v| {
                    v.map(|s| match s.trim() {
                        "true" | "t" | "1" => Ok(true),
                        "false" | "f" | "0" => Ok(false),
                        _ => Err(bad(s, "a boolean")),
                    })
                    .transpose()
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnType::Date => Arc::new(Date32Array::from(
            values
                .into_iter()
                .map(|v| {
                    v.map(|s| {
                        parse_iso_date(s)
                            .map(days_since_epoch)
                            .map_err(|_| bad(s, "a YYYY-MM-DD date"))
                    })
                    .transpose()
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(
                values
                    .into_iter()
                    .map(|v| {
                        v.map(|s| {
                            DateTime::parse_from_rfc3339(s.trim())
                                .map(|ts| ts.with_timezone(&Utc).timestamp_micros())
                                .map_err(|_| bad(s, "an RFC 3339 timestamp"))
                        })
                        .transpose()
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
            .with_timezone("UTC"),
        ),
    };
    Ok(array)
}

/// Assemble buffered rows of `table` into one record batch.
pub fn rows_to_batch(
    table: TableKind,
    path: &Path,
    rows: &[Vec<Option<String>>],
) -> Result<RecordBatch> {
    let columns = table.columns();
    if let Some(row) = rows.iter().find(|r| r.len() != columns.len()) {
        return Err(invalid(
            path,
            format!(
                "row has {} field(s), {} expects {}",
                row.len(),
                table,
                columns.len()
            ),
        ));
    }

    let arrays = columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let values = rows.iter().map(|r| r[i].as_deref()).collect();
            build_column(path, column, values)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RecordBatch::try_new(table_schema(table), arrays)?)
}

/// Render one column back into the textual form of the CSV files
fn column_strings(path: &Path, name: &str, array: &ArrayRef) -> Result<Vec<Option<String>>> {
    let values = match array.data_type() {
        DataType::Utf8 => array
            .as_string::<i32>()
            .iter()
            .map(|v| v.map(str::to_string))
            .collect(),
        DataType::Int64 => array
            .as_primitive::<Int64Type>()
            .iter()
            .map(|v| v.map(|n| n.to_string()))
            .collect(),
        DataType::Boolean => array
            .as_boolean()
            .iter()
            .map(|v| v.map(|b| b.to_string()))
            .collect(),
        DataType::Date32 => array
            .as_primitive::<Date32Type>()
            .iter()
            .map(|v| {
                v.map(|days| {
                    date_from_days(days)
                        .map(|d| d.format(INTERMEDIATE_DATE_FORMAT).to_string())
                        .ok_or_else(|| invalid(path, format!("column {}: day {} out of range", name, days)))
                })
                .transpose()
            })
            .collect::<Result<Vec<_>>>()?,
        DataType::Timestamp(TimeUnit::Microsecond, _) => array
            .as_primitive::<TimestampMicrosecondType>()
            .iter()
            .map(|v| {
                v.map(|micros| {
                    DateTime::<Utc>::from_timestamp_micros(micros)
                        .map(|ts| ts.to_rfc3339())
                        .ok_or_else(|| {
                            invalid(path, format!("column {}: timestamp {} out of range", name, micros))
                        })
                })
                .transpose()
            })
            .collect::<Result<Vec<_>>>()?,
        other => {
            return Err(invalid(
                path,
                format!("column {} has unsupported type {}", name, other),
            ))
        },
    };
    Ok(values)
}

/// Split a record batch back into string rows in column order.
pub fn batch_to_rows(
    table: TableKind,
    path: &Path,
    batch: &RecordBatch,
) -> Result<Vec<Vec<Option<String>>>> {
    let columns = table.columns();
    if batch.num_columns() != columns.len() {
        return Err(invalid(
            path,
            format!(
                "file has {} column(s), {} expects {}",
                batch.num_columns(),
                table,
                columns.len()
            ),
        ));
    }

    let mut rows: Vec<Vec<Option<String>>> = (0..batch.num_rows())
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for (column, array) in columns.iter().zip(batch.columns()) {
        for (row, value) in rows
            .iter_mut()
            .zip(column_strings(path, column.name, array)?)
        {
            row.push(value);
        }
    }
    Ok(rows)
}

/// Open `path` for batched reading
pub fn open_reader(path: &Path, batch_rows: usize) -> Result<ParquetRecordBatchReader> {
    let file = File::open(path)?;
    Ok(ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(batch_rows.max(1))
        .build()?)
}

struct TableFile {
    path: PathBuf,
    writer: ArrowWriter<File>,
    buffer: Vec<Vec<Option<String>>>,
}

pub struct ParquetIntermediateWriter {
    output_dir: PathBuf,
    files: BTreeMap<TableKind, TableFile>,
    stats: WriterStats,
}

impl ParquetIntermediateWriter {
    /// Create `output_dir` and one Parquet file per table.
    pub fn create(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;

        let mut files = BTreeMap::new();
        for table in TableKind::DEPENDENCY_ORDER {
            let path = Self::file_path(&output_dir, table);
            let writer =
                ArrowWriter::try_new(File::create(&path)?, table_schema(table), Some(writer_properties()))?;
            files.insert(
                table,
                TableFile {
                    path,
                    writer,
                    buffer: Vec::new(),
                },
            );
        }

        debug!("Opened Parquet intermediate files in {}", output_dir.display());

        Ok(Self {
            output_dir,
            files,
            stats: WriterStats::default(),
        })
    }

    pub fn file_path(output_dir: &Path, table: TableKind) -> PathBuf {
        intermediate_path(output_dir, table, IntermediateFormat::Parquet)
    }

    fn flush(table: TableKind, file: &mut TableFile) -> Result<()> {
        if file.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut file.buffer);
        let batch = rows_to_batch(table, &file.path, &rows)?;
        debug!("Flushing {} row(s) to {}", batch.num_rows(), file.path.display());
        file.writer.write(&batch)?;
        Ok(())
    }

    /// Rewrite one closed file without the discarded rows
    fn compact(path: &Path, table: TableKind, discarded: &RowDiscards) -> Result<u64> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        let schema = builder.schema().clone();
        let reader = builder.build()?;

        let tmp = path.with_extension("parquet.tmp");
        let mut writer = ArrowWriter::try_new(File::create(&tmp)?, schema, Some(writer_properties()))?;

        let mut offset = 0u64;
        let mut removed = 0u64;
        for batch in reader {
            let batch = batch?;
            let keep: Vec<bool> = (0..batch.num_rows() as u64)
                .map(|i| !discarded.contains(table, offset + i))
                .collect();
            offset += batch.num_rows() as u64;

            let mask = BooleanArray::from(keep);
            removed += (mask.len() - mask.true_count()) as u64;
            let kept = filter_record_batch(&batch, &mask)?;
            if kept.num_rows() > 0 {
                writer.write(&kept)?;
            }
        }
        writer.close()?;

        std::fs::rename(&tmp, path)?;
        Ok(removed)
    }
}

impl IntermediateWriter for ParquetIntermediateWriter {
    fn format(&self) -> IntermediateFormat {
        IntermediateFormat::Parquet
    }

    fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn write_fields(&mut self, table: TableKind, fields: Vec<Option<String>>) -> Result<()> {
        let file = self.files.get_mut(&table).ok_or_else(|| {
            EtlError::config(format!("no intermediate file open for {}", table))
        })?;

        file.buffer.push(fields);
        if file.buffer.len() >= ROWS_PER_BATCH {
            Self::flush(table, file)?;
        }

        *self.stats.rows.entry(table).or_insert(0) += 1;
        Ok(())
    }

    fn stats(&self) -> &WriterStats {
        &self.stats
    }

    fn finish(mut self: Box<Self>, discarded: &RowDiscards) -> Result<WriterStats> {
        let mut paths = BTreeMap::new();
        for (table, mut file) in std::mem::take(&mut self.files) {
            Self::flush(table, &mut file)?;
            file.writer.close()?;
            paths.insert(table, file.path);
        }

        for table in discarded.tables() {
            let Some(path) = paths.get(&table) else {
                continue;
            };
            let removed = Self::compact(path, table, discarded)?;
            if let Some(rows) = self.stats.rows.get_mut(&table) {
                *rows -= removed;
            }
            debug!("Removed {} superseded row(s) from {}", removed, table);
        }

        info!(
            "Parquet intermediate files closed. Total rows written: {}",
            self.stats.total()
        );
        Ok(self.stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketingStatus, Product, TableRow};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn product(id: Uuid, version: i64) -> Product {
        Product {
            document_id: id,
            set_id: Uuid::new_v4(),
            version_number: version,
            effective_time: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            product_name: Some("Fluoxetine, 20 mg".to_string()),
            manufacturer_name: None,
            dosage_form: Some("CAPSULE".to_string()),
            route_of_administration: None,
            is_latest_version: false,
            loaded_at: DateTime::parse_from_rfc3339("2024-03-01T12:30:00.123456+00:00")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    fn read_all(path: &Path, table: TableKind) -> Vec<Vec<Option<String>>> {
        let mut rows = Vec::new();
        for batch in open_reader(path, 2).unwrap() {
            rows.extend(batch_to_rows(table, path, &batch.unwrap()).unwrap());
        }
        rows
    }

    #[test]
    fn test_schema_follows_column_types() {
        let schema = table_schema(TableKind::Products);
        assert_eq!(schema.fields().len(), TableKind::Products.columns().len());
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Int64);
        assert_eq!(schema.field(3).data_type(), &DataType::Date32);
        assert_eq!(schema.field(8).data_type(), &DataType::Boolean);
        assert!(matches!(
            schema.field(9).data_type(),
            DataType::Timestamp(TimeUnit::Microsecond, Some(tz)) if tz.as_ref() == "UTC"
        ));
    }

    #[test]
    fn test_rows_read_back_in_csv_text_form() {
        let dir = TempDir::new().unwrap();
        let mut writer = ParquetIntermediateWriter::create(dir.path()).unwrap();
        let first = product(Uuid::new_v4(), 1);
        let second = product(Uuid::new_v4(), 7);
        writer.write_fields(TableKind::Products, first.fields()).unwrap();
        writer.write_fields(TableKind::Products, second.fields()).unwrap();
        writer
            .write_fields(
                TableKind::MarketingStatus,
                MarketingStatus {
                    document_id: first.document_id,
                    marketing_category: Some("NDA".to_string()),
                    start_date: NaiveDate::from_ymd_opt(1987, 12, 29),
                    end_date: None,
                }
                .fields(),
            )
            .unwrap();

        let stats = Box::new(writer).finish(&RowDiscards::default()).unwrap();
        assert_eq!(stats.get(TableKind::Products), 2);

        let path = ParquetIntermediateWriter::file_path(dir.path(), TableKind::Products);
        let rows = read_all(&path, TableKind::Products);
        assert_eq!(rows, vec![first.fields(), second.fields()]);

        let path = ParquetIntermediateWriter::file_path(dir.path(), TableKind::MarketingStatus);
        let rows = read_all(&path, TableKind::MarketingStatus);
        assert_eq!(rows[0][2].as_deref(), Some("1987-12-29"));
        assert_eq!(rows[0][3], None);

        let empty = ParquetIntermediateWriter::file_path(dir.path(), TableKind::Packaging);
        assert!(read_all(&empty, TableKind::Packaging).is_empty());
    }

    #[test]
    fn test_finish_drops_discarded_rows() {
        let dir = TempDir::new().unwrap();
        let mut writer = ParquetIntermediateWriter::create(dir.path()).unwrap();
        let products: Vec<Product> = (1..=4).map(|v| product(Uuid::new_v4(), v)).collect();
        for p in &products {
            writer.write_fields(TableKind::Products, p.fields()).unwrap();
        }

        let mut discarded = RowDiscards::default();
        discarded.add(TableKind::Products, 0..1);
        discarded.add(TableKind::Products, 2..3);
        let stats = Box::new(writer).finish(&discarded).unwrap();
        assert_eq!(stats.get(TableKind::Products), 2);

        let path = ParquetIntermediateWriter::file_path(dir.path(), TableKind::Products);
        let versions: Vec<Option<String>> = read_all(&path, TableKind::Products)
            .into_iter()
            .map(|r| r[2].clone())
            .collect();
        assert_eq!(versions, vec![Some("2".to_string()), Some("4".to_string())]);
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let path = Path::new("products.parquet");
        let mut row = product(Uuid::new_v4(), 1).fields();
        row[2] = Some("two".to_string());
        let err = rows_to_batch(TableKind::Products, path, &[row]).unwrap_err();
        assert!(err.to_string().contains("version_number"));

        let short = vec![Some("x".to_string())];
        assert!(rows_to_batch(TableKind::Products, path, &[short]).is_err());
    }
}
