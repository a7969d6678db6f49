//! Validation and intermediate-file generation
//!
//! Each extracted document is validated into typed rows for every table. A
//! document that fails validation is logged and skipped as a whole; one that
//! passes has all of its rows written.
//!
//! A `document_id` may show up more than once in a batch (the same label in
//! two archives). Only the copy from the latest file in archive order is
//! kept; rows of the earlier copy are discarded when the writer closes.

pub mod columnar;
pub mod reader;
pub mod writer;

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    clean_string, parse_spl_date, Ingredient, MarketingStatus, Packaging, Product, ProductNdc,
    RawDocument, TableRow,
};
use crate::parsing::{ExtractedDocument, ParseSummary, ParsedStream};
use crate::tables::TableKind;

pub use columnar::ParquetIntermediateWriter;
pub use reader::{encode_csv, file_format, stream_batches, FieldRow, IntermediateReader};
pub use writer::{
    create_writer, intermediate_path, CsvIntermediateWriter, IntermediateWriter, RowDiscards,
    WriterStats, NULL_MARKER,
};

const PROGRESS_INTERVAL: u64 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field {0}")]
    Missing(&'static str),

    #[error("{field} is not a valid UUID: '{value}'")]
    InvalidUuid { field: &'static str, value: String },

    #[error("{field} is not a YYYYMMDD date: '{value}'")]
    InvalidDate { field: &'static str, value: String },
}

/// Typed rows derived from one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRows {
    pub raw_document: RawDocument,
    pub product: Product,
    pub product_ndcs: Vec<ProductNdc>,
    pub ingredients: Vec<Ingredient>,
    pub packaging: Vec<Packaging>,
    pub marketing_status: Vec<MarketingStatus>,
}

impl DocumentRows {
    pub fn row_count(&self) -> usize {
        2 + self.product_ndcs.len()
            + self.ingredients.len()
            + self.packaging.len()
            + self.marketing_status.len()
    }
}

fn required_uuid(field: &'static str, value: Option<&str>) -> std::result::Result<Uuid, ValidationError> {
    let value = value.map(str::trim).filter(|v| !v.is_empty());
    let value = value.ok_or(ValidationError::Missing(field))?;
    Uuid::parse_str(value).map_err(|_| ValidationError::InvalidUuid {
        field,
        value: value.to_string(),
    })
}

fn required_date(field: &'static str, value: Option<&str>) -> std::result::Result<NaiveDate, ValidationError> {
    let value = value.ok_or(ValidationError::Missing(field))?;
    parse_spl_date(value).map_err(|_| ValidationError::InvalidDate {
        field,
        value: value.to_string(),
    })
}

/// Blank dates are absent; anything else must parse.
fn optional_date(field: &'static str, value: Option<&str>) -> std::result::Result<Option<NaiveDate>, ValidationError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => parse_spl_date(v)
            .map(Some)
            .map_err(|_| ValidationError::InvalidDate {
                field,
                value: v.to_string(),
            }),
    }
}

/// Validate one document into rows for every table.
///
/// New products start with `is_latest_version = false`; the merge engine
/// computes the flag.
pub fn validate_document(
    doc: &ExtractedDocument,
    loaded_at: DateTime<Utc>,
) -> std::result::Result<DocumentRows, ValidationError> {
    let document_id = required_uuid("document_id", doc.document_id.as_deref())?;
    let set_id = required_uuid("set_id", doc.set_id.as_deref())?;
    let effective_time = required_date("effective_time", doc.effective_time.as_deref())?;

    let source_filename = clean_string(Some(&doc.source_filename))
        .ok_or(ValidationError::Missing("source_filename"))?;

    let raw_document = RawDocument {
        document_id,
        set_id,
        version_number: doc.version_number,
        effective_time,
        raw_data: doc.raw_data.clone(),
        source_filename,
        loaded_at,
    };

    let product = Product {
        document_id,
        set_id,
        version_number: doc.version_number,
        effective_time,
        product_name: clean_string(doc.product_name.as_deref()),
        manufacturer_name: clean_string(doc.manufacturer_name.as_deref()),
        dosage_form: clean_string(doc.dosage_form.as_deref()),
        route_of_administration: clean_string(doc.route_of_administration.as_deref()),
        is_latest_version: false,
        loaded_at,
    };

    let product_ndcs = doc
        .product_ndcs
        .iter()
        .map(|code| {
            clean_string(Some(code))
                .map(|ndc_code| ProductNdc {
                    document_id,
                    ndc_code,
                })
                .ok_or(ValidationError::Missing("ndc_code"))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let ingredients = doc
        .ingredients
        .iter()
        .map(|i| Ingredient {
            document_id,
            ingredient_name: clean_string(i.ingredient_name.as_deref()),
            substance_code: clean_string(i.substance_code.as_deref()),
            strength_numerator: clean_string(i.strength_numerator.as_deref()),
            strength_denominator: clean_string(i.strength_denominator.as_deref()),
            unit_of_measure: clean_string(i.unit_of_measure.as_deref()),
            is_active_ingredient: i.is_active_ingredient,
        })
        .collect();

    let packaging = doc
        .packaging
        .iter()
        .map(|p| Packaging {
            document_id,
            package_ndc: clean_string(p.package_ndc.as_deref()),
            package_description: clean_string(p.package_description.as_deref()),
            package_type: clean_string(p.package_type.as_deref()),
        })
        .collect();

    let marketing_status = doc
        .marketing_status
        .iter()
        .map(|m| {
            Ok(MarketingStatus {
                document_id,
                marketing_category: clean_string(m.marketing_category.as_deref()),
                start_date: optional_date("start_date", m.start_date.as_deref())?,
                end_date: optional_date("end_date", m.end_date.as_deref())?,
            })
        })
        .collect::<std::result::Result<Vec<_>, ValidationError>>()?;

    Ok(DocumentRows {
        raw_document,
        product,
        product_ndcs,
        ingredients,
        packaging,
        marketing_status,
    })
}

/// What one transform pass produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformSummary {
    /// Documents whose rows were written
    pub documents: u64,
    /// Documents dropped for a missing id or failed validation
    pub skipped: u64,
    /// Copies of a `document_id` superseded by a later file in the batch
    pub duplicates: u64,
    pub rows: WriterStats,
    pub parse: ParseSummary,
}

impl TransformSummary {
    /// Rows expected in staging once the files are loaded
    pub fn total_rows(&self) -> u64 {
        self.rows.total()
    }
}

pub struct Transformer {
    loaded_at: DateTime<Utc>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer {
    pub fn new() -> Self {
        Self {
            loaded_at: Utc::now(),
        }
    }

    /// Use a fixed load timestamp for every row
    pub fn with_loaded_at(loaded_at: DateTime<Utc>) -> Self {
        Self { loaded_at }
    }

    /// Validate `doc`, logging why it was dropped when it fails.
    fn validated(&self, doc: &ExtractedDocument) -> Option<DocumentRows> {
        if doc
            .document_id
            .as_deref()
            .map_or(true, |id| id.trim().is_empty())
        {
            warn!(
                "Skipping record from {} due to missing document_id",
                doc.source_filename
            );
            return None;
        }

        match validate_document(doc, self.loaded_at) {
            Ok(rows) => Some(rows),
            Err(e) => {
                error!(
                    "Failed to transform record with doc_id {:?} from {}: {}",
                    doc.document_id, doc.source_filename, e
                );
                None
            },
        }
    }

    /// Write every row of one document, returning the row span it took in
    /// each table file.
    fn write_rows(
        rows: &DocumentRows,
        writer: &mut dyn IntermediateWriter,
    ) -> Result<Vec<(TableKind, Range<u64>)>> {
        let before = writer.stats().clone();

        write_row(writer, &rows.product)?;
        write_row(writer, &rows.raw_document)?;
        for row in &rows.ingredients {
            write_row(writer, row)?;
        }
        for row in &rows.packaging {
            write_row(writer, row)?;
        }
        for row in &rows.marketing_status {
            write_row(writer, row)?;
        }
        for row in &rows.product_ndcs {
            write_row(writer, row)?;
        }

        let after = writer.stats();
        Ok(TableKind::DEPENDENCY_ORDER
            .into_iter()
            .map(|table| (table, before.get(table)..after.get(table)))
            .filter(|(_, span)| !span.is_empty())
            .collect())
    }

    /// Validate and write one document. Returns whether it was written.
    pub fn write_document(
        &self,
        doc: &ExtractedDocument,
        writer: &mut dyn IntermediateWriter,
    ) -> Result<bool> {
        match self.validated(doc) {
            Some(rows) => {
                Self::write_rows(&rows, writer)?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Drain `stream` into `writer`.
    ///
    /// Consumes the writer; the returned summary carries its final stats.
    pub async fn transform_stream(
        &self,
        mut stream: ParsedStream,
        mut writer: Box<dyn IntermediateWriter>,
    ) -> Result<TransformSummary> {
        info!("Starting data transformation");

        let mut summary = TransformSummary::default();
        let mut written: HashMap<Uuid, WrittenDocument> = HashMap::new();
        let mut discards = RowDiscards::default();
        let mut seen = 0u64;

        while let Some(doc) = stream.next().await {
            seen += 1;
            if seen % PROGRESS_INTERVAL == 0 {
                info!("Processed {} source documents...", seen);
            }

            let Some(rows) = self.validated(&doc) else {
                summary.skipped += 1;
                continue;
            };
            let document_id = rows.raw_document.document_id;

            if let Some(kept) = written.get(&document_id) {
                summary.duplicates += 1;
                if kept.source_index > doc.source_index {
                    warn!(
                        "Document {} in {} is superseded by the copy in {}",
                        document_id, doc.source_filename, kept.source_filename
                    );
                    continue;
                }
                warn!(
                    "Document {} in {} supersedes the copy in {}",
                    document_id, doc.source_filename, kept.source_filename
                );
                for (table, span) in &kept.spans {
                    discards.add(*table, span.clone());
                }
            } else {
                summary.documents += 1;
            }

            let spans = Self::write_rows(&rows, writer.as_mut())?;
            written.insert(
                document_id,
                WrittenDocument {
                    source_index: doc.source_index,
                    source_filename: doc.source_filename,
                    spans,
                },
            );
        }

        summary.parse = stream.finish().await?;
        summary.rows = writer.finish(&discards)?;

        info!(
            "Transformation complete: {} document(s) written, {} skipped, {} duplicate(s), {} row(s)",
            summary.documents,
            summary.skipped,
            summary.duplicates,
            summary.total_rows()
        );

        Ok(summary)
    }
}

/// The copy of a document currently in the intermediate files
struct WrittenDocument {
    source_index: usize,
    source_filename: String,
    spans: Vec<(TableKind, Range<u64>)>,
}

fn write_row<R: TableRow>(writer: &mut dyn IntermediateWriter, row: &R) -> Result<()> {
    writer.write_fields(R::KIND, row.fields())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntermediateFormat;
    use crate::parsing::{
        parse_with_quarantine, ExtractError, ExtractedIngredient, ExtractedMarketingStatus,
        RecordExtractor,
    };
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample() -> ExtractedDocument {
        ExtractedDocument {
            document_id: Some("d1b64b62-a4c6-4a6a-8b8d-6d2a1d6e9f01".to_string()),
            set_id: Some("a0c2f3de-1111-4c4c-9d9d-0123456789ab".to_string()),
            version_number: 2,
            effective_time: Some("20240115".to_string()),
            product_name: Some("  Fluoxetine ".to_string()),
            manufacturer_name: Some("".to_string()),
            raw_data: Some("{}".to_string()),
            source_filename: "label.xml".to_string(),
            product_ndcs: vec!["0777-3105-02".to_string()],
            ingredients: vec![ExtractedIngredient {
                ingredient_name: Some("FLUOXETINE".to_string()),
                is_active_ingredient: true,
                ..Default::default()
            }],
            marketing_status: vec![ExtractedMarketingStatus {
                marketing_category: Some("active".to_string()),
                start_date: Some("19871229".to_string()),
                end_date: Some(" ".to_string()),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_document_types_and_cleans() {
        let rows = validate_document(&sample(), Utc::now()).unwrap();

        assert_eq!(rows.product.product_name.as_deref(), Some("Fluoxetine"));
        assert_eq!(rows.product.manufacturer_name, None);
        assert!(!rows.product.is_latest_version);
        assert_eq!(
            rows.product.effective_time,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
        assert_eq!(
            rows.marketing_status[0].start_date,
            NaiveDate::from_ymd_opt(1987, 12, 29)
        );
        assert_eq!(rows.marketing_status[0].end_date, None);
        assert_eq!(rows.row_count(), 5);
    }

    #[test]
    fn test_validation_failures() {
        let mut doc = sample();
        doc.set_id = Some("not-a-uuid".to_string());
        assert!(matches!(
            validate_document(&doc, Utc::now()),
            Err(ValidationError::InvalidUuid { field: "set_id", .. })
        ));

        let mut doc = sample();
        doc.effective_time = None;
        assert_eq!(
            validate_document(&doc, Utc::now()),
            Err(ValidationError::Missing("effective_time"))
        );

        let mut doc = sample();
        doc.marketing_status[0].end_date = Some("sometime".to_string());
        assert!(matches!(
            validate_document(&doc, Utc::now()),
            Err(ValidationError::InvalidDate { field: "end_date", .. })
        ));
    }

    #[test]
    fn test_invalid_document_writes_no_rows() {
        let dir = TempDir::new().unwrap();
        let mut writer = create_writer(IntermediateFormat::Csv, dir.path()).unwrap();
        let transformer = Transformer::new();

        let mut bad = sample();
        bad.marketing_status[0].start_date = Some("99999999".to_string());
        assert!(!transformer.write_document(&bad, writer.as_mut()).unwrap());

        let mut missing = sample();
        missing.document_id = None;
        assert!(!transformer.write_document(&missing, writer.as_mut()).unwrap());

        assert!(transformer.write_document(&sample(), writer.as_mut()).unwrap());

        let stats = writer.finish(&RowDiscards::default()).unwrap();
        assert_eq!(stats.get(TableKind::Products), 1);
        assert_eq!(stats.get(TableKind::RawDocuments), 1);
        assert_eq!(stats.get(TableKind::MarketingStatus), 1);
        assert_eq!(stats.total(), 5);
    }

    /// Serves `sample()` for every file, tagging it with the file name and
    /// one ingredient per digit in the name.
    struct RepeatedDocument;

    impl RecordExtractor for RepeatedDocument {
        fn extract(&self, path: &Path) -> std::result::Result<ExtractedDocument, ExtractError> {
            let name = path.file_stem().unwrap().to_string_lossy().into_owned();
            let copies: usize = name.trim_start_matches("copy").parse().unwrap();
            let mut doc = sample();
            doc.source_filename = format!("{}.xml", name);
            doc.product_name = Some(name);
            doc.ingredients = vec![doc.ingredients[0].clone(); copies];
            Ok(doc)
        }
    }

    async fn transform_copies(format: IntermediateFormat, workers: usize) -> (TempDir, TransformSummary) {
        let dir = TempDir::new().unwrap();
        let files: Vec<PathBuf> = ["copy3", "copy1", "copy2"]
            .iter()
            .map(|name| dir.path().join(format!("{}.xml", name)))
            .collect();
        let stream = parse_with_quarantine(
            Arc::new(RepeatedDocument),
            files,
            dir.path().join("quarantine"),
            workers,
        );
        let writer = create_writer(format, dir.path().join("out")).unwrap();
        let summary = Transformer::new()
            .transform_stream(stream, writer)
            .await
            .unwrap();
        (dir, summary)
    }

    #[tokio::test]
    async fn test_repeated_document_keeps_last_copy() {
        for format in [IntermediateFormat::Csv, IntermediateFormat::Parquet] {
            for workers in [1, 3] {
                let (dir, summary) = transform_copies(format, workers).await;

                assert_eq!(summary.documents, 1);
                assert_eq!(summary.duplicates, 2);
                assert_eq!(summary.rows.get(TableKind::Products), 1);
                assert_eq!(summary.rows.get(TableKind::RawDocuments), 1);
                assert_eq!(summary.rows.get(TableKind::Ingredients), 2);
                assert_eq!(summary.total_rows(), 6);

                let path = intermediate_path(&dir.path().join("out"), TableKind::Products, format);
                let mut reader = IntermediateReader::open(TableKind::Products, &path, 10).unwrap();
                let products = reader.next_batch().unwrap();
                assert_eq!(products.len(), 1);
                assert!(
                    products[0].contains(&Some("copy2".to_string())),
                    "{} with {} worker(s) kept {:?}",
                    format,
                    workers,
                    products[0]
                );

                let path = intermediate_path(&dir.path().join("out"), TableKind::Ingredients, format);
                let mut reader = IntermediateReader::open(TableKind::Ingredients, &path, 10).unwrap();
                assert_eq!(reader.next_batch().unwrap().len(), 2);
            }
        }
    }
}
