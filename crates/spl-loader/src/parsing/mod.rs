//! Document extraction
//!
//! [`RecordExtractor`] turns one SPL file into an [`ExtractedDocument`];
//! [`quarantine::parse_with_quarantine`] fans extraction out over a bounded
//! worker pool and moves files that fail into the quarantine directory.

pub mod quarantine;
pub mod spl;
pub mod xml;

use std::path::{Path, PathBuf};
use thiserror::Error;

pub use quarantine::{parse_with_quarantine, ParseSummary, ParsedStream};
pub use spl::SplXmlExtractor;

/// Ingredient as found in the document, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedIngredient {
    pub ingredient_name: Option<String>,
    pub substance_code: Option<String>,
    pub strength_numerator: Option<String>,
    pub strength_denominator: Option<String>,
    pub unit_of_measure: Option<String>,
    pub is_active_ingredient: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedPackage {
    pub package_ndc: Option<String>,
    pub package_description: Option<String>,
    pub package_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedMarketingStatus {
    pub marketing_category: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Everything pulled out of one SPL file.
///
/// Values are kept as found; the transform stage validates and types them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub document_id: Option<String>,
    pub set_id: Option<String>,
    pub version_number: i64,
    pub effective_time: Option<String>,
    pub product_name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub dosage_form: Option<String>,
    pub route_of_administration: Option<String>,
    /// JSON re-encoding of the whole document
    pub raw_data: Option<String>,
    pub source_filename: String,
    /// Position of the source file in its batch, archive order
    pub source_index: usize,
    pub product_ndcs: Vec<String>,
    pub ingredients: Vec<ExtractedIngredient>,
    pub packaging: Vec<ExtractedPackage>,
    pub marketing_status: Vec<ExtractedMarketingStatus>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("XML syntax error in {path}: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: xml::XmlError,
    },

    #[error("no root <document> element in {path} (found <{found}>)")]
    MissingRoot { path: PathBuf, found: String },

    #[error("invalid {field} '{value}' in {path}")]
    InvalidValue {
        path: PathBuf,
        field: &'static str,
        value: String,
    },
}

/// Extracts one record per input file.
///
/// Implementations run on blocking worker threads, so they must be cheap to
/// share and must not hold async resources.
pub trait RecordExtractor: Send + Sync + 'static {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractError>;
}
