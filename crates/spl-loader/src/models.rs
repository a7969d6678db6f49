//! Domain records
//!
//! Row types mirror the production tables column for column. `fields()`
//! returns values in [`TableKind::columns`] order, `None` meaning SQL NULL.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::tables::TableKind;

/// Date format used by SPL documents (`effectiveTime@value`, marketing dates)
pub const SPL_DATE_FORMAT: &str = "%Y%m%d";

/// Trim a string and map empty or whitespace-only input to `None`
pub fn clean_string(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse an SPL `YYYYMMDD` date. Longer HL7 timestamps
/// (`YYYYMMDDhhmmss`) are truncated to the date part.
pub fn parse_spl_date(value: &str) -> Result<NaiveDate, chrono::ParseError> {
    let trimmed = value.trim();
    let date_part = trimmed.get(..8).unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, SPL_DATE_FORMAT)
}

/// Dates as written to intermediate files
pub const INTERMEDIATE_DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_iso_date(value: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(value.trim(), INTERMEDIATE_DATE_FORMAT)
}

/// A downloadable archive advertised by the listing page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub name: String,
    pub url: String,
    pub checksum: String,
}

/// Pipeline mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Full,
    Delta,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Full => "full",
            LoadMode::Delta => "delta",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" | "full-load" => Ok(LoadMode::Full),
            "delta" | "delta-load" => Ok(LoadMode::Delta),
            other => Err(format!("unknown load mode '{}'", other)),
        }
    }
}

/// ETL run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "SUCCESS" => RunStatus::Success,
            "FAILED" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state handed to the run history tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub records_loaded: u64,
    pub error_log: Option<String>,
}

impl RunOutcome {
    pub fn success(records_loaded: u64) -> Self {
        Self {
            status: RunStatus::Success,
            records_loaded,
            error_log: None,
        }
    }

    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            status: RunStatus::Failed,
            records_loaded: 0,
            error_log: Some(error.to_string()),
        }
    }
}

/// One row of `etl_load_history`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: i64,
    pub mode: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_loaded: i64,
    pub error_log: Option<String>,
}

fn opt_date(d: Option<NaiveDate>) -> Option<String> {
    d.map(|d| d.format(INTERMEDIATE_DATE_FORMAT).to_string())
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Rows written to an intermediate file of one kind
pub trait TableRow {
    const KIND: TableKind;

    fn fields(&self) -> Vec<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub document_id: Uuid,
    pub set_id: Uuid,
    pub version_number: i64,
    pub effective_time: NaiveDate,
    pub product_name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub dosage_form: Option<String>,
    pub route_of_administration: Option<String>,
    pub is_latest_version: bool,
    pub loaded_at: DateTime<Utc>,
}

impl TableRow for Product {
    const KIND: TableKind = TableKind::Products;

    fn fields(&self) -> Vec<Option<String>> {
        vec![
            Some(self.document_id.to_string()),
            Some(self.set_id.to_string()),
            Some(self.version_number.to_string()),
            opt_date(Some(self.effective_time)),
            self.product_name.clone(),
            self.manufacturer_name.clone(),
            self.dosage_form.clone(),
            self.route_of_administration.clone(),
            Some(self.is_latest_version.to_string()),
            Some(timestamp(&self.loaded_at)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    pub document_id: Uuid,
    pub set_id: Uuid,
    pub version_number: i64,
    pub effective_time: NaiveDate,
    /// Structural JSON re-encoding of the source XML
    pub raw_data: Option<String>,
    pub source_filename: String,
    pub loaded_at: DateTime<Utc>,
}

impl TableRow for RawDocument {
    const KIND: TableKind = TableKind::RawDocuments;

    fn fields(&self) -> Vec<Option<String>> {
        vec![
            Some(self.document_id.to_string()),
            Some(self.set_id.to_string()),
            Some(self.version_number.to_string()),
            opt_date(Some(self.effective_time)),
            self.raw_data.clone(),
            Some(self.source_filename.clone()),
            Some(timestamp(&self.loaded_at)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductNdc {
    pub document_id: Uuid,
    pub ndc_code: String,
}

impl TableRow for ProductNdc {
    const KIND: TableKind = TableKind::ProductNdcs;

    fn fields(&self) -> Vec<Option<String>> {
        vec![Some(self.document_id.to_string()), Some(self.ndc_code.clone())]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingredient {
    pub document_id: Uuid,
    pub ingredient_name: Option<String>,
    pub substance_code: Option<String>,
    pub strength_numerator: Option<String>,
    pub strength_denominator: Option<String>,
    pub unit_of_measure: Option<String>,
    pub is_active_ingredient: bool,
}

impl TableRow for Ingredient {
    const KIND: TableKind = TableKind::Ingredients;

    fn fields(&self) -> Vec<Option<String>> {
        vec![
            Some(self.document_id.to_string()),
            self.ingredient_name.clone(),
            self.substance_code.clone(),
            self.strength_numerator.clone(),
            self.strength_denominator.clone(),
            self.unit_of_measure.clone(),
            Some(self.is_active_ingredient.to_string()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packaging {
    pub document_id: Uuid,
    pub package_ndc: Option<String>,
    pub package_description: Option<String>,
    pub package_type: Option<String>,
}

impl TableRow for Packaging {
    const KIND: TableKind = TableKind::Packaging;

    fn fields(&self) -> Vec<Option<String>> {
        vec![
            Some(self.document_id.to_string()),
            self.package_ndc.clone(),
            self.package_description.clone(),
            self.package_type.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketingStatus {
    pub document_id: Uuid,
    pub marketing_category: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl TableRow for MarketingStatus {
    const KIND: TableKind = TableKind::MarketingStatus;

    fn fields(&self) -> Vec<Option<String>> {
        vec![
            Some(self.document_id.to_string()),
            self.marketing_category.clone(),
            opt_date(self.start_date),
            opt_date(self.end_date),
        ]
    }
}
