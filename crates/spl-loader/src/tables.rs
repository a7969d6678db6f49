//! Production and staging table catalog
//!
//! One entry per entity kind. The transform stage names its intermediate files
//! after [`TableKind::file_stem`], the staging loader maps those files back to
//! `<table>_staging`, and the merge engine walks [`TableKind::DEPENDENCY_ORDER`].

use std::fmt;

/// Value type of an intermediate column, used by backends without a
/// server-side CSV parser to bind typed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Uuid,
    Text,
    Integer,
    Boolean,
    Date,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub column_type: ColumnType,
}

const fn col(name: &'static str, column_type: ColumnType) -> Column {
    Column { name, column_type }
}

const RAW_DOCUMENT_COLUMNS: &[Column] = &[
    col("document_id", ColumnType::Uuid),
    col("set_id", ColumnType::Uuid),
    col("version_number", ColumnType::Integer),
    col("effective_time", ColumnType::Date),
    col("raw_data", ColumnType::Json),
    col("source_filename", ColumnType::Text),
    col("loaded_at", ColumnType::Timestamp),
];

const PRODUCT_COLUMNS: &[Column] = &[
    col("document_id", ColumnType::Uuid),
    col("set_id", ColumnType::Uuid),
    col("version_number", ColumnType::Integer),
    col("effective_time", ColumnType::Date),
    col("product_name", ColumnType::Text),
    col("manufacturer_name", ColumnType::Text),
    col("dosage_form", ColumnType::Text),
    col("route_of_administration", ColumnType::Text),
    col("is_latest_version", ColumnType::Boolean),
    col("loaded_at", ColumnType::Timestamp),
];

const PRODUCT_NDC_COLUMNS: &[Column] = &[
    col("document_id", ColumnType::Uuid),
    col("ndc_code", ColumnType::Text),
];

const INGREDIENT_COLUMNS: &[Column] = &[
    col("document_id", ColumnType::Uuid),
    col("ingredient_name", ColumnType::Text),
    col("substance_code", ColumnType::Text),
    col("strength_numerator", ColumnType::Text),
    col("strength_denominator", ColumnType::Text),
    col("unit_of_measure", ColumnType::Text),
    col("is_active_ingredient", ColumnType::Boolean),
];

const PACKAGING_COLUMNS: &[Column] = &[
    col("document_id", ColumnType::Uuid),
    col("package_ndc", ColumnType::Text),
    col("package_description", ColumnType::Text),
    col("package_type", ColumnType::Text),
];

const MARKETING_STATUS_COLUMNS: &[Column] = &[
    col("document_id", ColumnType::Uuid),
    col("marketing_category", ColumnType::Text),
    col("start_date", ColumnType::Date),
    col("end_date", ColumnType::Date),
];

/// Every production table the loader writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    RawDocuments,
    Products,
    ProductNdcs,
    Ingredients,
    Packaging,
    MarketingStatus,
}

impl TableKind {
    /// Parents before children; reversed for deletes and truncates.
    pub const DEPENDENCY_ORDER: [TableKind; 6] = [
        TableKind::RawDocuments,
        TableKind::Products,
        TableKind::ProductNdcs,
        TableKind::Ingredients,
        TableKind::Packaging,
        TableKind::MarketingStatus,
    ];

    /// Tables keyed by `document_id` and upserted on delta loads.
    pub const PARENTS: [TableKind; 2] = [TableKind::RawDocuments, TableKind::Products];

    /// Tables whose rows are replaced wholesale per parent on delta loads.
    pub const CHILDREN: [TableKind; 4] = [
        TableKind::ProductNdcs,
        TableKind::Ingredients,
        TableKind::Packaging,
        TableKind::MarketingStatus,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            TableKind::RawDocuments => "raw_documents",
            TableKind::Products => "products",
            TableKind::ProductNdcs => "product_ndcs",
            TableKind::Ingredients => "ingredients",
            TableKind::Packaging => "packaging",
            TableKind::MarketingStatus => "marketing_status",
        }
    }

    pub fn staging_table_name(&self) -> String {
        format!("{}_staging", self.table_name())
    }

    /// Intermediate file name without extension
    pub fn file_stem(&self) -> &'static str {
        self.table_name()
    }

    pub fn from_file_stem(stem: &str) -> Option<Self> {
        match stem {
            "raw_documents" | "spl_raw_documents" => Some(TableKind::RawDocuments),
            "products" => Some(TableKind::Products),
            "product_ndcs" => Some(TableKind::ProductNdcs),
            "ingredients" => Some(TableKind::Ingredients),
            "packaging" => Some(TableKind::Packaging),
            "marketing_status" => Some(TableKind::MarketingStatus),
            _ => None,
        }
    }

    pub fn is_parent(&self) -> bool {
        matches!(self, TableKind::RawDocuments | TableKind::Products)
    }

    pub fn columns(&self) -> &'static [Column] {
        match self {
            TableKind::RawDocuments => RAW_DOCUMENT_COLUMNS,
            TableKind::Products => PRODUCT_COLUMNS,
            TableKind::ProductNdcs => PRODUCT_NDC_COLUMNS,
            TableKind::Ingredients => INGREDIENT_COLUMNS,
            TableKind::Packaging => PACKAGING_COLUMNS,
            TableKind::MarketingStatus => MARKETING_STATUS_COLUMNS,
        }
    }

    /// Comma-separated column list in intermediate-file order
    pub fn column_list(&self) -> String {
        self.columns()
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Columns overwritten when an upsert hits an existing `document_id`
    pub fn update_columns(&self) -> impl Iterator<Item = &'static str> {
        self.columns()
            .iter()
            .map(|c| c.name)
            .filter(|name| *name != "document_id")
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}
