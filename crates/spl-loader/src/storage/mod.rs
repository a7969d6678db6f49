//! Storage backends
//!
//! [`LoaderBackend`] is the one capability interface the pipeline talks to;
//! each database gets one implementation. The merge state machine
//! ([`merge::MergeEngine`]), the optimization lifecycle
//! ([`optimize::OptimizationManager`]) and the staging loader
//! ([`staging::bulk_load_to_staging`]) are written once against it.

pub mod merge;
pub mod optimize;
pub mod postgres;
pub mod sql;
pub mod sqlite;
pub mod staging;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{EtlError, Result};
use crate::models::{LoadMode, RunOutcome, RunRecord};
use crate::tables::TableKind;

pub use merge::{MergeEngine, MergeReport, MergeState};
pub use optimize::OptimizationManager;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;
pub use staging::bulk_load_to_staging;

pub const LOAD_HISTORY_TABLE: &str = "etl_load_history";
pub const PROCESSED_ARCHIVES_TABLE: &str = "etl_processed_archives";
pub const DEFERRED_OBJECTS_TABLE: &str = "etl_deferred_schema_objects";

/// Every table that must exist before a pipeline may move data
pub fn required_tables() -> Vec<String> {
    let mut tables = vec![
        LOAD_HISTORY_TABLE.to_string(),
        PROCESSED_ARCHIVES_TABLE.to_string(),
        DEFERRED_OBJECTS_TABLE.to_string(),
    ];
    for table in TableKind::DEPENDENCY_ORDER {
        tables.push(table.table_name().to_string());
        tables.push(table.staging_table_name());
    }
    tables
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaObjectKind {
    ForeignKey,
    Index,
}

impl SchemaObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaObjectKind::ForeignKey => "foreign_key",
            SchemaObjectKind::Index => "index",
        }
    }
}

impl fmt::Display for SchemaObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaObjectKind {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "foreign_key" => Ok(SchemaObjectKind::ForeignKey),
            "index" => Ok(SchemaObjectKind::Index),
            other => Err(EtlError::config(format!("unknown schema object kind '{}'", other))),
        }
    }
}

/// A secondary index or foreign key captured from the catalog, with the
/// statements that drop and recreate it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaObject {
    pub kind: SchemaObjectKind,
    pub name: String,
    pub table_name: String,
    pub create_sql: String,
    pub drop_sql: String,
}

/// Capability interface implemented once per database.
///
/// Every method acquires its own connection (or transaction) from the pool
/// and releases it before returning.
#[async_trait]
pub trait LoaderBackend: Send + Sync {
    /// Adapter name for logs (`postgresql`, `sqlite`)
    fn name(&self) -> &'static str;

    /// Create every table (idempotent)
    async fn initialize_schema(&self) -> Result<()>;

    /// Fail with [`EtlError::SchemaNotInitialized`] unless every required
    /// table exists
    async fn verify_schema(&self) -> Result<()>;

    // ------------------------------------------------------------------
    // Run history
    // ------------------------------------------------------------------

    async fn start_run(&self, mode: LoadMode) -> Result<i64>;

    /// Close a `RUNNING` record. Closing an already closed run is a no-op.
    async fn end_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<()>;

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>>;

    // ------------------------------------------------------------------
    // Processed-archive ledger
    // ------------------------------------------------------------------

    async fn processed_archives(&self) -> Result<BTreeSet<String>>;

    /// Upsert; recording the same archive twice keeps one row
    async fn record_processed_archive(&self, archive_name: &str, checksum: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    /// Empty every staging table
    async fn clear_staging(&self) -> Result<()>;

    /// Load one intermediate file into `<table>_staging`, returning the rows
    /// persisted
    async fn load_staging_file(&self, table: TableKind, path: &Path) -> Result<u64>;

    // ------------------------------------------------------------------
    // Index / foreign-key optimization
    // ------------------------------------------------------------------

    /// Secondary indexes and foreign keys on production tables, foreign keys
    /// first. Primary keys are never included.
    async fn snapshot_schema_objects(&self) -> Result<Vec<SchemaObject>>;

    /// Drop `objects` and record them in the deferred ledger, atomically
    async fn drop_schema_objects(&self, objects: &[SchemaObject]) -> Result<()>;

    /// Recreate `objects` in order and clear the deferred ledger, atomically
    async fn restore_schema_objects(&self, objects: &[SchemaObject]) -> Result<()>;

    /// Objects dropped by an earlier run and never restored
    async fn pending_schema_objects(&self) -> Result<Vec<SchemaObject>>;

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    async fn begin_merge(&self) -> Result<Box<dyn MergeTransaction>>;

    /// Post-load housekeeping (statistics, space reclamation)
    async fn maintenance(&self) -> Result<()>;

    async fn close(&self);
}

/// Primitive merge steps, all inside one database transaction.
///
/// Dropping the value without calling [`MergeTransaction::commit`] rolls the
/// transaction back.
#[async_trait]
pub trait MergeTransaction: Send {
    /// Remove every row from `tables`, given children before parents
    async fn truncate_production(&mut self, tables: &[TableKind]) -> Result<()>;

    /// `INSERT INTO <table> SELECT ... FROM <table>_staging`
    async fn copy_from_staging(&mut self, table: TableKind) -> Result<u64>;

    /// Insert staged rows, overwriting rows with the same `document_id`
    async fn upsert_from_staging(&mut self, table: TableKind) -> Result<u64>;

    /// Delete child rows whose parent document is in `products_staging`
    async fn delete_children_of_staged(&mut self, table: TableKind) -> Result<u64>;

    /// Recompute `is_latest_version` for every family with a staged member
    async fn recompute_latest_versions(&mut self) -> Result<u64>;

    async fn truncate_staging(&mut self, tables: &[TableKind]) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Open the backend selected by `config`.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn LoaderBackend>> {
    info!("Initializing database adapter: {}", config.adapter_name());

    let backend: Arc<dyn LoaderBackend> = match config {
        DatabaseConfig::Postgres(pg) => Arc::new(PostgresBackend::connect(pg).await?),
        DatabaseConfig::Sqlite(sqlite) => Arc::new(SqliteBackend::connect(sqlite).await?),
    };
    Ok(backend)
}
