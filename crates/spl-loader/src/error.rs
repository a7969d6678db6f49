//! Loader error taxonomy

use crate::acquisition::ArchiveFailure;
use crate::models::Archive;
use thiserror::Error;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Errors raised anywhere in the load pipeline.
///
/// Per-document and per-archive failures are absorbed where they happen;
/// everything that reaches the pipeline driver fails the run.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Transient transport failure, retried with backoff
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Checksum mismatch for {archive}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        archive: String,
        expected: String,
        actual: String,
    },

    #[error(
        "Data integrity check failed: transformed records ({transformed}) does not match loaded records ({loaded})"
    )]
    IntegrityMismatch { transformed: u64, loaded: u64 },

    #[error("Parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Schema not initialized: {0}. Run `spl-loader init` first.")]
    SchemaNotInitialized(String),

    #[error(
        "Schema is degraded: {0} dropped index/constraint definition(s) were never restored. Run `spl-loader restore-schema`."
    )]
    SchemaDegraded(usize),

    #[error("Merge failed during {step}: {source}")]
    Merge {
        step: String,
        #[source]
        source: Box<EtlError>,
    },

    #[error("Completed with {} download error(s): {}", .failures.len(), describe_failures(.failures))]
    PartialBatch {
        failures: Vec<ArchiveFailure>,
        downloaded: Vec<Archive>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Intermediate file error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parquet intermediate file error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Columnar batch error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Archive extraction error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] spl_common::SplError),

    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EtlError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn merge(step: impl Into<String>, source: EtlError) -> Self {
        Self::Merge {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Transient failures that the backoff loop may retry.
    ///
    /// Client errors (4xx) are permanent, server errors and transport failures
    /// are not. Integrity failures are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EtlError::Network(e) => !e.status().is_some_and(|s| s.is_client_error()),
            EtlError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            EtlError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Data-integrity failures abort the affected unit and are never retried.
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            EtlError::ChecksumMismatch { .. } | EtlError::IntegrityMismatch { .. } => true,
            EtlError::Common(e) => e.is_integrity_error(),
            _ => false,
        }
    }
}

fn describe_failures(failures: &[ArchiveFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.archive, f.cause))
        .collect::<Vec<_>>()
        .join("; ")
}
