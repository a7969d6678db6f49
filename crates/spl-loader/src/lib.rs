//! SPL Loader Library
//!
//! Loads Structured Product Labeling (SPL) drug-label archives into a
//! relational store.
//!
//! # Overview
//!
//! - **Acquisition**: scrape the archive listing, download new archives with
//!   MD5 verification and retry (`acquisition`)
//! - **Parsing**: extract each label on a bounded worker pool, quarantining
//!   files that fail (`parsing`)
//! - **Transform**: validate records and write one intermediate file per
//!   table (`transform`)
//! - **Storage**: stage, merge atomically, recompute latest versions and track
//!   runs, on PostgreSQL or SQLite (`storage`)
//! - **Pipeline**: the full and delta drivers tying it together (`pipeline`)
//!
//! # Example
//!
//! ```no_run
//! use spl_loader::{config::Settings, pipeline::Pipeline, storage};
//!
//! # async fn run() -> spl_loader::Result<()> {
//! let settings = Settings::load()?;
//! let backend = storage::connect(&settings.database).await?;
//! let pipeline = Pipeline::new(settings, backend);
//! let report = pipeline.run_delta_load().await?;
//! println!("loaded {} rows", report.records_loaded);
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod config;
pub mod error;
pub mod models;
pub mod parsing;
pub mod pipeline;
pub mod storage;
pub mod tables;
pub mod transform;

// Re-export commonly used types
pub use error::{EtlError, Result};
pub use pipeline::{Pipeline, RunReport};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SPL Loader - Structured Product Labeling ETL
#[derive(Parser, Debug)]
#[command(name = "spl-loader")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", global = true)]
    pub log_format: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Create the production, staging and bookkeeping tables
    Init,

    /// Replace all production data
    FullLoad {
        /// Directory of SPL XML files; downloads every listed archive when omitted
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Load archives published since the last run
    DeltaLoad,

    /// Recreate indexes and constraints left dropped by an interrupted full load
    RestoreSchema,

    /// Show recent runs and ledger sizes
    Status {
        /// Number of runs to show
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}
