//! SPL Common Library
//!
//! Shared error handling, logging bootstrap and checksum utilities used by the
//! SPL loader crates.
//!
//! # Example
//!
//! ```no_run
//! use spl_common::checksum::{compute_file_checksum, ChecksumAlgorithm};
//! use spl_common::Result;
//!
//! fn archive_digest(path: &str) -> Result<String> {
//!     compute_file_checksum(path, ChecksumAlgorithm::Md5)
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, SplError};
