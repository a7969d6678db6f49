//! Checksum utilities for archive verification
//!
//! Archives published by the label source advertise a 128-bit MD5 digest, so
//! MD5 is the default. SHA-256 is kept for locally produced manifests.

use crate::error::{Result, SplError};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 8192;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = SplError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(SplError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Incremental hasher fed chunk by chunk while a payload streams in.
pub enum StreamingChecksum {
    Md5(md5::Context),
    Sha256(Sha256),
}

impl StreamingChecksum {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => StreamingChecksum::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => StreamingChecksum::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            StreamingChecksum::Md5(ctx) => ctx.consume(chunk),
            StreamingChecksum::Sha256(hasher) => hasher.update(chunk),
        }
    }

    /// Lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            StreamingChecksum::Md5(ctx) => format!("{:x}", ctx.compute()),
            StreamingChecksum::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Compute checksum for any readable source
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut hasher = StreamingChecksum::new(algorithm);
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize_hex())
}

/// Compute checksum for a file
pub fn compute_file_checksum(
    path: impl AsRef<Path>,
    algorithm: ChecksumAlgorithm,
) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file, algorithm)
}

/// Case-insensitive digest comparison
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Verify checksum for a file, returning the actual digest on success
pub fn verify_file_checksum(
    path: impl AsRef<Path>,
    expected: &str,
    algorithm: ChecksumAlgorithm,
) -> Result<String> {
    let actual = compute_file_checksum(path, algorithm)?;
    if checksums_match(expected, &actual) {
        Ok(actual)
    } else {
        Err(SplError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
