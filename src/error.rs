//! Error types for replica bootstrap.
//!
//! This module provides a unified error type [`TesseraError`] for every bootstrap
//! step, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Configuration**: duplicate URLs, missing local member, discovery misuse,
//!   incompatible cluster versions
//! - **Consistency**: consistent index behind the snapshot, a v3 cluster
//!   without its backend
//! - **Fatal**: on-disk corruption the process cannot recover from (unreadable
//!   or unrepairable log, schema validation failure)
//! - **Network**: peer membership and version queries, discovery
//!
//! # Example
//!
//! ```rust
//! use tessera::error::{Result, TesseraError};
//!
//! fn check_name(name: &str) -> Result<()> {
//!     if name.is_empty() {
//!         return Err(TesseraError::InvalidConfig {
//!             field: "name".into(),
//!             reason: "member name cannot be empty".into(),
//!         });
//!     }
//!     Ok(())
//! }
//!
//! let err = check_name("").unwrap_err();
//! assert!(!err.is_fatal());
//! assert!(!err.is_retryable());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for bootstrap operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Incompatible cluster: {0}")]
    Incompatible(String),

    #[error("Member {0} has already been bootstrapped")]
    AlreadyBootstrapped(String),

    // Consistency errors
    #[error("Data corruption: {0}")]
    DataCorruption(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Unrecoverable: {0}")]
    Fatal(String),

    // Consensus, durable log and snapshot errors
    #[error("Raft consensus failed: {0}")]
    RaftConsensus(String),

    #[error("Raft log error: {0}")]
    RaftLog(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Discovery {op} failed: {reason}")]
    Discovery { op: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TesseraError::Network(_) | TesseraError::Timeout(_) | TesseraError::Discovery { .. }
        )
    }

    /// Whether the process must stop rather than report and retry later.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TesseraError::Fatal(_))
    }

    /// A read stopped in the middle of a record.
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, TesseraError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

impl From<rocksdb::Error> for TesseraError {
    fn from(e: rocksdb::Error) -> Self {
        TesseraError::RocksDb(e.to_string())
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(e: bincode::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for TesseraError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TesseraError::Network(format!("request timed out: {}", e))
        } else {
            TesseraError::Network(e.to_string())
        }
    }
}

/// Result type alias for bootstrap operations.
pub type Result<T> = std::result::Result<T, TesseraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_eof_detection() {
        let err = TesseraError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "torn frame"));
        assert!(err.is_unexpected_eof());

        let err = TesseraError::from(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert!(!err.is_unexpected_eof());
    }

    #[test]
    fn test_classification() {
        assert!(TesseraError::Fatal("wal".into()).is_fatal());
        assert!(!TesseraError::DataCorruption("index".into()).is_fatal());
        assert!(TesseraError::Timeout(10_000).is_retryable());
        assert!(TesseraError::Discovery {
            op: "join".into(),
            reason: "unreachable".into()
        }
        .is_retryable());
        assert!(!TesseraError::AlreadyBootstrapped("a".into()).is_retryable());
    }
}
