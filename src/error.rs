//! Error types for the keepsake library
//!
//! This module defines all error types that can occur during backup, catalog,
//! verification and restore operations. The variants follow the propagation
//! policy of the engine:
//!
//! - **Configuration errors** are fatal and abort before any run starts
//! - **File-level errors** (one unreadable or uncopyable file) are recorded
//!   against that file and the run continues
//! - **Run-level errors** (run directory or catalog segment cannot be created)
//!   are fatal for the invocation and always carry the offending path
//! - **Catalog parse errors** are logged and the malformed record is dropped
//!
//! A fingerprint mismatch found during verification is not an error at all; it
//! is reported as data on [`crate::types::VerifiedRecord`].

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the keepsake library
pub type Result<T> = std::result::Result<T, KeepsakeError>;

/// Main error type for all keepsake operations
#[derive(Debug, Error)]
pub enum KeepsakeError {
    /// Invalid or inaccessible configured path
    #[error("Configuration error for {path:?}: {reason}")]
    Config {
        /// Path that failed the check
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// I/O errors without a more specific path context
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error attached to the path it happened on
    #[error("IO error on {path:?}: {source}")]
    FileIo {
        /// Path being read, written or created
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Malformed record inside a catalog segment
    #[error("Catalog parse error in {segment:?} line {line}: {reason}")]
    CatalogParse {
        /// Segment file being parsed
        segment: PathBuf,
        /// 1-based line number where the record was abandoned
        line: usize,
        /// Description of the problem
        reason: String,
    },

    /// A catalog segment with this name already exists
    #[error("Catalog segment already exists: {0:?}")]
    SegmentExists(PathBuf),

    /// Fingerprint text is not a hex digest
    #[error("Invalid fingerprint: {0:?}")]
    InvalidFingerprint(String),

    /// Path cannot be written into the line-oriented catalog
    #[error("Path cannot be recorded in the catalog: {0:?}")]
    UnrepresentablePath(PathBuf),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeepsakeError {
    /// Create a configuration error for a path
    pub fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        KeepsakeError::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Attach a path to an I/O error
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KeepsakeError::FileIo {
            path: path.into(),
            source,
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        KeepsakeError::Internal(msg.into())
    }

    /// Check if this error only disqualifies a single file
    ///
    /// File-level errors are recorded against the file and skipped; the run
    /// that produced them still completes and is still appended.
    pub fn is_file_level(&self) -> bool {
        matches!(
            self,
            KeepsakeError::Io(_)
                | KeepsakeError::FileIo { .. }
                | KeepsakeError::UnrepresentablePath(_)
                | KeepsakeError::WalkDir(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            KeepsakeError::Config { path, reason } => {
                format!(
                    "{:?}: {}. Check the configured source and destination paths and their permissions.",
                    path, reason
                )
            }
            KeepsakeError::SegmentExists(path) => {
                format!(
                    "Catalog segment {:?} already exists. Another backup may have run in the same second; try again.",
                    path
                )
            }
            KeepsakeError::FileIo { path, source }
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                format!(
                    "Permission denied for {:?}. Check file permissions or run with appropriate privileges.",
                    path
                )
            }
            _ => self.to_string(),
        }
    }
}
