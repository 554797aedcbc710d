//! Core data types used throughout the keepsake library
//!
//! ## Overview
//!
//! - **Catalog data**: [`RunId`], [`BackupRecord`], [`BackupRun`] - what was copied
//!   and where, exactly as persisted in catalog segments
//! - **Derived data**: [`VerifiedRecord`] - a record plus the result of re-hashing
//!   its stored copy
//! - **Run results**: [`FileOutcome`], [`RunSummary`], [`BackupOutcome`] - what a
//!   backup run decided per file and in total
//! - **Progress**: [`ProgressInfo`], [`ProgressCallback`]
//!
//! Records and runs are immutable once written; derived values are rebuilt from
//! the catalog on demand and never persisted.

use crate::error::{KeepsakeError, Result};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Duration, Local, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Text format of run ids, e.g. `2023-09-18_09h44m37s`
pub const RUN_ID_FORMAT: &str = "%Y-%m-%d_%Hh%Mm%Ss";

/// Identifier of one backup run
///
/// A local timestamp at second resolution. Its text form sorts
/// lexicographically in chronological order, which is what makes catalog
/// segment file names replay in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(NaiveDateTime);

impl RunId {
    /// Run id for the current local second
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    /// Run id for a timestamp, truncated to whole seconds
    pub fn from_datetime(at: NaiveDateTime) -> Self {
        RunId(at.with_nanosecond(0).unwrap_or(at))
    }

    /// The run id one second later
    pub fn next(&self) -> Self {
        RunId(self.0 + Duration::seconds(1))
    }

    /// Timestamp of the run
    pub fn timestamp(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(RUN_ID_FORMAT))
    }
}

impl FromStr for RunId {
    type Err = KeepsakeError;

    fn from_str(s: &str) -> Result<Self> {
        NaiveDateTime::parse_from_str(s, RUN_ID_FORMAT)
            .map(RunId)
            .map_err(|e| KeepsakeError::internal(format!("Invalid run id {:?}: {}", s, e)))
    }
}

impl TryFrom<String> for RunId {
    type Error = KeepsakeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.to_string()
    }
}

/// One file copied during one run
///
/// Created exactly once per file actually copied, immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Absolute path of the original file
    pub source: PathBuf,
    /// Absolute path of the stored copy
    pub backup: PathBuf,
    /// Fingerprint of the source at copy time, keyed by `source`
    pub fingerprint: Fingerprint,
    /// Run that produced this record
    pub run_id: RunId,
}

/// One invocation of the backup engine, persisted as one catalog segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRun {
    /// Unique run id
    pub run_id: RunId,
    /// Records in the order they were produced
    pub records: Vec<BackupRecord>,
}

impl BackupRun {
    /// Create an empty run
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            records: Vec::new(),
        }
    }

    /// Whether the run copied nothing
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A catalog record together with the state of its stored copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedRecord {
    /// The recorded backup
    pub record: BackupRecord,
    /// Whether the stored copy still hashes to the recorded fingerprint
    pub hash_match: bool,
    /// Size of the stored copy in bytes (0 when missing)
    pub size: u64,
    /// Modification time of the stored copy, if it exists
    pub modified: Option<DateTime<Utc>>,
    /// Why verification failed, if it did for a reason other than a mismatch
    pub error: Option<String>,
}

/// What the engine decided for one source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Copied into the run directory
    Copied {
        /// Source path
        source: PathBuf,
        /// Stored copy
        backup: PathBuf,
        /// Bytes copied
        bytes: u64,
    },
    /// Fingerprint equals the latest catalog record
    Unchanged {
        /// Source path
        source: PathBuf,
    },
    /// Already seen earlier in this run (duplicate root or symlink loop)
    Duplicate {
        /// Source path
        source: PathBuf,
    },
    /// Could not be fingerprinted, copied or recorded
    Failed {
        /// Source path
        source: PathBuf,
        /// Human-readable reason
        reason: String,
    },
    /// Not started because the run was cancelled
    Cancelled {
        /// Source path
        source: PathBuf,
    },
}

impl FileOutcome {
    /// Source path the outcome refers to
    pub fn source(&self) -> &PathBuf {
        match self {
            FileOutcome::Copied { source, .. }
            | FileOutcome::Unchanged { source }
            | FileOutcome::Duplicate { source }
            | FileOutcome::Failed { source, .. }
            | FileOutcome::Cancelled { source } => source,
        }
    }
}

/// Per-run totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Files copied
    pub copied: usize,
    /// Files skipped because they were unchanged
    pub unchanged: usize,
    /// Files skipped as duplicates within the run
    pub duplicates: usize,
    /// Files that failed
    pub failed: usize,
    /// Files not attempted because of cancellation
    pub cancelled: usize,
    /// Bytes copied
    pub bytes_copied: u64,
}

impl RunSummary {
    /// Fold one outcome into the totals
    pub fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Copied { bytes, .. } => {
                self.copied += 1;
                self.bytes_copied += bytes;
            }
            FileOutcome::Unchanged { .. } => self.unchanged += 1,
            FileOutcome::Duplicate { .. } => self.duplicates += 1,
            FileOutcome::Failed { .. } => self.failed += 1,
            FileOutcome::Cancelled { .. } => self.cancelled += 1,
        }
    }

    /// Total number of files examined
    pub fn total(&self) -> usize {
        self.copied + self.unchanged + self.duplicates + self.failed + self.cancelled
    }
}

/// Result of a completed backup run
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    /// The appended run
    pub run: BackupRun,
    /// Totals
    pub summary: RunSummary,
    /// Failed files and why
    pub failures: Vec<(PathBuf, String)>,
    /// Whether the run was cancelled before all files were examined
    pub cancelled: bool,
    /// Wall time of the run in milliseconds
    pub duration_ms: u64,
}

/// Progress callback for long-running operations
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Decision just made for one file
    pub outcome: FileOutcome,
    /// Files decided so far
    pub processed: usize,
    /// Files to decide in this run
    pub total: usize,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        if self.total > 0 {
            Some((self.processed as f32 / self.total as f32) * 100.0)
        } else {
            None
        }
    }
}
