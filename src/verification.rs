//! Backup verification
//!
//! Verification re-hashes stored backup copies and compares them against the
//! fingerprints recorded in the catalog. The identity key used for re-hashing
//! is the recorded *source* location, not the backup path, so a correct copy
//! reproduces the recorded fingerprint exactly.
//!
//! Every entry is verified in isolation: a stored copy that is missing or
//! unreadable yields `hash_match = false` for that entry only and never fails
//! the pass. A mismatch is data, not an error.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keepsake::catalog::CatalogStore;
//! use keepsake::verification::Verifier;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = CatalogStore::open("/mnt/backup")?;
//! let report = Verifier::new().verify(&catalog.latest_index()?);
//! if !report.is_valid() {
//!     for entry in report.mismatched() {
//!         eprintln!("Corrupt backup: {:?}", entry.record.backup);
//!     }
//! }
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use crate::catalog::CatalogIndex;
use crate::fingerprint::fingerprint_file;
use crate::types::{BackupRecord, VerifiedRecord};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Re-hashes stored copies against the catalog
#[derive(Debug, Clone, Copy, Default)]
pub struct Verifier;

impl Verifier {
    /// Create a new verifier
    pub fn new() -> Self {
        Self
    }

    /// Verify the latest record of every source in `index`
    ///
    /// Entries are re-hashed in parallel. The result holds exactly one entry
    /// per source in the index.
    #[instrument(skip(self, index), fields(entries = index.len()))]
    pub fn verify(&self, index: &CatalogIndex) -> VerificationReport {
        let start = Instant::now();
        let records: Vec<&BackupRecord> = index.records().collect();
        let entries: BTreeMap<PathBuf, VerifiedRecord> = records
            .par_iter()
            .map(|record| (record.source.clone(), self.verify_record(record)))
            .collect();

        let report = VerificationReport {
            entries,
            verification_time_ms: start.elapsed().as_millis() as u64,
        };
        info!("{}", report.summary());
        report
    }

    /// Verify every record of every run, in the order given
    ///
    /// Used for history reporting, where superseded backups are listed too.
    pub fn verify_all(&self, records: &[BackupRecord]) -> Vec<VerifiedRecord> {
        records
            .par_iter()
            .map(|record| self.verify_record(record))
            .collect()
    }

    /// Verify one record
    pub fn verify_record(&self, record: &BackupRecord) -> VerifiedRecord {
        let metadata = match fs::metadata(&record.backup) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Stored copy {:?} is unavailable: {}", record.backup, e);
                return VerifiedRecord {
                    record: record.clone(),
                    hash_match: false,
                    size: 0,
                    modified: None,
                    error: Some(format!("stored copy unavailable: {}", e)),
                };
            }
        };

        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        let key = record.source.to_string_lossy();

        let (hash_match, error) = match fingerprint_file(&key, &record.backup) {
            Ok(actual) if actual == record.fingerprint => {
                debug!("Verified {:?}", record.backup);
                (true, None)
            }
            Ok(actual) => {
                warn!(
                    "Stored copy {:?} does not match its recorded fingerprint (expected {}, found {})",
                    record.backup,
                    record.fingerprint.short(),
                    actual.short()
                );
                (false, None)
            }
            Err(e) => {
                warn!("Cannot re-hash {:?}: {}", record.backup, e);
                (false, Some(e.to_string()))
            }
        };

        VerifiedRecord {
            record: record.clone(),
            hash_match,
            size: metadata.len(),
            modified,
            error,
        }
    }
}

/// Result of verifying a catalog index, keyed by source location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Verified entries ordered by source location
    pub entries: BTreeMap<PathBuf, VerifiedRecord>,
    /// Time taken for verification in milliseconds
    pub verification_time_ms: u64,
}

impl VerificationReport {
    /// Entry for a source location
    pub fn get(&self, source: &Path) -> Option<&VerifiedRecord> {
        self.entries.get(source)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the report is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose stored copy matches its fingerprint
    pub fn verified_count(&self) -> usize {
        self.entries.values().filter(|e| e.hash_match).count()
    }

    /// Entries whose stored copy is missing, unreadable or altered
    pub fn mismatched(&self) -> impl Iterator<Item = &VerifiedRecord> {
        self.entries.values().filter(|e| !e.hash_match)
    }

    /// Check if every stored copy verified
    pub fn is_valid(&self) -> bool {
        self.entries.values().all(|e| e.hash_match)
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let verified = self.verified_count();
        if self.is_valid() {
            format!(
                "All {} backups verified in {}ms",
                verified, self.verification_time_ms
            )
        } else {
            format!(
                "{}/{} backups verified, {} failed verification ({}ms)",
                verified,
                self.len(),
                self.len() - verified,
                self.verification_time_ms
            )
        }
    }
}
