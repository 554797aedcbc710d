//! # Keepsake - Incremental, verifiable file backups
//!
//! Keepsake copies only the files whose content changed since their last
//! recorded backup, keeps an append-only, human-readable catalog of every copy
//! it has ever made, and turns that catalog into verified restore scripts.
//!
//! ## Overview
//!
//! - **Incremental runs**: every file is fingerprinted (SHA-256 over its source
//!   path and content) and copied only when the fingerprint differs from the
//!   latest catalog record for that path
//! - **Append-only catalog**: each run appends one plain-text segment; history
//!   is never rewritten and stays auditable without this library
//! - **Verification**: stored copies are re-hashed against their recorded
//!   fingerprints; corruption is reported per entry
//! - **Restore scripts**: verified backups become a reviewable bash or batch
//!   script that asks for confirmation and never restores a copy that failed
//!   verification
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keepsake::{BackupEngineBuilder, RestoreSynthesizer, ScriptFlavor, Verifier};
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BackupEngineBuilder::new()
//!     .sources(vec![PathBuf::from("/home/peter/Pictures")])
//!     .build(PathBuf::from("/home/peter/History"))?;
//!
//! // Copy what changed since the last run
//! let outcome = engine.run()?;
//! println!("Copied {} files", outcome.summary.copied);
//!
//! // Check the stored copies and write a restore script for the good ones
//! let index = engine.catalog().latest_index()?;
//! let report = Verifier::new().verify(&index);
//! RestoreSynthesizer::new("/home/peter/Restore")
//!     .with_flavor(ScriptFlavor::Posix)
//!     .write_script(&index, &report, Path::new("/home/peter/History/restore_backup.sh"))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Destination Layout
//!
//! ```text
//! History/
//! ├── .keepsake.lock
//! ├── backup_database_2023-09-18_09h44m37s.txt
//! ├── 2023-09-18_09h44m37s/
//! │   └── Pictures/cat.jpg
//! ├── backup_info.txt          # history report
//! └── restore_backup.sh        # generated restore script
//! ```
//!
//! ## Failure Model
//!
//! A file that cannot be read or copied is recorded as failed and skipped; the
//! run continues and is still appended to the catalog. Only failures to create
//! the run directory or the catalog segment abort a run. A malformed catalog
//! record is logged and dropped; the rest of its segment is still read.
//!
//! ## Module Organization
//!
//! - [`engine`]: Incremental backup runs
//! - [`catalog`]: Append-only catalog segments and the latest-per-source index
//! - [`verification`]: Re-hashing stored copies
//! - [`restore`]: Restore script synthesis
//! - [`report`]: Backup history report and table
//! - [`config`]: JSON configuration and preflight checks
//! - [`walker`]: Source tree enumeration
//! - [`fingerprint`]: File fingerprints
//! - [`types`]: Common types and data structures
//! - [`error`]: Error types and handling

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod report;
pub mod restore;
pub mod types;
pub mod utils;
pub mod verification;
pub mod walker;

// Re-export main types for convenience
pub use catalog::{CatalogIndex, CatalogLock, CatalogStore};
pub use config::{preflight, BackupConfig};
pub use engine::{BackupEngine, BackupEngineBuilder, CancelHandle};
pub use error::{KeepsakeError, Result};
pub use fingerprint::Fingerprint;
pub use report::{BackupTable, HistoryReport};
pub use restore::{RestorePlan, RestoreStep, RestoreSynthesizer, ScriptFlavor};
pub use types::*;
pub use verification::{VerificationReport, Verifier};
