//! Incremental backup engine
//!
//! [`BackupEngine`] performs one backup run against a destination directory:
//!
//! 1. Acquire the catalog writer lock and snapshot the latest-per-source
//!    [`CatalogIndex`] once. Every decision of the run is made against this
//!    snapshot, never against partial results of the run itself.
//! 2. Walk every source root and collect the files to examine. A source path
//!    seen a second time in the same run (duplicate or overlapping roots) is
//!    reported as a duplicate and not examined again.
//! 3. Fingerprint each file on a bounded worker pool and copy it into
//!    `<destination>/<run id>/<relative path>` when its fingerprint differs
//!    from the snapshot, or it has never been backed up.
//! 4. Append one catalog segment holding a record per successful copy.
//!
//! A file that cannot be read, copied or recorded fails on its own; the run
//! continues and is still appended (partial-run semantics). A run that copies
//! nothing appends an empty segment.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keepsake::BackupEngineBuilder;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BackupEngineBuilder::new()
//!     .sources(vec![PathBuf::from("/home/peter/Pictures")])
//!     .exclusions(vec![PathBuf::from("/home/peter/Pictures/cache")])
//!     .parallel_workers(4)
//!     .build(PathBuf::from("/mnt/backup"))?;
//!
//! let outcome = engine.run()?;
//! println!(
//!     "{} copied, {} unchanged, {} failed",
//!     outcome.summary.copied, outcome.summary.unchanged, outcome.summary.failed
//! );
//! # Ok(())
//! # }
//! ```

use crate::catalog::{CatalogIndex, CatalogStore};
use crate::error::{KeepsakeError, Result};
use crate::fingerprint::fingerprint_file;
use crate::types::{
    BackupOutcome, BackupRecord, BackupRun, FileOutcome, ProgressCallback, ProgressInfo, RunId,
    RunSummary,
};
use crate::utils;
use crate::walker::{TreeWalker, WalkItem};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Upper bound of the default worker count
///
/// Copying is disk bound; more threads than this rarely helps.
const MAX_DEFAULT_WORKERS: usize = 8;

/// Default number of parallel workers
pub fn default_workers() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_WORKERS)
}

/// Cloneable handle for cancelling a running backup
///
/// Cancellation is best effort: files already being copied finish, files not
/// yet started are reported as [`FileOutcome::Cancelled`], and the partial run
/// is still appended to the catalog.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Unit of work for one walked path
enum Task {
    /// Needs fingerprinting and possibly copying
    Examine(WalkItem),
    /// Already decided while walking
    Decided(FileOutcome),
}

/// Engine performing backup runs into one destination
pub struct BackupEngine {
    sources: Vec<PathBuf>,
    destination: PathBuf,
    exclusions: Vec<PathBuf>,
    parallel_workers: usize,
    follow_symlinks: bool,
    progress: Option<ProgressCallback>,
    cancel: CancelHandle,
    catalog: CatalogStore,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("sources", &self.sources)
            .field("destination", &self.destination)
            .field("exclusions", &self.exclusions)
            .field("parallel_workers", &self.parallel_workers)
            .field("follow_symlinks", &self.follow_symlinks)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl BackupEngine {
    /// Catalog the engine appends to
    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    /// Destination directory
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Handle that cancels the current (or next) run
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Perform one backup run
    ///
    /// # Returns
    ///
    /// The appended run together with per-run totals and the failed files.
    ///
    /// # Errors
    ///
    /// Only run-level failures are returned:
    ///
    /// - [`KeepsakeError::FileIo`] if the lock, the run directory or the
    ///   catalog segment cannot be created
    /// - [`KeepsakeError::ThreadPool`] if the worker pool cannot be started
    ///
    /// Per-file failures are reported in [`BackupOutcome::failures`].
    #[instrument(skip(self), fields(destination = ?self.destination))]
    pub fn run(&self) -> Result<BackupOutcome> {
        let start = Instant::now();

        let _lock = self.catalog.lock()?;
        let index = self.catalog.latest_index()?;
        debug!("Catalog index holds {} sources", index.len());

        let run_id = self.catalog.next_free_run_id(RunId::now());
        let run_dir = self.catalog.run_dir(&run_id);
        fs::create_dir_all(&run_dir).map_err(|e| {
            error!("Cannot create run directory {:?}: {}", run_dir, e);
            KeepsakeError::file_io(&run_dir, e)
        })?;
        info!("Starting backup run {} into {:?}", run_id, run_dir);

        let tasks = self.plan();
        let total = tasks.len();
        info!("Examining {} files from {} sources", total, self.sources.len());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallel_workers)
            .build()
            .map_err(|e| KeepsakeError::ThreadPool(e.to_string()))?;

        let processed = AtomicUsize::new(0);
        let results: Vec<(FileOutcome, Option<BackupRecord>)> = pool.install(|| {
            tasks
                .into_par_iter()
                .map(|task| {
                    let (outcome, record) = match task {
                        Task::Decided(outcome) => (outcome, None),
                        Task::Examine(item) => self.process_file(&item, &index, &run_dir, run_id),
                    };
                    let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(callback) = &self.progress {
                        callback(ProgressInfo {
                            outcome: outcome.clone(),
                            processed: done,
                            total,
                        });
                    }
                    (outcome, record)
                })
                .collect()
        });

        let mut run = BackupRun::new(run_id);
        let mut summary = RunSummary::default();
        let mut failures = Vec::new();
        for (outcome, record) in results {
            summary.record(&outcome);
            if let FileOutcome::Failed { source, reason } = &outcome {
                failures.push((source.clone(), reason.clone()));
            }
            if let Some(record) = record {
                run.records.push(record);
            }
        }

        if let Err(e) = utils::remove_dir_if_empty(&run_dir) {
            warn!("Could not remove empty run directory {:?}: {}", run_dir, e);
        }

        self.catalog.append(&run).map_err(|e| {
            error!("Cannot append catalog segment for run {}: {}", run_id, e);
            e
        })?;

        let cancelled = self.cancel.is_cancelled();
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Run {} finished in {}ms: {} copied, {} unchanged, {} failed, {} duplicates{}",
            run_id,
            duration_ms,
            summary.copied,
            summary.unchanged,
            summary.failed,
            summary.duplicates,
            if cancelled { " (cancelled)" } else { "" }
        );

        Ok(BackupOutcome {
            run,
            summary,
            failures,
            cancelled,
            duration_ms,
        })
    }

    /// Walk all sources in order and decide duplicates, backup path collisions
    /// and walk errors up front
    ///
    /// Two sources can map to the same path inside the run directory (for
    /// example `/t/home/x/f` and `/t/x/f` with destination `/t/home/H`). The
    /// first one walked keeps the path; later ones fail for this run.
    fn plan(&self) -> Vec<Task> {
        let mut seen = HashSet::new();
        let mut claimed: HashMap<PathBuf, PathBuf> = HashMap::new();
        let mut tasks = Vec::new();

        for source in &self.sources {
            let walker = TreeWalker::new(source, &self.destination)
                .with_exclusions(self.exclusions.iter().cloned())
                .with_follow_symlinks(self.follow_symlinks);

            for item in walker.walk() {
                match item {
                    Ok(item) => {
                        if !seen.insert(item.absolute.clone()) {
                            debug!("Skipping duplicate {:?}", item.absolute);
                            tasks.push(Task::Decided(FileOutcome::Duplicate {
                                source: item.absolute,
                            }));
                        } else if let Some(owner) = claimed.get(&item.relative) {
                            warn!(
                                "Backup path {:?} of {:?} is already used by {:?}",
                                item.relative, item.absolute, owner
                            );
                            tasks.push(Task::Decided(FileOutcome::Failed {
                                reason: format!(
                                    "backup path {} collides with {}",
                                    item.relative.display(),
                                    owner.display()
                                ),
                                source: item.absolute,
                            }));
                        } else {
                            claimed.insert(item.relative.clone(), item.absolute.clone());
                            tasks.push(Task::Examine(item));
                        }
                    }
                    Err(e) => {
                        let path = match &e {
                            KeepsakeError::WalkDir(walk) => walk
                                .path()
                                .map(Path::to_path_buf)
                                .unwrap_or_else(|| source.clone()),
                            _ => source.clone(),
                        };
                        warn!("Cannot walk {:?}: {}", path, e);
                        tasks.push(Task::Decided(FileOutcome::Failed {
                            source: path,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
        }

        tasks
    }

    /// Decide and, if changed, copy one file
    fn process_file(
        &self,
        item: &WalkItem,
        index: &CatalogIndex,
        run_dir: &Path,
        run_id: RunId,
    ) -> (FileOutcome, Option<BackupRecord>) {
        let source = item.absolute.clone();
        if self.cancel.is_cancelled() {
            return (FileOutcome::Cancelled { source }, None);
        }

        match copy_if_changed(item, index, run_dir, run_id) {
            Ok(Some((record, bytes))) => (
                FileOutcome::Copied {
                    source,
                    backup: record.backup.clone(),
                    bytes,
                },
                Some(record),
            ),
            Ok(None) => (FileOutcome::Unchanged { source }, None),
            Err(e) => {
                warn!("Failed to back up {:?}: {}", source, e);
                (
                    FileOutcome::Failed {
                        source,
                        reason: e.to_string(),
                    },
                    None,
                )
            }
        }
    }
}

/// Fingerprint `item` and copy it into the run directory if it changed
///
/// Returns the new record and the number of bytes copied, or `None` when the
/// fingerprint matches the latest catalog record.
fn copy_if_changed(
    item: &WalkItem,
    index: &CatalogIndex,
    run_dir: &Path,
    run_id: RunId,
) -> Result<Option<(BackupRecord, u64)>> {
    let identity_key = utils::catalog_text(&item.absolute)?;
    let fingerprint = fingerprint_file(identity_key, &item.absolute)?;

    if index.is_unchanged(&item.absolute, &fingerprint) {
        debug!("Unchanged: {:?}", item.absolute);
        return Ok(None);
    }

    let backup = run_dir.join(&item.relative);
    utils::catalog_text(&backup)?;

    // Refuses to overwrite an existing backup file
    let bytes = utils::copy_preserving_mtime(&item.absolute, &backup)?;
    info!("Copied {:?} -> {:?}", item.absolute, backup);

    Ok(Some((
        BackupRecord {
            source: item.absolute.clone(),
            backup,
            fingerprint,
            run_id,
        },
        bytes,
    )))
}

/// Builder for [`BackupEngine`]
///
/// # Default Values
///
/// - `sources`: empty
/// - `exclusions`: empty (the destination is always excluded)
/// - `parallel_workers`: number of CPU cores, at most 8
/// - `follow_symlinks`: false
pub struct BackupEngineBuilder {
    sources: Vec<PathBuf>,
    exclusions: Vec<PathBuf>,
    parallel_workers: usize,
    follow_symlinks: bool,
    progress: Option<ProgressCallback>,
    cancel: CancelHandle,
}

impl BackupEngineBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            exclusions: Vec::new(),
            parallel_workers: default_workers(),
            follow_symlinks: false,
            progress: None,
            cancel: CancelHandle::default(),
        }
    }

    /// Set the source roots, walked in the given order
    pub fn sources(mut self, sources: Vec<PathBuf>) -> Self {
        self.sources = sources;
        self
    }

    /// Set exact-path exclusions
    pub fn exclusions(mut self, exclusions: Vec<PathBuf>) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Set number of parallel workers
    ///
    /// Values less than 1 are set to 1.
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.parallel_workers = count.max(1);
        self
    }

    /// Set whether symlinked directories are descended into
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Register a callback invoked once per file as soon as it is decided
    ///
    /// The callback runs on worker threads.
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Use an existing cancel handle
    ///
    /// Lets a progress callback cancel the run it is reporting on.
    pub fn cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancel = handle;
        self
    }

    /// Build the engine for a destination directory
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::Config`] if the destination is not an existing
    ///   directory
    pub fn build(self, destination: PathBuf) -> Result<BackupEngine> {
        let catalog = CatalogStore::open(destination.clone())?;
        Ok(BackupEngine {
            sources: self.sources,
            destination,
            exclusions: self.exclusions,
            parallel_workers: self.parallel_workers,
            follow_symlinks: self.follow_symlinks,
            progress: self.progress,
            cancel: self.cancel,
            catalog,
        })
    }
}

impl Default for BackupEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
