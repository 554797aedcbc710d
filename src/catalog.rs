//! Append-only backup catalog
//!
//! The catalog is the single source of truth for what has been backed up. It is
//! a flat directory of human-readable text segments, one per backup run, kept
//! next to the run directories in the backup destination:
//!
//! ```text
//! destination/
//! ├── .keepsake.lock                               # advisory writer lock
//! ├── backup_database_2023-09-18_09h44m37s.txt     # catalog segment (one per run)
//! ├── 2023-09-18_09h44m37s/                        # files copied by that run
//! │   └── Pictures/cat.jpg
//! └── backup_database_2023-09-19_10h02m11s.txt
//! ```
//!
//! ## Segment format
//!
//! Records are separated by a blank line; each record is three lines in fixed
//! order:
//!
//! ```text
//! Source: /home/peter/Pictures/cat.jpg
//! Backup: /home/peter/History/2023-09-18_09h44m37s/Pictures/cat.jpg
//! Fingerprint: 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08
//! ```
//!
//! Parsing is resilient: a malformed record is logged and dropped, and the rest
//! of the segment is still read. A segment without a single valid record is
//! still a run (an empty one).
//!
//! ## Reading and writing
//!
//! Segments are never modified after they are written. [`CatalogStore::append`]
//! publishes a whole segment at once with a no-clobber rename, so a reader
//! either sees the complete run or nothing of it. All queries, including the
//! latest-record-per-source [`CatalogIndex`], are folds over
//! [`CatalogStore::read_all`]; nothing is cached between calls.

use crate::error::{KeepsakeError, Result};
use crate::fingerprint::Fingerprint;
use crate::types::{BackupRecord, BackupRun, RunId};
use crate::utils;
use fs4::fs_std::FileExt;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// File name prefix of catalog segments
pub const SEGMENT_PREFIX: &str = "backup_database_";
/// File name suffix of catalog segments
pub const SEGMENT_SUFFIX: &str = ".txt";
/// Advisory lock file serializing writers
pub const LOCK_FILE: &str = ".keepsake.lock";

const KEY_SOURCE: &str = "Source";
const KEY_BACKUP: &str = "Backup";
const KEY_FINGERPRINT: &str = "Fingerprint";

/// Handle on the catalog kept in a backup destination directory
#[derive(Debug, Clone)]
pub struct CatalogStore {
    root: PathBuf,
}

impl CatalogStore {
    /// Open the catalog in an existing destination directory
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::Config`] if `root` is not an existing directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(KeepsakeError::config(&root, "catalog directory does not exist"));
        }
        Ok(Self { root })
    }

    /// Destination directory holding the catalog
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the segment file for a run
    pub fn segment_path(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join(format!("{}{}{}", SEGMENT_PREFIX, run_id, SEGMENT_SUFFIX))
    }

    /// Directory the files of a run are copied into
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// First free run id at or after `candidate` that sorts after every run
    /// already in the destination
    ///
    /// Replay order is file-name order, so a new run must never sort before an
    /// existing segment or run directory, even when the wall clock went back.
    /// Call while holding the [`CatalogLock`] so the id stays free until the
    /// run is appended.
    pub fn next_free_run_id(&self, candidate: RunId) -> RunId {
        let mut run_id = match self.latest_run_id() {
            Some(latest) if latest >= candidate => {
                warn!(
                    "Clock reads {} but destination already holds run {}, using {}",
                    candidate,
                    latest,
                    latest.next()
                );
                latest.next()
            }
            _ => candidate,
        };
        while self.segment_path(&run_id).exists() || self.run_dir(&run_id).exists() {
            debug!("Run id {} already taken, advancing", run_id);
            run_id = run_id.next();
        }
        run_id
    }

    /// Newest run id named by a segment or a run directory
    fn latest_run_id(&self) -> Option<RunId> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list {}: {}", self.root.display(), e);
                return None;
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                match name
                    .strip_prefix(SEGMENT_PREFIX)
                    .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
                {
                    Some(id) => id.parse().ok(),
                    None if entry.path().is_dir() => name.parse().ok(),
                    None => None,
                }
            })
            .max()
    }

    /// Acquire the exclusive writer lock
    ///
    /// Blocks until no other writer holds it. The lock is released when the
    /// returned guard is dropped. Readers never take the lock.
    pub fn lock(&self) -> Result<CatalogLock> {
        CatalogLock::acquire(&self.root)
    }

    /// Append a run as a new segment
    ///
    /// The segment is written to a temporary file in the catalog directory,
    /// synced, and then renamed into place without replacing any existing
    /// file. An empty run still produces an (empty) segment.
    ///
    /// # Returns
    ///
    /// Path of the written segment.
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::SegmentExists`] if a segment for this run id exists
    /// - [`KeepsakeError::UnrepresentablePath`] if a record cannot be written
    /// - [`KeepsakeError::FileIo`] if the segment cannot be created
    #[instrument(skip(self, run), fields(run_id = %run.run_id, records = run.records.len()))]
    pub fn append(&self, run: &BackupRun) -> Result<PathBuf> {
        let segment_path = self.segment_path(&run.run_id);
        if segment_path.exists() {
            return Err(KeepsakeError::SegmentExists(segment_path));
        }

        let text = render_segment(run)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| KeepsakeError::file_io(&self.root, e))?;
        temp.write_all(text.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| KeepsakeError::file_io(temp.path(), e))?;

        temp.persist_noclobber(&segment_path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                KeepsakeError::SegmentExists(segment_path.clone())
            } else {
                KeepsakeError::file_io(&segment_path, e.error)
            }
        })?;

        info!(
            "Appended catalog segment {:?} ({} records)",
            segment_path,
            run.records.len()
        );
        Ok(segment_path)
    }

    /// List segments in file-name (and therefore chronological) order
    ///
    /// Files in the catalog directory that do not follow the segment naming
    /// pattern are ignored.
    pub fn segments(&self) -> Result<Vec<(RunId, PathBuf)>> {
        let mut segments = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| KeepsakeError::file_io(&self.root, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| KeepsakeError::file_io(&self.root, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stamp) = name
                .strip_prefix(SEGMENT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
            else {
                continue;
            };
            match stamp.parse::<RunId>() {
                Ok(run_id) if entry.path().is_file() => segments.push((run_id, entry.path())),
                Ok(_) => {}
                Err(e) => debug!("Ignoring catalog-like file {:?}: {}", name, e),
            }
        }

        segments.sort_by(|a, b| a.1.file_name().cmp(&b.1.file_name()));
        Ok(segments)
    }

    /// Read and parse one segment
    ///
    /// Malformed records are logged as warnings and returned alongside the
    /// run in [`ParsedSegment::issues`].
    pub fn read_segment(&self, run_id: RunId, path: &Path) -> Result<ParsedSegment> {
        let text = fs::read_to_string(path).map_err(|e| KeepsakeError::file_io(path, e))?;
        let parsed = parse_segment(&text, run_id, path);
        for issue in &parsed.issues {
            warn!("{}", issue);
        }
        Ok(parsed)
    }

    /// Read every run in the catalog, oldest first
    ///
    /// A segment that cannot be read at all is logged and skipped; malformed
    /// records inside readable segments are dropped individually.
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::FileIo`] if the catalog directory cannot be listed
    pub fn read_all(&self) -> Result<Vec<BackupRun>> {
        let mut runs = Vec::new();
        for (run_id, path) in self.segments()? {
            match self.read_segment(run_id, &path) {
                Ok(parsed) => runs.push(parsed.run),
                Err(e) => warn!("Skipping unreadable catalog segment: {}", e),
            }
        }
        debug!("Read {} runs from catalog {:?}", runs.len(), self.root);
        Ok(runs)
    }

    /// Latest record per source location across the whole catalog
    pub fn latest_index(&self) -> Result<CatalogIndex> {
        Ok(CatalogIndex::from_runs(&self.read_all()?))
    }
}

/// Exclusive advisory lock held by a catalog writer
#[derive(Debug)]
pub struct CatalogLock {
    path: PathBuf,
    _file: File,
}

impl CatalogLock {
    /// Block until the lock on `root` is acquired
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| KeepsakeError::file_io(&path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| KeepsakeError::file_io(&path, e))?;
        debug!("Acquired catalog lock {:?}", path);
        Ok(Self { path, _file: file })
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Latest record per source location
///
/// Built by replaying runs in run-id order; for every source that appears in
/// the catalog it holds exactly one record, the most recent.
#[derive(Debug, Clone, Default)]
pub struct CatalogIndex {
    latest: BTreeMap<PathBuf, BackupRecord>,
}

impl CatalogIndex {
    /// Fold runs into an index, last write wins
    pub fn from_runs(runs: &[BackupRun]) -> Self {
        let mut ordered: Vec<&BackupRun> = runs.iter().collect();
        ordered.sort_by_key(|run| run.run_id);

        let mut latest = BTreeMap::new();
        for run in ordered {
            for record in &run.records {
                latest.insert(record.source.clone(), record.clone());
            }
        }
        Self { latest }
    }

    /// Latest record for a source
    pub fn get(&self, source: &Path) -> Option<&BackupRecord> {
        self.latest.get(source)
    }

    /// Whether `fingerprint` equals the latest recorded fingerprint of `source`
    pub fn is_unchanged(&self, source: &Path, fingerprint: &Fingerprint) -> bool {
        self.get(source)
            .map(|record| &record.fingerprint == fingerprint)
            .unwrap_or(false)
    }

    /// Number of distinct sources
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    /// Whether the catalog holds no records
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Records ordered by source path
    pub fn records(&self) -> impl Iterator<Item = &BackupRecord> {
        self.latest.values()
    }
}

/// A parsed segment and the records that had to be dropped
#[derive(Debug)]
pub struct ParsedSegment {
    /// Valid records in file order
    pub run: BackupRun,
    /// One [`KeepsakeError::CatalogParse`] per dropped record or stray line
    pub issues: Vec<KeepsakeError>,
}

/// Render a run in the segment text format
///
/// # Errors
///
/// - [`KeepsakeError::UnrepresentablePath`] if a path is not line-safe UTF-8
pub fn render_segment(run: &BackupRun) -> Result<String> {
    let mut text = String::new();
    for record in &run.records {
        // writeln! into a String cannot fail
        let _ = writeln!(text, "{}: {}", KEY_SOURCE, utils::catalog_text(&record.source)?);
        let _ = writeln!(text, "{}: {}", KEY_BACKUP, utils::catalog_text(&record.backup)?);
        let _ = writeln!(text, "{}: {}", KEY_FINGERPRINT, record.fingerprint);
        text.push('\n');
    }
    Ok(text)
}

/// Parser position inside a record
enum Pending {
    /// Between records
    Idle,
    /// Discarding lines until the next blank line or `Source:`
    Skipping,
    HaveSource {
        source: PathBuf,
    },
    HaveBackup {
        source: PathBuf,
        backup: PathBuf,
    },
}

/// Parse segment text into a run
///
/// Any line not matching the expected `Key: value` shape at its expected
/// position ends the current record. The partial record is dropped and
/// reported; parsing resumes at the next blank line or `Source:` line.
pub fn parse_segment(text: &str, run_id: RunId, segment: &Path) -> ParsedSegment {
    let mut run = BackupRun::new(run_id);
    let mut issues = Vec::new();
    let mut state = Pending::Idle;

    let issue = |line: usize, reason: String| KeepsakeError::CatalogParse {
        segment: segment.to_path_buf(),
        line,
        reason,
    };

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;

        if raw.trim().is_empty() {
            if let Some(missing) = missing_field(&state) {
                issues.push(issue(line_no, format!("record ended before {} line", missing)));
            }
            state = Pending::Idle;
            continue;
        }

        let field = raw
            .split_once(": ")
            .filter(|(_, value)| !value.is_empty());

        if let Some((KEY_SOURCE, value)) = field {
            if let Some(missing) = missing_field(&state) {
                issues.push(issue(line_no, format!("record ended before {} line", missing)));
            }
            state = Pending::HaveSource {
                source: PathBuf::from(value),
            };
            continue;
        }

        state = match (state, field) {
            (Pending::Skipping, _) => Pending::Skipping,
            (Pending::HaveSource { source }, Some((KEY_BACKUP, value))) => Pending::HaveBackup {
                source,
                backup: PathBuf::from(value),
            },
            (Pending::HaveBackup { source, backup }, Some((KEY_FINGERPRINT, value))) => {
                match value.parse::<Fingerprint>() {
                    Ok(fingerprint) => {
                        run.records.push(BackupRecord {
                            source,
                            backup,
                            fingerprint,
                            run_id,
                        });
                        Pending::Idle
                    }
                    Err(e) => {
                        issues.push(issue(line_no, e.to_string()));
                        Pending::Skipping
                    }
                }
            }
            (Pending::Idle, _) => {
                issues.push(issue(line_no, format!("unexpected line {:?}", raw)));
                Pending::Skipping
            }
            (pending, _) => {
                let missing = missing_field(&pending).unwrap_or(KEY_SOURCE);
                issues.push(issue(
                    line_no,
                    format!("expected {} line, found {:?}", missing, raw),
                ));
                Pending::Skipping
            }
        };
    }

    if let Some(missing) = missing_field(&state) {
        issues.push(issue(
            text.lines().count(),
            format!("segment ended before {} line", missing),
        ));
    }

    ParsedSegment { run, issues }
}

/// Next field a partially parsed record needs, if a record is in progress
fn missing_field(state: &Pending) -> Option<&'static str> {
    match state {
        Pending::HaveSource { .. } => Some(KEY_BACKUP),
        Pending::HaveBackup { .. } => Some(KEY_FINGERPRINT),
        Pending::Idle | Pending::Skipping => None,
    }
}
