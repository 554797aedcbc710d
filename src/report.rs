//! Backup history reporting
//!
//! Where verification looks only at the latest backup of every source, the
//! history report lists *every* recorded backup, superseded ones included,
//! each with the current state of its stored copy. [`BackupTable`] condenses
//! the same data into a sources-by-runs grid:
//!
//! ```text
//! Source File              2023-09-18_09h44m37s  2023-09-19_10h02m11s
//! /home/peter/a.txt                           1                     ?
//! /home/peter/sub/b.txt                       1
//! ```
//!
//! `1` marks a verified backup in that run, `?` one that failed verification.

use crate::error::{KeepsakeError, Result};
use crate::types::{BackupRecord, BackupRun, RunId, VerifiedRecord};
use crate::verification::Verifier;
use chrono::Local;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the written report inside the destination
pub const REPORT_FILE: &str = "backup_info.txt";

/// Every recorded backup per source location, verified
#[derive(Debug, Clone, Default)]
pub struct HistoryReport {
    /// Runs in chronological order
    pub run_ids: Vec<RunId>,
    /// Backups per source, oldest first
    pub sources: BTreeMap<PathBuf, Vec<VerifiedRecord>>,
}

impl HistoryReport {
    /// Verify every record of `runs` and group them by source
    pub fn build(runs: &[BackupRun]) -> Self {
        let mut ordered: Vec<&BackupRun> = runs.iter().collect();
        ordered.sort_by_key(|run| run.run_id);

        let records: Vec<BackupRecord> = ordered
            .iter()
            .flat_map(|run| run.records.iter().cloned())
            .collect();
        let verified = Verifier::new().verify_all(&records);

        Self::from_verified(ordered.iter().map(|run| run.run_id).collect(), verified)
    }

    /// Group already verified records, keeping their order within a source
    pub fn from_verified(run_ids: Vec<RunId>, verified: Vec<VerifiedRecord>) -> Self {
        let mut sources: BTreeMap<PathBuf, Vec<VerifiedRecord>> = BTreeMap::new();
        for entry in verified {
            sources
                .entry(entry.record.source.clone())
                .or_default()
                .push(entry);
        }
        Self { run_ids, sources }
    }

    /// Whether the catalog held no records
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Total number of recorded backups
    pub fn backup_count(&self) -> usize {
        self.sources.values().map(Vec::len).sum()
    }

    /// Text form of the report
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (source, backups) in &self.sources {
            let _ = writeln!(out, "Source Location: {}", source.display());
            for (i, backup) in backups.iter().enumerate() {
                let modified = backup
                    .modified
                    .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let _ = writeln!(
                    out,
                    "Backup {} Location: {}",
                    i + 1,
                    backup.record.backup.display()
                );
                let _ = writeln!(out, "Modified Time: {}", modified);
                let _ = writeln!(out, "Size: {} bytes", backup.size);
                let _ = writeln!(out, "Fingerprint: {}", backup.record.fingerprint);
                let _ = writeln!(out, "Hash Match: {}", backup.hash_match);
            }
            out.push('\n');
        }
        out
    }

    /// Write the report to `path`, replacing any previous report
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).map_err(|e| KeepsakeError::file_io(path, e))?;
        info!(
            "Wrote history report {:?} ({} backups of {} sources)",
            path,
            self.backup_count(),
            self.sources.len()
        );
        Ok(())
    }

    /// Sources-by-runs overview
    pub fn table(&self) -> BackupTable {
        let rows = self
            .sources
            .iter()
            .map(|(source, backups)| {
                let cells = self
                    .run_ids
                    .iter()
                    .map(|run_id| {
                        match backups.iter().find(|b| b.record.run_id == *run_id) {
                            Some(b) if b.hash_match => TableCell::Verified,
                            Some(_) => TableCell::Mismatch,
                            None => TableCell::Empty,
                        }
                    })
                    .collect();
                (source.clone(), cells)
            })
            .collect();

        BackupTable {
            run_ids: self.run_ids.clone(),
            rows,
        }
    }
}

/// State of one source in one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableCell {
    /// Backed up and verified
    Verified,
    /// Backed up but failed verification
    Mismatch,
    /// Not backed up in this run
    Empty,
}

impl TableCell {
    /// Cell text
    pub fn as_str(&self) -> &'static str {
        match self {
            TableCell::Verified => "1",
            TableCell::Mismatch => "?",
            TableCell::Empty => "",
        }
    }
}

/// Grid of sources (rows) by run ids (columns)
#[derive(Debug, Clone)]
pub struct BackupTable {
    /// Column headings
    pub run_ids: Vec<RunId>,
    /// One row per source location
    pub rows: Vec<(PathBuf, Vec<TableCell>)>,
}

impl BackupTable {
    /// Render the heading and at most `limit` rows as aligned text
    pub fn render(&self, limit: usize) -> String {
        let headings: Vec<String> = self.run_ids.iter().map(RunId::to_string).collect();
        let shown = &self.rows[..self.rows.len().min(limit)];

        let first_width = shown
            .iter()
            .map(|(source, _)| source.display().to_string().chars().count())
            .chain(std::iter::once("Source File".len()))
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        let _ = write!(out, "{:<width$}", "Source File", width = first_width);
        for heading in &headings {
            let _ = write!(out, "  {}", heading);
        }
        out.push('\n');

        for (source, cells) in shown {
            let _ = write!(out, "{:<width$}", source.display(), width = first_width);
            for (cell, heading) in cells.iter().zip(&headings) {
                let _ = write!(out, "  {:>width$}", cell.as_str(), width = heading.len());
            }
            out.push('\n');
        }

        if self.rows.len() > shown.len() {
            let _ = writeln!(out, "... {} more sources", self.rows.len() - shown.len());
        }
        out
    }
}
