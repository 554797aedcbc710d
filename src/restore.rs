//! Restore script synthesis
//!
//! Restores are never performed directly. Instead a [`RestoreSynthesizer`]
//! turns the latest catalog record of every source, together with the
//! verification result of its stored copy, into a self-contained script the
//! user can review and run:
//!
//! - The script asks for an interactive yes/no confirmation before anything
//!   is copied; any answer other than yes exits without touching the
//!   destination.
//! - One block per restorable file creates the target directory and copies
//!   the stored copy into place. A failed copy prints an error and the
//!   remaining blocks still run; the script exits non-zero at the end.
//! - Entries whose stored copy failed verification, or that were not verified
//!   at all, only produce a warning line. Unverified backups are never
//!   restored.
//!
//! Target paths re-root each source under the restore destination using the
//! same common-ancestor arithmetic as the tree walker, so restoring into the
//! original location (e.g. `/`) puts every file back where it came from.
//!
//! Two flavors are supported: bash ([`ScriptFlavor::Posix`]) and cmd batch
//! ([`ScriptFlavor::Batch`]).

use crate::catalog::CatalogIndex;
use crate::error::{KeepsakeError, Result};
use crate::utils;
use crate::verification::VerificationReport;
use crate::walker::{common_ancestor, relative_to_ancestor};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, instrument, warn};

/// Script language of a generated restore procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptFlavor {
    /// bash script
    Posix,
    /// Windows cmd batch file
    Batch,
}

impl ScriptFlavor {
    /// Default file name of the generated script
    pub fn file_name(&self) -> &'static str {
        match self {
            ScriptFlavor::Posix => "restore_backup.sh",
            ScriptFlavor::Batch => "restore_backup.bat",
        }
    }
}

impl Default for ScriptFlavor {
    fn default() -> Self {
        if cfg!(windows) {
            ScriptFlavor::Batch
        } else {
            ScriptFlavor::Posix
        }
    }
}

impl fmt::Display for ScriptFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptFlavor::Posix => f.write_str("posix"),
            ScriptFlavor::Batch => f.write_str("batch"),
        }
    }
}

impl FromStr for ScriptFlavor {
    type Err = KeepsakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "posix" | "sh" | "bash" => Ok(ScriptFlavor::Posix),
            "batch" | "bat" | "cmd" => Ok(ScriptFlavor::Batch),
            other => Err(KeepsakeError::internal(format!(
                "Unknown script flavor {:?} (expected posix or batch)",
                other
            ))),
        }
    }
}

/// One entry of a restore plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStep {
    /// Copy a verified backup into place
    Copy {
        /// Original source location
        source: PathBuf,
        /// Stored copy
        backup: PathBuf,
        /// Where the file is restored to
        target: PathBuf,
    },
    /// Backup that will not be restored
    Refused {
        /// Original source location
        source: PathBuf,
        /// Stored copy
        backup: PathBuf,
        /// Why it is refused
        reason: String,
    },
}

/// Restore steps for every source in a catalog index, ordered by source
#[derive(Debug, Clone)]
pub struct RestorePlan {
    /// Directory files are restored under
    pub destination_root: PathBuf,
    /// Steps in source order
    pub steps: Vec<RestoreStep>,
}

impl RestorePlan {
    /// Number of files the script will copy
    pub fn restorable_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, RestoreStep::Copy { .. }))
            .count()
    }

    /// Number of entries the script refuses to restore
    pub fn refused_count(&self) -> usize {
        self.steps.len() - self.restorable_count()
    }

    /// Render the plan as a script
    pub fn render(&self, flavor: ScriptFlavor) -> String {
        match flavor {
            ScriptFlavor::Posix => self.render_posix(),
            ScriptFlavor::Batch => self.render_batch(),
        }
    }

    fn render_posix(&self) -> String {
        let root = self.destination_root.to_string_lossy();
        let mut out = String::new();
        // writeln! into a String cannot fail
        let _ = writeln!(out, "#!/bin/bash");
        let _ = writeln!(out, "# Restore script generated by keepsake");
        let _ = writeln!(
            out,
            "# {} files to restore, {} refused",
            self.restorable_count(),
            self.refused_count()
        );
        out.push('\n');

        let prompt = format!(
            "Restore {} files into {}? [y/N] ",
            self.restorable_count(),
            root
        );
        let _ = writeln!(out, "read -r -p {} answer", quote_posix(&prompt));
        let _ = writeln!(out, "case \"$answer\" in");
        let _ = writeln!(out, "    [yY]|[yY][eE][sS]) ;;");
        let _ = writeln!(out, "    *) echo \"Restore cancelled.\"; exit 1 ;;");
        let _ = writeln!(out, "esac");
        out.push('\n');
        let _ = writeln!(out, "failed=0");

        for step in &self.steps {
            out.push('\n');
            match step {
                RestoreStep::Copy {
                    source,
                    backup,
                    target,
                } => {
                    let target_dir = target.parent().unwrap_or(&self.destination_root);
                    let _ = writeln!(out, "# {}", source.to_string_lossy());
                    let _ = writeln!(
                        out,
                        "mkdir -p {} && cp -p {} {} || {{ echo \"ERROR: failed to restore\" {} >&2; failed=1; }}",
                        quote_posix(&target_dir.to_string_lossy()),
                        quote_posix(&backup.to_string_lossy()),
                        quote_posix(&target.to_string_lossy()),
                        quote_posix(&target.to_string_lossy()),
                    );
                }
                RestoreStep::Refused { source, reason, .. } => {
                    let _ = writeln!(
                        out,
                        "echo \"WARNING: not restoring\" {} {} >&2",
                        quote_posix(&source.to_string_lossy()),
                        quote_posix(&format!("({})", reason)),
                    );
                }
            }
        }

        out.push('\n');
        let _ = writeln!(out, "exit $failed");
        out
    }

    fn render_batch(&self) -> String {
        let root = self.destination_root.to_string_lossy();
        let mut out = String::new();
        let _ = writeln!(out, "@echo off");
        let _ = writeln!(out, "setlocal");
        let _ = writeln!(out, "rem Restore script generated by keepsake");
        let _ = writeln!(
            out,
            "rem {} files to restore, {} refused",
            self.restorable_count(),
            self.refused_count()
        );
        out.push('\n');

        let _ = writeln!(
            out,
            "set /p ANSWER=\"Restore {} files into {}? [y/N] \"",
            self.restorable_count(),
            escape_batch_quoted(&root)
        );
        let _ = writeln!(out, "if /I \"%ANSWER%\"==\"y\" goto confirmed");
        let _ = writeln!(out, "if /I \"%ANSWER%\"==\"yes\" goto confirmed");
        let _ = writeln!(out, "echo Restore cancelled.");
        let _ = writeln!(out, "exit /b 1");
        let _ = writeln!(out, ":confirmed");
        let _ = writeln!(out, "set FAILED=0");

        for step in &self.steps {
            out.push('\n');
            match step {
                RestoreStep::Copy {
                    source,
                    backup,
                    target,
                } => {
                    let target_dir = target.parent().unwrap_or(&self.destination_root);
                    let dir = quote_batch(&target_dir.to_string_lossy());
                    let _ = writeln!(out, "rem {}", escape_batch(&source.to_string_lossy()));
                    let _ = writeln!(out, "if not exist {} mkdir {}", dir, dir);
                    let _ = writeln!(
                        out,
                        "copy /Y {} {} >nul || (echo ERROR: failed to restore {} 1>&2 & set FAILED=1)",
                        quote_batch(&backup.to_string_lossy()),
                        quote_batch(&target.to_string_lossy()),
                        quote_batch(&target.to_string_lossy()),
                    );
                }
                RestoreStep::Refused { source, reason, .. } => {
                    let _ = writeln!(
                        out,
                        "echo WARNING: not restoring {} ^({}^) 1>&2",
                        quote_batch(&source.to_string_lossy()),
                        escape_batch(reason),
                    );
                }
            }
        }

        out.push('\n');
        let _ = writeln!(out, "exit /b %FAILED%");
        out
    }
}

/// Builds restore scripts from a catalog index and its verification
#[derive(Debug, Clone)]
pub struct RestoreSynthesizer {
    destination_root: PathBuf,
    flavor: ScriptFlavor,
}

impl RestoreSynthesizer {
    /// Create a synthesizer restoring under `destination_root`
    pub fn new(destination_root: impl Into<PathBuf>) -> Self {
        Self {
            destination_root: destination_root.into(),
            flavor: ScriptFlavor::default(),
        }
    }

    /// Set the script flavor
    pub fn with_flavor(mut self, flavor: ScriptFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Script flavor in use
    pub fn flavor(&self) -> ScriptFlavor {
        self.flavor
    }

    /// Where a source location is restored to
    pub fn target_for(&self, source: &Path) -> PathBuf {
        let ancestor = common_ancestor(source, &self.destination_root);
        self.destination_root
            .join(relative_to_ancestor(source, &ancestor))
    }

    /// Decide a step for every source in `index`
    ///
    /// Only entries present in `verified` with `hash_match` set become copy
    /// steps.
    pub fn plan(&self, index: &CatalogIndex, verified: &VerificationReport) -> RestorePlan {
        let steps = index
            .records()
            .map(|record| {
                let refused = |reason: String| RestoreStep::Refused {
                    source: record.source.clone(),
                    backup: record.backup.clone(),
                    reason,
                };
                match verified.get(&record.source) {
                    Some(entry) if entry.hash_match && entry.record == *record => {
                        RestoreStep::Copy {
                            source: record.source.clone(),
                            backup: record.backup.clone(),
                            target: self.target_for(&record.source),
                        }
                    }
                    Some(entry) if entry.hash_match => {
                        refused("verification result is for a different backup".to_string())
                    }
                    Some(entry) => refused(match &entry.error {
                        Some(error) => format!("stored copy failed verification: {}", error),
                        None => "stored copy failed verification".to_string(),
                    }),
                    None => refused("stored copy was not verified".to_string()),
                }
            })
            .collect();

        RestorePlan {
            destination_root: self.destination_root.clone(),
            steps,
        }
    }

    /// Script text for `index`
    pub fn synthesize(&self, index: &CatalogIndex, verified: &VerificationReport) -> String {
        self.plan(index, verified).render(self.flavor)
    }

    /// Write the script to `path`, executable on unix
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::FileIo`] if the script cannot be written
    #[instrument(skip(self, index, verified))]
    pub fn write_script(
        &self,
        index: &CatalogIndex,
        verified: &VerificationReport,
        path: &Path,
    ) -> Result<RestorePlan> {
        let plan = self.plan(index, verified);
        fs::write(path, plan.render(self.flavor)).map_err(|e| KeepsakeError::file_io(path, e))?;

        utils::set_permissions(path, 0o755)?;

        if plan.refused_count() > 0 {
            warn!(
                "{} backups failed verification and will not be restored",
                plan.refused_count()
            );
        }
        info!(
            "Wrote {} restore script {:?} ({} files)",
            self.flavor,
            path,
            plan.restorable_count()
        );
        Ok(plan)
    }
}

/// Single-quote a string for bash
fn quote_posix(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Double-quote a string for cmd
fn quote_batch(text: &str) -> String {
    format!("\"{}\"", text.replace('%', "%%"))
}

/// Escape text placed inside an existing pair of double quotes
///
/// Only `%` expands there; carets would be printed literally.
fn escape_batch_quoted(text: &str) -> String {
    text.replace('%', "%%")
}

/// Escape text used unquoted in a cmd line
fn escape_batch(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => escaped.push_str("%%"),
            '^' | '&' | '|' | '<' | '>' | '(' | ')' => {
                escaped.push('^');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}
