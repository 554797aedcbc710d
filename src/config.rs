//! Backup configuration
//!
//! A [`BackupConfig`] names what to back up, where to, and what to leave out.
//! It is read from a JSON file:
//!
//! ```json
//! {
//!   "sources": ["/home/peter/Pictures", "/home/peter/bash"],
//!   "destination": "/home/peter/History",
//!   "exclusions": ["/home/peter/Pictures/Windows Spotlight Images"],
//!   "restore_destination": "/home/peter/Restore",
//!   "parallel_workers": 4,
//!   "script_flavor": "posix"
//! }
//! ```
//!
//! Every field is optional in the file; command line flags may fill in the
//! rest. Before a run, [`preflight`] checks that the configured directories
//! exist and are accessible.

use crate::engine::{default_workers, BackupEngine, BackupEngineBuilder};
use crate::error::{KeepsakeError, Result};
use crate::restore::ScriptFlavor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "keepsake.json";

/// Configuration of sources, destination and exclusions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Source directory trees, backed up in this order
    pub sources: Vec<PathBuf>,
    /// Backup destination holding the catalog and run directories
    pub destination: PathBuf,
    /// Directories pruned by exact path
    pub exclusions: Vec<PathBuf>,
    /// Root that restore scripts restore under (defaults to the original
    /// locations)
    pub restore_destination: Option<PathBuf>,
    /// Worker threads for fingerprinting and copying
    pub parallel_workers: Option<usize>,
    /// Restore script language
    pub script_flavor: Option<ScriptFlavor>,
    /// Whether symlinked directories are descended into
    pub follow_symlinks: bool,
}

impl BackupConfig {
    /// Load a configuration file
    ///
    /// # Errors
    ///
    /// - [`KeepsakeError::FileIo`] if the file cannot be read
    /// - [`KeepsakeError::Config`] if it is not valid configuration JSON
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| KeepsakeError::file_io(path, e))?;
        let config = serde_json::from_str(&text)
            .map_err(|e| KeepsakeError::config(path, format!("invalid configuration: {}", e)))?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load a configuration file, or start empty if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No configuration file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|e| KeepsakeError::file_io(path, e))
    }

    /// Make every path absolute against the current directory
    ///
    /// Catalog records and exclusion matching use absolute paths, so this
    /// runs before anything else touches the configuration.
    pub fn resolve(mut self) -> Result<Self> {
        let absolute = |path: &Path| {
            std::path::absolute(path)
                .map_err(|e| KeepsakeError::config(path, format!("cannot make path absolute: {}", e)))
        };

        self.sources = self
            .sources
            .iter()
            .map(|p| absolute(p.as_path()))
            .collect::<Result<_>>()?;
        self.exclusions = self
            .exclusions
            .iter()
            .map(|p| absolute(p.as_path()))
            .collect::<Result<_>>()?;
        if !self.destination.as_os_str().is_empty() {
            self.destination = absolute(self.destination.as_path())?;
        }
        if let Some(restore) = &self.restore_destination {
            self.restore_destination = Some(absolute(restore.as_path())?);
        }
        Ok(self)
    }

    /// Worker count, defaulting to the CPU count capped at 8
    pub fn workers(&self) -> usize {
        self.parallel_workers.unwrap_or_else(default_workers).max(1)
    }

    /// Restore root, defaulting to the filesystem root of the first source
    ///
    /// Restoring under the filesystem root puts files back at their original
    /// locations.
    pub fn restore_root(&self) -> PathBuf {
        if let Some(root) = &self.restore_destination {
            return root.clone();
        }
        self.sources
            .first()
            .and_then(|source| source.ancestors().last())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(std::path::MAIN_SEPARATOR_STR))
    }

    /// Script flavor, defaulting to the platform's
    pub fn flavor(&self) -> ScriptFlavor {
        self.script_flavor.unwrap_or_default()
    }

    /// Engine builder preset with this configuration
    pub fn engine_builder(&self) -> BackupEngineBuilder {
        BackupEngineBuilder::new()
            .sources(self.sources.clone())
            .exclusions(self.exclusions.clone())
            .parallel_workers(self.workers())
            .follow_symlinks(self.follow_symlinks)
    }

    /// Build a backup engine for this configuration
    pub fn engine(&self) -> Result<BackupEngine> {
        self.engine_builder().build(self.destination.clone())
    }
}

/// Check configured paths before a run
///
/// Every source must be an existing, readable directory and the destination
/// an existing, writable directory. All problems are logged; the first one is
/// returned.
///
/// # Errors
///
/// - [`KeepsakeError::Config`] naming the offending path
pub fn preflight(config: &BackupConfig) -> Result<()> {
    let mut problems = Vec::new();

    if config.sources.is_empty() {
        problems.push(KeepsakeError::config(
            PathBuf::new(),
            "no source directories configured",
        ));
    }
    for source in &config.sources {
        if let Err(e) = check_readable_dir(source) {
            problems.push(e);
        }
    }

    if config.destination.as_os_str().is_empty() {
        problems.push(KeepsakeError::config(
            PathBuf::new(),
            "no destination directory configured",
        ));
    } else if let Err(e) = check_writable_dir(&config.destination) {
        problems.push(e);
    }

    for problem in &problems {
        error!("{}", problem);
    }
    match problems.into_iter().next() {
        Some(first) => Err(first),
        None => Ok(()),
    }
}

fn check_readable_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(KeepsakeError::config(path, "directory does not exist"));
    }
    if !path.is_dir() {
        return Err(KeepsakeError::config(path, "not a directory"));
    }
    fs::read_dir(path)
        .map_err(|e| KeepsakeError::config(path, format!("directory is not readable: {}", e)))?;
    Ok(())
}

fn check_writable_dir(path: &Path) -> Result<()> {
    check_readable_dir(path)?;
    tempfile::tempfile_in(path)
        .map_err(|e| KeepsakeError::config(path, format!("directory is not writable: {}", e)))?;
    Ok(())
}
