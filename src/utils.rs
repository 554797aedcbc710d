//! Utility functions for keepsake
//!
//! Small helpers shared by the engine, catalog and restore modules:
//!
//! - Catalog-safe path text ([`catalog_text`])
//! - Metadata-preserving file copies ([`copy_preserving_mtime`])
//! - Permission handling (cross-platform)
//! - Directory cleanup and byte formatting

use crate::error::{KeepsakeError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing::{trace, warn};

/// Text form of a path as it is written into the catalog
///
/// The catalog is line-oriented UTF-8, so a path must be valid UTF-8 and
/// must not contain a line break to be recorded faithfully.
///
/// # Errors
///
/// - [`KeepsakeError::UnrepresentablePath`] if the path cannot be recorded
pub fn catalog_text(path: &Path) -> Result<&str> {
    match path.to_str() {
        Some(text) if !text.contains(['\n', '\r']) => Ok(text),
        _ => Err(KeepsakeError::UnrepresentablePath(path.to_path_buf())),
    }
}

/// Copy a file, keeping its permissions and modification time
///
/// Creates missing parent directories of `to`. An existing `to` is never
/// overwritten. Once `to` has been created, any later failure removes it
/// again, so no partial or mis-dated copy is left behind.
///
/// # Returns
///
/// Number of bytes copied.
///
/// # Errors
///
/// - [`KeepsakeError::FileIo`] naming the path the failure happened on,
///   with [`io::ErrorKind::AlreadyExists`] if `to` already exists
pub fn copy_preserving_mtime(from: &Path, to: &Path) -> Result<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| KeepsakeError::file_io(parent, e))?;
    }

    let mut reader = File::open(from).map_err(|e| KeepsakeError::file_io(from, e))?;
    let metadata = reader
        .metadata()
        .map_err(|e| KeepsakeError::file_io(from, e))?;
    let writer = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(to)
        .map_err(|e| KeepsakeError::file_io(to, e))?;

    match fill_copy(&mut reader, writer, from, to, &metadata) {
        Ok(bytes) => {
            trace!("Copied {:?} -> {:?} ({} bytes)", from, to, bytes);
            Ok(bytes)
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(to) {
                warn!("Could not remove incomplete copy {:?}: {}", to, cleanup);
            }
            Err(e)
        }
    }
}

/// Write the content and metadata of `from` into the freshly created `to`
fn fill_copy(
    reader: &mut File,
    mut writer: File,
    from: &Path,
    to: &Path,
    metadata: &fs::Metadata,
) -> Result<u64> {
    let bytes = io::copy(reader, &mut writer).map_err(|e| KeepsakeError::file_io(from, e))?;
    writer.flush().map_err(|e| KeepsakeError::file_io(to, e))?;
    drop(writer);

    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    filetime::set_file_mtime(to, mtime).map_err(|e| KeepsakeError::file_io(to, e))?;
    fs::set_permissions(to, metadata.permissions()).map_err(|e| KeepsakeError::file_io(to, e))?;
    Ok(bytes)
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, permissions).map_err(|e| KeepsakeError::file_io(path, e))?;
    Ok(())
}

/// Set permissions (Windows implementation)
///
/// Only the read-only attribute can be expressed; it is set when the owner
/// write bit is clear.
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|e| KeepsakeError::file_io(path, e))?;
    let mut perms = metadata.permissions();
    perms.set_readonly((mode & 0o200) == 0);
    fs::set_permissions(path, perms).map_err(|e| KeepsakeError::file_io(path, e))?;
    Ok(())
}

/// Remove directory if empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Format bytes in human-readable form
///
/// ```rust
/// use keepsake::utils::format_bytes;
///
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
