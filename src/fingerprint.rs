//! File fingerprinting
//!
//! A fingerprint identifies a file's (identity key, content) pair. The identity
//! key is the file's absolute source path; its bytes are folded into a SHA-256
//! digest before the content bytes, which are streamed through the hasher in
//! fixed-size chunks so large files are never loaded into memory at once.
//!
//! Two files are identical for backup purposes iff their fingerprints are
//! equal. Because the key is part of the digest, the same bytes stored under
//! two different source paths produce two different fingerprints.
//!
//! ```rust,no_run
//! use keepsake::fingerprint::fingerprint_file;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = Path::new("/home/user/notes.txt");
//! let fp = fingerprint_file(&source.to_string_lossy(), source)?;
//! println!("{}", fp);
//! # Ok(())
//! # }
//! ```

use crate::error::{KeepsakeError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::str::FromStr;

/// Size of the chunks content is read in
pub const CHUNK_SIZE: usize = 8192;

/// Hex-encoded digest of an identity key and file content
///
/// Stored lowercase. Parsing accepts either case and normalizes it, so a
/// catalog edited by hand still compares equal to freshly computed values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex digest text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex characters, for display
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = KeepsakeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KeepsakeError::InvalidFingerprint(s.to_string()));
        }
        Ok(Fingerprint(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = KeepsakeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Fingerprint a content stream under an identity key
///
/// Reads `content` to the end in [`CHUNK_SIZE`] chunks. Interrupted reads are
/// retried; any other read error fails the whole fingerprint, so a partially
/// read file never yields a digest.
///
/// # Errors
///
/// - [`KeepsakeError::Io`] if the stream cannot be fully read
pub fn fingerprint_reader<R: Read>(identity_key: &str, mut content: R) -> Result<Fingerprint> {
    let mut hasher = Sha256::new();
    hasher.update(identity_key.as_bytes());

    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = match content.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

/// Fingerprint the file at `path` under an identity key
///
/// The identity key is normally the file's source location, also when `path`
/// points at a stored backup copy of that file.
///
/// # Errors
///
/// - [`KeepsakeError::FileIo`] if the file cannot be opened or read
pub fn fingerprint_file(identity_key: &str, path: &Path) -> Result<Fingerprint> {
    let file = File::open(path).map_err(|e| KeepsakeError::file_io(path, e))?;
    fingerprint_reader(identity_key, file).map_err(|e| match e {
        KeepsakeError::Io(source) => KeepsakeError::file_io(path, source),
        other => other,
    })
}
