//! Source tree enumeration
//!
//! [`TreeWalker`] lazily enumerates the regular files under one source root,
//! depth-first with every directory visited before its children. Each file is
//! yielded together with its path relative to the *common ancestor* of the
//! source root and the backup destination, so that several source roots
//! sharing an ancestor keep their distinguishing path segments inside the
//! backup tree:
//!
//! ```text
//! source       /home/peter/Pictures/cat.jpg
//! destination  /home/peter/History
//! ancestor     /home/peter
//! relative     Pictures/cat.jpg
//! ```
//!
//! ## Exclusions
//!
//! A directory (or file) is pruned when its absolute path is *exactly* one of
//! the configured exclusions; its whole subtree is skipped. Exclusions are not
//! prefixes: excluding `/a/b` does not exclude a separately listed root
//! `/a/b/c`. The backup destination is always excluded so a destination nested
//! inside a source is never backed up into itself.
//!
//! ## Symbolic links
//!
//! By default symlinked directories are not descended into, while symlinks
//! pointing at files are yielded like files (their target content is what
//! gets fingerprinted and copied). With `follow_symlinks` enabled, symlinked
//! directories are traversed and link loops surface as walk errors.

use crate::error::Result;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// A file found under a source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkItem {
    /// Absolute path of the file
    pub absolute: PathBuf,
    /// Path relative to the common ancestor of the root and the destination
    pub relative: PathBuf,
}

/// Walker over one source root
#[derive(Debug, Clone)]
pub struct TreeWalker {
    root: PathBuf,
    ancestor: PathBuf,
    exclusions: HashSet<PathBuf>,
    follow_symlinks: bool,
}

impl TreeWalker {
    /// Create a walker for `root` whose relative paths are computed against
    /// the common ancestor of `root` and `destination`
    pub fn new(root: impl Into<PathBuf>, destination: &Path) -> Self {
        let root = root.into();
        let ancestor = common_ancestor(&root, destination);
        let mut exclusions = HashSet::new();
        exclusions.insert(destination.to_path_buf());

        Self {
            root,
            ancestor,
            exclusions,
            follow_symlinks: false,
        }
    }

    /// Add exact-match exclusions
    pub fn with_exclusions<I, P>(mut self, exclusions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.exclusions.extend(exclusions.into_iter().map(Into::into));
        self
    }

    /// Set symbolic link following behavior
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Root being walked
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Common ancestor that relative paths are computed against
    pub fn ancestor(&self) -> &Path {
        &self.ancestor
    }

    /// Lazily enumerate the files under the root
    ///
    /// The sequence is finite and not restartable. Entries are visited in
    /// file-name order within each directory. Errors for individual entries
    /// (unreadable directories, link loops) are yielded in place and the walk
    /// continues past them.
    pub fn walk(&self) -> impl Iterator<Item = Result<WalkItem>> + '_ {
        WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                let excluded = self.exclusions.contains(entry.path());
                if excluded {
                    trace!("Pruning excluded path {:?}", entry.path());
                }
                !excluded
            })
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    let file_type = entry.file_type();
                    let is_file = file_type.is_file()
                        || (file_type.is_symlink() && entry.path().is_file());
                    if !is_file {
                        return None;
                    }
                    let absolute = entry.into_path();
                    let relative = relative_to_ancestor(&absolute, &self.ancestor);
                    Some(Ok(WalkItem { absolute, relative }))
                }
                Err(e) => Some(Err(e.into())),
            })
    }
}

/// Lowest directory that is an ancestor of both paths
///
/// Pure path arithmetic: the longest common prefix of the two paths'
/// components. When the paths share nothing (different drives, or relative
/// paths with different first components) the parent of `first` is used.
pub fn common_ancestor(first: &Path, second: &Path) -> PathBuf {
    let common: PathBuf = first
        .components()
        .zip(second.components())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a)
        .collect();

    if common.as_os_str().is_empty() {
        first.parent().unwrap_or(first).to_path_buf()
    } else {
        common
    }
}

/// Path of `path` relative to `ancestor`
///
/// When `path` is not below `ancestor` the root and prefix components are
/// dropped instead, so the result can always be joined under another
/// directory without escaping it.
pub fn relative_to_ancestor(path: &Path, ancestor: &Path) -> PathBuf {
    match path.strip_prefix(ancestor) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect(),
    }
}
