//! Property-based testing for keepsake
//!
//! Uses proptest to verify invariants of fingerprints, the catalog segment
//! format, path arithmetic and incremental runs across randomly generated
//! inputs.

use ::keepsake::catalog::{parse_segment, render_segment};
use ::keepsake::fingerprint::fingerprint_reader;
use ::keepsake::walker::{common_ancestor, relative_to_ancestor};
use ::keepsake::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One block of hand-written segment text
#[derive(Debug, Clone)]
enum SegmentBlock {
    Valid {
        source: String,
        backup: String,
        fingerprint: String,
    },
    MissingBackup {
        source: String,
        fingerprint: String,
    },
    MissingFingerprint {
        source: String,
        backup: String,
    },
    BadFingerprint {
        source: String,
        backup: String,
    },
    Garbage(String),
}

/// Generate absolute catalog-safe paths
fn catalog_path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9 ._-]{0,8}[a-z0-9]", 1..=4)
        .prop_map(|parts| format!("/{}", parts.join("/")))
}

fn fingerprint_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{64}"
}

fn segment_block_strategy() -> impl Strategy<Value = SegmentBlock> {
    prop_oneof![
        3 => (catalog_path_strategy(), catalog_path_strategy(), fingerprint_strategy()).prop_map(
            |(source, backup, fingerprint)| SegmentBlock::Valid {
                source,
                backup,
                fingerprint,
            }
        ),
        1 => (catalog_path_strategy(), fingerprint_strategy())
            .prop_map(|(source, fingerprint)| SegmentBlock::MissingBackup { source, fingerprint }),
        1 => (catalog_path_strategy(), catalog_path_strategy())
            .prop_map(|(source, backup)| SegmentBlock::MissingFingerprint { source, backup }),
        1 => (catalog_path_strategy(), catalog_path_strategy())
            .prop_map(|(source, backup)| SegmentBlock::BadFingerprint { source, backup }),
        1 => "[a-z]{1,10}( [a-z]{1,10}){0,3}".prop_map(SegmentBlock::Garbage),
    ]
}

fn render_blocks(blocks: &[SegmentBlock]) -> String {
    let mut text = String::new();
    for block in blocks {
        match block {
            SegmentBlock::Valid {
                source,
                backup,
                fingerprint,
            } => {
                let _ = writeln!(text, "Source: {}\nBackup: {}\nFingerprint: {}", source, backup, fingerprint);
            }
            SegmentBlock::MissingBackup {
                source,
                fingerprint,
            } => {
                let _ = writeln!(text, "Source: {}\nFingerprint: {}", source, fingerprint);
            }
            SegmentBlock::MissingFingerprint { source, backup } => {
                let _ = writeln!(text, "Source: {}\nBackup: {}", source, backup);
            }
            SegmentBlock::BadFingerprint { source, backup } => {
                let _ = writeln!(text, "Source: {}\nBackup: {}\nFingerprint: not-hex", source, backup);
            }
            SegmentBlock::Garbage(line) => {
                let _ = writeln!(text, "{}", line);
            }
        }
        text.push('\n');
    }
    text
}

fn run_id() -> RunId {
    "2024-02-29_12h00m00s".parse().unwrap()
}

/// Generate small source trees as relative path -> content
fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(
        "(dir[0-3]/)?file[0-9]{1,2}\\.txt",
        prop::collection::vec(any::<u8>(), 0..2000),
        1..12,
    )
}

fn write_tree(root: &Path, tree: &BTreeMap<String, Vec<u8>>) -> anyhow::Result<()> {
    for (relative, content) in tree {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }
    Ok(())
}

fn backup_once(source: &Path, dest: &Path) -> anyhow::Result<BackupOutcome> {
    let engine = BackupEngineBuilder::new()
        .sources(vec![source.to_path_buf()])
        .parallel_workers(2)
        .build(dest.to_path_buf())?;
    Ok(engine.run()?)
}

proptest! {
    #[test]
    fn prop_fingerprint_is_deterministic(
        key in "/[a-z/]{1,40}",
        content in prop::collection::vec(any::<u8>(), 0..20_000),
    ) {
        let first = fingerprint_reader(&key, Cursor::new(&content)).unwrap();
        let second = fingerprint_reader(&key, Cursor::new(&content)).unwrap();
        prop_assert_eq!(first.as_str().len(), 64);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_fingerprint_depends_on_identity_key(
        a in "/[a-z]{1,20}",
        b in "/[a-z]{1,20}",
        content in prop::collection::vec(any::<u8>(), 0..1000),
    ) {
        prop_assume!(a != b);
        let fa = fingerprint_reader(&a, Cursor::new(&content)).unwrap();
        let fb = fingerprint_reader(&b, Cursor::new(&content)).unwrap();
        prop_assert_ne!(fa, fb);
    }

    #[test]
    fn prop_fingerprint_depends_on_content(
        key in "/[a-z]{1,20}",
        content in prop::collection::vec(any::<u8>(), 1..1000),
        flip in any::<prop::sample::Index>(),
    ) {
        let mut changed = content.clone();
        let at = flip.index(changed.len());
        changed[at] ^= 0xff;
        let original = fingerprint_reader(&key, Cursor::new(&content)).unwrap();
        let modified = fingerprint_reader(&key, Cursor::new(&changed)).unwrap();
        prop_assert_ne!(original, modified);
    }

    #[test]
    fn prop_parser_keeps_exactly_the_valid_records(
        blocks in prop::collection::vec(segment_block_strategy(), 0..20),
    ) {
        let text = render_blocks(&blocks);
        let parsed = parse_segment(&text, run_id(), Path::new("segment.txt"));

        let expected: Vec<(PathBuf, PathBuf, String)> = blocks
            .iter()
            .filter_map(|block| match block {
                SegmentBlock::Valid { source, backup, fingerprint } => Some((
                    PathBuf::from(source),
                    PathBuf::from(backup),
                    fingerprint.clone(),
                )),
                _ => None,
            })
            .collect();
        let actual: Vec<(PathBuf, PathBuf, String)> = parsed
            .run
            .records
            .iter()
            .map(|r| (r.source.clone(), r.backup.clone(), r.fingerprint.to_string()))
            .collect();

        prop_assert_eq!(actual, expected);
        let broken = blocks.iter().filter(|b| !matches!(b, SegmentBlock::Valid { .. })).count();
        prop_assert_eq!(parsed.issues.len(), broken);
    }

    #[test]
    fn prop_rendered_segment_parses_back(
        blocks in prop::collection::vec(
            (catalog_path_strategy(), catalog_path_strategy(), fingerprint_strategy()),
            0..10,
        ),
    ) {
        let mut run = BackupRun::new(run_id());
        for (source, backup, fingerprint) in blocks {
            run.records.push(BackupRecord {
                source: PathBuf::from(source),
                backup: PathBuf::from(backup),
                fingerprint: fingerprint.parse().unwrap(),
                run_id: run_id(),
            });
        }
        let text = render_segment(&run).unwrap();
        let parsed = parse_segment(&text, run_id(), Path::new("segment.txt"));
        prop_assert!(parsed.issues.is_empty());
        prop_assert_eq!(parsed.run, run);
    }

    #[test]
    fn prop_common_ancestor_is_a_shared_prefix(
        shared in prop::collection::vec("[a-z]{1,6}", 0..4),
        left in prop::collection::vec("[a-z]{1,6}", 1..4),
        right in prop::collection::vec("[a-z]{1,6}", 1..4),
    ) {
        let base = PathBuf::from("/").join(shared.join("/"));
        let first = base.join(left.join("/"));
        let second = base.join(right.join("/"));

        let ancestor = common_ancestor(&first, &second);
        prop_assert!(first.starts_with(&ancestor));
        prop_assert!(second.starts_with(&ancestor));
        prop_assert!(ancestor.starts_with(&base));

        // Re-rooting never escapes the new root and keeps the tail intact
        let relative = relative_to_ancestor(&first, &ancestor);
        prop_assert_eq!(ancestor.join(&relative), first.clone());
        let rerooted = Path::new("/restore").join(&relative);
        prop_assert!(rerooted.starts_with("/restore"));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_second_run_copies_nothing(tree in tree_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("src");
        let dest = temp_dir.path().join("dest");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();
        write_tree(&source, &tree).unwrap();

        let first = backup_once(&source, &dest).unwrap();
        prop_assert_eq!(first.summary.copied, tree.len());

        let second = backup_once(&source, &dest).unwrap();
        prop_assert_eq!(second.summary.copied, 0);
        prop_assert_eq!(second.summary.unchanged, tree.len());
    }

    #[test]
    fn prop_only_changed_files_are_copied(
        tree in tree_strategy(),
        changes in prop::collection::vec((any::<prop::sample::Index>(), prop::collection::vec(any::<u8>(), 0..500)), 0..5),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("src");
        let dest = temp_dir.path().join("dest");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();
        write_tree(&source, &tree).unwrap();
        backup_once(&source, &dest).unwrap();

        let names: Vec<&String> = tree.keys().collect();
        let mut updated = tree.clone();
        for (pick, content) in changes {
            let name = names[pick.index(names.len())];
            updated.insert(name.clone(), content);
        }
        write_tree(&source, &updated).unwrap();

        let expected = tree
            .iter()
            .filter(|(name, content)| updated[*name] != **content)
            .count();
        let outcome = backup_once(&source, &dest).unwrap();
        prop_assert_eq!(outcome.summary.copied, expected);

        // The index always reflects the current content
        let index = CatalogStore::open(&dest).unwrap().latest_index().unwrap();
        prop_assert_eq!(index.len(), tree.len());
        prop_assert!(Verifier::new().verify(&index).is_valid());
    }
}
