//! Integration tests for keepsake
//!
//! End-to-end scenarios across backup runs, catalog replay, verification and
//! restore script synthesis.

use ::keepsake::report::REPORT_FILE;
use ::keepsake::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

/// Scratch layout shared by the scenarios
///
/// ```text
/// <tmp>/data       source tree
/// <tmp>/History    backup destination
/// <tmp>/restore    restore root
/// ```
struct TestHarness {
    _temp_dir: TempDir,
    source: PathBuf,
    dest: PathBuf,
    restore: PathBuf,
}

impl TestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("data");
        let dest = temp_dir.path().join("History");
        let restore = temp_dir.path().join("restore");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&dest).unwrap();

        Self {
            _temp_dir: temp_dir,
            source,
            dest,
            restore,
        }
    }

    fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.source.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn builder(&self) -> BackupEngineBuilder {
        BackupEngineBuilder::new()
            .sources(vec![self.source.clone()])
            .parallel_workers(4)
    }

    fn engine(&self) -> BackupEngine {
        self.builder().build(self.dest.clone()).unwrap()
    }

    fn catalog(&self) -> CatalogStore {
        CatalogStore::open(&self.dest).unwrap()
    }
}

#[test]
fn test_incremental_history_across_runs() {
    let h = TestHarness::new();
    let a = h.write("a.txt", "hello");
    let b = h.write("sub/b.txt", "world");
    let engine = h.engine();

    let first = engine.run().unwrap();
    assert_eq!(first.summary.copied, 2);

    h.write("a.txt", "hello again");
    let second = engine.run().unwrap();
    assert_eq!(second.summary.copied, 1);
    assert_eq!(second.summary.unchanged, 1);
    assert_eq!(second.run.records[0].source, a);

    let runs = h.catalog().read_all().unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs.iter().map(|r| r.records.len()).sum::<usize>(), 3);

    let index = h.catalog().latest_index().unwrap();
    assert_eq!(index.len(), 2);
    assert_eq!(index.get(&a).unwrap().run_id, second.run.run_id);
    assert_eq!(index.get(&b).unwrap().run_id, first.run.run_id);

    // The superseded copy is kept untouched
    let old_copy = &runs[0]
        .records
        .iter()
        .find(|r| r.source == a)
        .unwrap()
        .backup;
    assert_eq!(fs::read_to_string(old_copy).unwrap(), "hello");
    assert_eq!(
        fs::read_to_string(&index.get(&a).unwrap().backup).unwrap(),
        "hello again"
    );
}

#[test]
fn test_backup_is_idempotent() {
    let h = TestHarness::new();
    for i in 0..20 {
        h.write(&format!("dir{}/file{}.txt", i % 4, i), &format!("content {}", i));
    }
    let engine = h.engine();

    assert_eq!(engine.run().unwrap().summary.copied, 20);
    for _ in 0..2 {
        let again = engine.run().unwrap();
        assert_eq!(again.summary.copied, 0);
        assert_eq!(again.summary.unchanged, 20);
        assert!(again.run.is_empty());
    }
    // Empty runs are still appended
    assert_eq!(h.catalog().segments().unwrap().len(), 3);
    assert_eq!(h.catalog().latest_index().unwrap().len(), 20);
}

#[test]
fn test_backup_preserves_content_and_mtime() {
    let h = TestHarness::new();
    let path = h.write("photo.raw", "pixels");
    let mtime = filetime::FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(&path, mtime).unwrap();

    let outcome = h.engine().run().unwrap();
    let backup = &outcome.run.records[0].backup;
    assert!(backup.starts_with(h.dest.join(outcome.run.run_id.to_string())));
    assert_eq!(fs::read(backup).unwrap(), b"pixels");

    let copied = filetime::FileTime::from_last_modification_time(&fs::metadata(backup).unwrap());
    assert_eq!(copied.unix_seconds(), mtime.unix_seconds());
}

#[test]
fn test_verification_round_trip() {
    let h = TestHarness::new();
    h.write("a.txt", "hello");
    h.write("sub/b.txt", "world");
    h.write("sub/deeper/c.bin", "\u{0}\u{1}\u{2}");
    let engine = h.engine();
    engine.run().unwrap();

    let index = engine.catalog().latest_index().unwrap();
    let report = Verifier::new().verify(&index);
    assert_eq!(report.len(), 3);
    assert_eq!(report.verified_count(), 3);
    assert!(report.is_valid());
    assert_eq!(report.get(&h.source.join("a.txt")).unwrap().size, 5);
}

#[test]
fn test_corruption_is_detected_and_not_restored() {
    let h = TestHarness::new();
    let a = h.write("a.txt", "hello");
    h.write("b.txt", "world");
    let engine = h.engine();
    engine.run().unwrap();

    let index = engine.catalog().latest_index().unwrap();
    let corrupted = index.get(&a).unwrap().backup.clone();
    fs::write(&corrupted, "tampered").unwrap();

    let report = Verifier::new().verify(&index);
    assert!(!report.is_valid());
    let mismatched: Vec<_> = report.mismatched().collect();
    assert_eq!(mismatched.len(), 1);
    assert_eq!(mismatched[0].record.source, a);

    let synthesizer = RestoreSynthesizer::new(&h.restore).with_flavor(ScriptFlavor::Posix);
    let plan = synthesizer.plan(&index, &report);
    assert_eq!(plan.restorable_count(), 1);
    assert_eq!(plan.refused_count(), 1);

    let script = plan.render(ScriptFlavor::Posix);
    assert!(!script.contains(corrupted.to_str().unwrap()));
    assert!(script.contains("WARNING: not restoring"));
}

#[test]
fn test_missing_copy_is_refused() {
    let h = TestHarness::new();
    let a = h.write("a.txt", "hello");
    let engine = h.engine();
    engine.run().unwrap();

    let index = engine.catalog().latest_index().unwrap();
    fs::remove_file(&index.get(&a).unwrap().backup).unwrap();

    let report = Verifier::new().verify(&index);
    let entry = report.get(&a).unwrap();
    assert!(!entry.hash_match);
    assert_eq!(entry.size, 0);

    let plan = RestoreSynthesizer::new(&h.restore).plan(&index, &report);
    assert_eq!(plan.restorable_count(), 0);
}

#[cfg(unix)]
fn bash_available() -> bool {
    std::process::Command::new("bash")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(unix)]
fn run_script(script: &Path, answer: &str) -> std::process::Output {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new("bash")
        .arg(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(answer.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

#[cfg(unix)]
#[test]
fn test_posix_restore_end_to_end() {
    if !bash_available() {
        eprintln!("bash not available, skipping");
        return;
    }

    let h = TestHarness::new();
    h.write("a.txt", "hello");
    h.write("sub/b.txt", "world");
    h.write("with space/it's.txt", "quoted");
    let engine = h.engine();
    engine.run().unwrap();

    let index = engine.catalog().latest_index().unwrap();
    let report = Verifier::new().verify(&index);
    let script = h.dest.join(ScriptFlavor::Posix.file_name());
    let plan = RestoreSynthesizer::new(&h.restore)
        .with_flavor(ScriptFlavor::Posix)
        .write_script(&index, &report, &script)
        .unwrap();
    assert_eq!(plan.restorable_count(), 3);

    // Declining restores nothing
    let declined = run_script(&script, "n\n");
    assert_eq!(declined.status.code(), Some(1));
    assert!(!h.restore.exists());

    let accepted = run_script(&script, "y\n");
    assert!(
        accepted.status.success(),
        "restore failed: {}",
        String::from_utf8_lossy(&accepted.stderr)
    );
    let restored = h.restore.join("data");
    assert_eq!(fs::read_to_string(restored.join("a.txt")).unwrap(), "hello");
    assert_eq!(fs::read_to_string(restored.join("sub/b.txt")).unwrap(), "world");
    assert_eq!(
        fs::read_to_string(restored.join("with space/it's.txt")).unwrap(),
        "quoted"
    );
}

#[cfg(unix)]
#[test]
fn test_unreadable_file_fails_alone() {
    use std::os::unix::fs::PermissionsExt;

    let h = TestHarness::new();
    h.write("a.txt", "hello");
    let locked = h.write("locked.txt", "secret");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::File::open(&locked).is_ok() {
        // Running with privileges that ignore file modes
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
        return;
    }

    let engine = h.engine();
    let outcome = engine.run().unwrap();
    assert_eq!(outcome.summary.copied, 1);
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(outcome.failures[0].0, locked);
    assert_eq!(h.catalog().latest_index().unwrap().len(), 1);

    // Once readable again, the next run picks it up
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
    let retry = engine.run().unwrap();
    assert_eq!(retry.summary.copied, 1);
    assert_eq!(retry.summary.unchanged, 1);
}

#[test]
fn test_nested_and_duplicate_roots() {
    let h = TestHarness::new();
    h.write("a.txt", "hello");
    h.write("sub/b.txt", "world");

    let engine = BackupEngineBuilder::new()
        .sources(vec![
            h.source.clone(),
            h.source.join("sub"),
            h.source.clone(),
        ])
        .build(h.dest.clone())
        .unwrap();
    let outcome = engine.run().unwrap();

    assert_eq!(outcome.summary.copied, 2);
    assert_eq!(outcome.summary.duplicates, 3);
    assert_eq!(outcome.run.records.len(), 2);
}

#[test]
fn test_destination_inside_source_is_skipped() {
    let h = TestHarness::new();
    h.write("a.txt", "hello");
    let nested_dest = h.source.join("backups");
    fs::create_dir_all(&nested_dest).unwrap();

    let engine = h.builder().build(nested_dest.clone()).unwrap();
    assert_eq!(engine.run().unwrap().summary.copied, 1);

    // The first run's copies and segment are not backed up by the second
    let second = engine.run().unwrap();
    assert_eq!(second.summary.copied, 0);
    assert_eq!(second.summary.unchanged, 1);
}

#[test]
fn test_exclusions_prune_subtrees() {
    let h = TestHarness::new();
    h.write("keep/a.txt", "a");
    h.write("cache/b.txt", "b");
    h.write("cache/deep/c.txt", "c");

    let engine = h
        .builder()
        .exclusions(vec![h.source.join("cache")])
        .build(h.dest.clone())
        .unwrap();
    let outcome = engine.run().unwrap();

    assert_eq!(outcome.summary.copied, 1);
    assert_eq!(outcome.run.records[0].source, h.source.join("keep/a.txt"));
}

#[test]
fn test_cancelled_run_resumes_next_time() {
    let h = TestHarness::new();
    for i in 0..10 {
        h.write(&format!("f{}.txt", i), &i.to_string());
    }

    let cancel = CancelHandle::default();
    cancel.cancel();
    let cancelled = h
        .builder()
        .cancel_handle(cancel)
        .build(h.dest.clone())
        .unwrap()
        .run()
        .unwrap();
    assert!(cancelled.cancelled);
    assert_eq!(cancelled.summary.cancelled, 10);

    let resumed = h.engine().run().unwrap();
    assert!(!resumed.cancelled);
    assert_eq!(resumed.summary.copied, 10);
    assert_eq!(h.catalog().segments().unwrap().len(), 2);
}

#[test]
fn test_malformed_segment_keeps_valid_records() {
    let h = TestHarness::new();
    let fingerprint = "ab".repeat(32);
    let text = format!(
        "Source: /data/good.txt\nBackup: /History/2020-01-01_00h00m00s/data/good.txt\nFingerprint: {fp}\n\n\
         Source: /data/broken.txt\nFingerprint: {fp}\n\n\
         garbage line\n\n\
         Source: /data/also-good.txt\nBackup: /History/2020-01-01_00h00m00s/data/also-good.txt\nFingerprint: {fp}\n\n",
        fp = fingerprint
    );
    fs::write(
        h.dest.join("backup_database_2020-01-01_00h00m00s.txt"),
        text,
    )
    .unwrap();

    let runs = h.catalog().read_all().unwrap();
    assert_eq!(runs.len(), 1);
    let sources: Vec<_> = runs[0].records.iter().map(|r| r.source.clone()).collect();
    assert_eq!(
        sources,
        vec![
            PathBuf::from("/data/good.txt"),
            PathBuf::from("/data/also-good.txt")
        ]
    );
}

#[test]
fn test_new_run_after_hand_written_history() {
    let h = TestHarness::new();
    let a = h.write("a.txt", "hello");
    let engine = h.engine();
    engine.run().unwrap();

    // An older segment that claims a different fingerprint for the same
    // source does not override the newer record
    let stale = format!(
        "Source: {}\nBackup: /elsewhere/a.txt\nFingerprint: {}\n\n",
        a.display(),
        "0".repeat(64)
    );
    fs::write(h.dest.join("backup_database_2000-01-01_00h00m00s.txt"), stale).unwrap();

    let outcome = engine.run().unwrap();
    assert_eq!(outcome.summary.unchanged, 1);
}

#[test]
fn test_new_run_after_future_dated_history() {
    let h = TestHarness::new();
    let a = h.write("a.txt", "hello");
    let engine = h.engine();
    let first = engine.run().unwrap();

    // Simulate a clock that has since gone back: the existing run now sorts
    // after anything the clock can produce today
    let future: RunId = "2099-12-31_23h59m59s".parse().unwrap();
    let catalog = h.catalog();
    fs::rename(catalog.segment_path(&first.run.run_id), catalog.segment_path(&future)).unwrap();

    h.write("a.txt", "hello again");
    let second = engine.run().unwrap();
    assert_eq!(second.summary.copied, 1);
    assert!(second.run.run_id > future);

    let third = engine.run().unwrap();
    assert_eq!(third.summary.copied, 0);
    assert_eq!(third.summary.unchanged, 1);
    assert!(third.run.run_id > second.run.run_id);

    let index = catalog.latest_index().unwrap();
    let latest = index.get(&a).unwrap();
    assert_eq!(latest.run_id, second.run.run_id);
    assert_eq!(fs::read_to_string(&latest.backup).unwrap(), "hello again");
}

#[test]
fn test_colliding_roots_never_share_a_backup_path() {
    let temp_dir = TempDir::new().unwrap();
    let nested = temp_dir.path().join("home/x");
    let top = temp_dir.path().join("x");
    let dest = temp_dir.path().join("home/H");
    fs::create_dir_all(&nested).unwrap();
    fs::create_dir_all(&top).unwrap();
    fs::create_dir_all(&dest).unwrap();
    fs::write(nested.join("f"), "from home").unwrap();
    fs::write(top.join("f"), "from top").unwrap();

    // Both roots map to x/f inside the run directory
    let engine = BackupEngineBuilder::new()
        .sources(vec![nested.clone(), top.clone()])
        .parallel_workers(4)
        .build(dest.clone())
        .unwrap();

    let first = engine.run().unwrap();
    assert_eq!(first.summary.copied, 1);
    assert_eq!(first.summary.failed, 1);
    assert_eq!(first.failures[0].0, top.join("f"));
    assert_eq!(first.run.records.len(), 1);

    // Every record points at the content of its own source
    let index = engine.catalog().latest_index().unwrap();
    assert_eq!(index.len(), 1);
    let report = Verifier::new().verify(&index);
    assert_eq!(report.verified_count(), 1);
    let record = index.get(&nested.join("f")).unwrap();
    assert_eq!(fs::read_to_string(&record.backup).unwrap(), "from home");
    assert!(index.get(&top.join("f")).is_none());

    // The collision keeps being reported rather than passing as unchanged
    let second = engine.run().unwrap();
    assert_eq!(second.summary.unchanged, 1);
    assert_eq!(second.summary.failed, 1);
    assert_eq!(second.summary.copied, 0);
}

#[test]
fn test_concurrent_runs_are_serialized() {
    let h = TestHarness::new();
    for i in 0..30 {
        h.write(&format!("d{}/f{}.txt", i % 3, i), &format!("payload {}", i));
    }

    let engines: Vec<Arc<BackupEngine>> = (0..2).map(|_| Arc::new(h.engine())).collect();
    let handles: Vec<_> = engines
        .iter()
        .map(|engine| {
            let engine = Arc::clone(engine);
            thread::spawn(move || engine.run().unwrap())
        })
        .collect();
    let outcomes: Vec<BackupOutcome> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    // Whichever run took the lock second saw the first one's records
    let copied: usize = outcomes.iter().map(|o| o.summary.copied).sum();
    assert_eq!(copied, 30);
    assert_ne!(outcomes[0].run.run_id, outcomes[1].run.run_id);

    let runs = h.catalog().read_all().unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs.iter().map(|r| r.records.len()).sum::<usize>(), 30);
}

#[test]
fn test_history_report_lists_every_backup() {
    let h = TestHarness::new();
    let a = h.write("a.txt", "v1");
    h.write("b.txt", "stable");
    let engine = h.engine();
    engine.run().unwrap();
    h.write("a.txt", "v2");
    engine.run().unwrap();

    let runs = h.catalog().read_all().unwrap();
    let report = HistoryReport::build(&runs);
    assert_eq!(report.backup_count(), 3);
    assert_eq!(report.sources[&a].len(), 2);
    assert!(report.sources[&a].iter().all(|b| b.hash_match));

    let path = h.dest.join(REPORT_FILE);
    report.write(&path).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains(&format!("Source Location: {}", a.display())));
    assert!(text.contains("Backup 2 Location:"));
    assert!(text.contains("Hash Match: true"));

    let table = report.table().render(10);
    assert!(table.contains(&runs[0].run_id.to_string()));
    assert!(table.contains(&runs[1].run_id.to_string()));
}
