// Tests for indexer module
// Background reindex: completion, progress, cancellation and failure

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hashlookup::hash::{
    index_path_for, submit_reindex, Classification, HashDbError, HashSet, IndexState, LocalIndexedSet,
    ReindexStatus,
};
use tempfile::TempDir;

use crate::common::{md5, write_idx, ABC_MD5, EMPTY_MD5};

/// A source large enough that indexing spans several progress checkpoints
fn write_large_idx(dir: &Path, name: &str, count: u64) -> PathBuf {
    let path = dir.join(name);
    let mut content = String::with_capacity(count as usize * 40);
    for i in 0..count {
        writeln!(content, "{:032x}|generated", i * 7919 + 1).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

fn unbuilt_set(path: &Path, name: &str) -> Arc<HashSet> {
    let backend = LocalIndexedSet::open(path, None, false).unwrap();
    Arc::new(HashSet::new(name, Classification::Notable, Box::new(backend)))
}

#[test]
fn test_background_build_completes() {
    let dir = TempDir::new().unwrap();
    let path = write_idx(dir.path(), "small.idx", &[EMPTY_MD5, ABC_MD5]);
    let set = unbuilt_set(&path, "small");

    let handle = submit_reindex(Arc::clone(&set)).unwrap();
    assert_eq!(handle.set_name(), "small");
    handle.wait().unwrap();

    assert_eq!(set.state(), IndexState::Built);
    assert!(set.lookup_quick(&md5(ABC_MD5)).unwrap());
    assert!(index_path_for(&path).exists());
}

#[test]
fn test_poll_reports_completion_and_progress() {
    let dir = TempDir::new().unwrap();
    let path = write_large_idx(dir.path(), "large.idx", 25_000);
    let set = unbuilt_set(&path, "large");

    let mut handle = submit_reindex(Arc::clone(&set)).unwrap();
    while !handle.poll() {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(handle.status(), ReindexStatus::Built);
    assert!(handle.status().is_finished());
    let (records, _estimate) = handle.progress();
    assert_eq!(records, 25_000);
    handle.wait().unwrap();
    assert_eq!(set.entry_count(), Some(25_000));
}

#[test]
fn test_second_submit_while_building_is_busy() {
    let dir = TempDir::new().unwrap();
    let path = write_large_idx(dir.path(), "large.idx", 400_000);
    let set = unbuilt_set(&path, "large");

    let handle = submit_reindex(Arc::clone(&set)).unwrap();
    while handle.progress().0 == 0 && !handle.status().is_finished() {
        thread::sleep(Duration::from_millis(1));
    }
    if !handle.status().is_finished() {
        let err = submit_reindex(Arc::clone(&set)).err().unwrap();
        assert!(matches!(err, HashDbError::IndexBusy { ref set } if set == "large"));
    }
    handle.wait().unwrap();
    assert_eq!(set.state(), IndexState::Built);
}

#[test]
fn test_cancel_leaves_no_index() {
    let dir = TempDir::new().unwrap();
    let path = write_large_idx(dir.path(), "large.idx", 400_000);
    let set = unbuilt_set(&path, "large");

    let handle = submit_reindex(Arc::clone(&set)).unwrap();
    handle.cancel();
    let mut handle = handle;
    while !handle.poll() {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(handle.status(), ReindexStatus::Cancelled);
    let err = handle.wait().unwrap_err();
    assert!(matches!(err, HashDbError::Cancelled { .. }));

    assert!(!index_path_for(&path).exists());
    assert_eq!(set.state(), IndexState::Unbuilt);
}

#[test]
fn test_failed_build_reports_failure() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.hsh");
    fs::write(&path, format!("hash,file_name\n{},a\nzzzz,b\n", EMPTY_MD5)).unwrap();
    let set = unbuilt_set(&path, "broken");

    let mut handle = submit_reindex(Arc::clone(&set)).unwrap();
    while !handle.poll() {
        thread::sleep(Duration::from_millis(5));
    }
    match handle.status() {
        ReindexStatus::Failed(message) => assert!(!message.is_empty()),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(handle.wait().is_err());
    assert!(!set.is_valid());
    assert!(!index_path_for(&path).exists());
}
