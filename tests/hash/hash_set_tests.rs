// Tests for hash_set module
// Backend state transitions, updates and the remote reference set backend

use std::collections::HashSet as StdHashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashlookup::hash::remote::RemoteError;
use hashlookup::hash::{
    index_path_for, CancelToken, Classification, HashDbError, HashRecord, HashSet, HashSetBackend, HashSetParser,
    HitInfo, IndexState, KdbSet, LocalIndexedSet, Md5Hash, ReferenceSetId, RemoteReferenceClient,
    RemoteReferenceSet, SourceFormat, StorageKind,
};
use tempfile::TempDir;

use crate::common::{indexed_set, md5, write_idx, ABC_MD5, EMPTY_MD5, HELLO_MD5};

#[test]
fn test_unbuilt_until_indexed() {
    let dir = TempDir::new().unwrap();
    let path = write_idx(dir.path(), "set.idx", &[EMPTY_MD5]);
    let set = HashSet::new(
        "set",
        Classification::Known,
        Box::new(LocalIndexedSet::open(&path, None, false).unwrap()),
    );

    assert_eq!(set.state(), IndexState::Unbuilt);
    assert!(!set.is_valid());
    assert!(set.lookup_quick(&md5(EMPTY_MD5)).unwrap_err().is_unavailable());

    set.reindex(&CancelToken::new(), None).unwrap();
    assert_eq!(set.state(), IndexState::Built);
    assert!(set.is_valid());
    assert!(set.lookup_quick(&md5(EMPTY_MD5)).unwrap());
    assert!(!set.lookup_quick(&md5(ABC_MD5)).unwrap());
    assert_eq!(set.entry_count(), Some(1));
}

#[test]
fn test_existing_index_is_loaded() {
    let dir = TempDir::new().unwrap();
    let first = indexed_set(dir.path(), "set", Classification::Notable, &[EMPTY_MD5, ABC_MD5]);
    drop(first);

    let path = dir.path().join("set.idx");
    let backend = LocalIndexedSet::open(&path, None, true).unwrap();
    assert_eq!(backend.state(), IndexState::Built);
    assert_eq!(backend.index_path(), index_path_for(&path).as_path());
    assert_eq!(backend.entry_count(), Some(2));
}

#[test]
fn test_deleted_index_becomes_invalid() {
    let dir = TempDir::new().unwrap();
    let set = indexed_set(dir.path(), "set", Classification::Notable, &[EMPTY_MD5]);
    assert!(set.is_valid());

    fs::remove_file(index_path_for(&dir.path().join("set.idx"))).unwrap();
    assert!(!set.is_valid());
    assert_eq!(set.state(), IndexState::Invalid);
    let err = set.lookup_verbose(&md5(EMPTY_MD5)).unwrap_err();
    assert!(matches!(err, HashDbError::IndexUnavailable { ref set, .. } if set == "set"));
}

#[test]
fn test_missing_source_is_invalid_but_openable() {
    let dir = TempDir::new().unwrap();
    let backend = LocalIndexedSet::open(&dir.path().join("moved.idx"), None, false).unwrap();
    assert_eq!(backend.state(), IndexState::Invalid);
    assert!(!backend.is_valid());
}

#[test]
fn test_index_only_set() {
    let dir = TempDir::new().unwrap();
    indexed_set(dir.path(), "set", Classification::Known, &[HELLO_MD5]);
    let source = dir.path().join("set.idx");
    let index = index_path_for(&source);
    fs::remove_file(&source).unwrap();

    let backend = LocalIndexedSet::open(&index, None, true).unwrap();
    assert_eq!(backend.format(), SourceFormat::IndexOnly);
    assert!(backend.source().is_none());
    assert!(backend.is_valid());
    assert!(backend.lookup_quick(&md5(HELLO_MD5)).unwrap());
    assert!(!backend.is_updatable());

    let err = backend.rebuild(&CancelToken::new(), None).unwrap_err();
    assert!(err.is_unavailable());
}

#[test]
fn test_append_marks_stale_until_reindex() {
    let dir = TempDir::new().unwrap();
    let set = indexed_set(dir.path(), "set", Classification::Notable, &[EMPTY_MD5]);
    assert!(set.is_updatable());

    set.add_records(&[HashRecord::new(md5(ABC_MD5))]).unwrap();
    assert_eq!(set.state(), IndexState::Stale);
    assert!(!set.is_valid());

    set.reindex(&CancelToken::new(), None).unwrap();
    assert!(set.lookup_quick(&md5(ABC_MD5)).unwrap());
    assert!(set.lookup_quick(&md5(EMPTY_MD5)).unwrap());
}

#[test]
fn test_append_after_unterminated_last_line() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.idx");
    fs::write(&path, EMPTY_MD5).unwrap();
    let set = HashSet::new(
        "set",
        Classification::Notable,
        Box::new(LocalIndexedSet::open(&path, None, false).unwrap()),
    );
    set.reindex(&CancelToken::new(), None).unwrap();

    set.add_records(&[HashRecord::new(md5(ABC_MD5))]).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), format!("{}\n{}\n", EMPTY_MD5, ABC_MD5));

    set.reindex(&CancelToken::new(), None).unwrap();
    assert!(set.lookup_quick(&md5(EMPTY_MD5)).unwrap());
    assert!(set.lookup_quick(&md5(ABC_MD5)).unwrap());
    assert_eq!(set.entry_count(), Some(2));
}

#[test]
fn test_non_line_sources_are_not_updatable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.hsh");
    fs::write(&path, format!("hash\n{}\n", EMPTY_MD5)).unwrap();
    let set = HashSet::new(
        "keeper",
        Classification::Notable,
        Box::new(LocalIndexedSet::open(&path, None, false).unwrap()),
    );
    assert!(!set.is_updatable());
    let err = set.add_records(&[HashRecord::new(md5(ABC_MD5))]).unwrap_err();
    assert!(matches!(err, HashDbError::NotUpdatable { ref set } if set == "keeper"));
}

#[test]
fn test_failed_reindex_reports_and_stays_unbuilt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.hsh");
    fs::write(&path, "hash\nnot-a-hash\n").unwrap();
    let set = HashSet::new(
        "broken",
        Classification::Known,
        Box::new(LocalIndexedSet::open(&path, None, false).unwrap()),
    );

    let err = set.reindex(&CancelToken::new(), None).unwrap_err();
    assert!(matches!(err, HashDbError::ParseError { .. }));
    assert_eq!(set.state(), IndexState::Unbuilt);
    assert!(!index_path_for(&path).exists());
}

#[test]
fn test_kdb_set_add_from_parser() {
    let dir = TempDir::new().unwrap();
    let source = write_idx(dir.path(), "import.idx", &[EMPTY_MD5, ABC_MD5, HELLO_MD5]);
    let set = HashSet::new(
        "custom",
        Classification::Notable,
        Box::new(KdbSet::create(&dir.path().join("custom.kdb")).unwrap()),
    );
    assert!(set.is_valid());
    assert!(set.is_updatable());

    let mut parser = HashSetParser::open(&source).unwrap();
    let added = set.add_from_parser(&mut parser, &CancelToken::new()).unwrap();
    assert_eq!(added, 3);
    // Database sets are searchable immediately
    assert!(set.lookup_quick(&md5(HELLO_MD5)).unwrap());
    assert_eq!(set.entry_count(), Some(3));
}

/// Hashkeeper source with `valid` good rows followed by one malformed row
fn keeper_with_bad_tail(dir: &std::path::Path, valid: u64) -> std::path::PathBuf {
    let path = dir.join("bulk.hsh");
    let mut content = String::from("hash,file_name\n");
    for i in 0..valid {
        content.push_str(&format!("{:032x},file{}\n", i + 1, i));
    }
    content.push_str("not-a-hash,broken\n");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_add_from_parser_is_all_or_nothing() {
    let dir = TempDir::new().unwrap();
    let source = keeper_with_bad_tail(dir.path(), 25_000);
    let set = HashSet::new(
        "custom",
        Classification::Notable,
        Box::new(KdbSet::create(&dir.path().join("custom.kdb")).unwrap()),
    );

    let mut parser = HashSetParser::open(&source).unwrap();
    let err = set.add_from_parser(&mut parser, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, HashDbError::ParseError { .. }));
    assert_eq!(set.entry_count(), Some(0));
    assert!(!set.lookup_quick(&md5("00000000000000000000000000000001")).unwrap());
}

#[test]
fn test_cancelled_add_from_parser_adds_nothing() {
    let dir = TempDir::new().unwrap();
    let hashes: Vec<String> = (1..=25_000u64).map(|i| format!("{:032x}", i)).collect();
    let refs: Vec<&str> = hashes.iter().map(|s| s.as_str()).collect();
    let source = write_idx(dir.path(), "bulk.idx", &refs);
    let set = HashSet::new(
        "custom",
        Classification::Notable,
        Box::new(KdbSet::create(&dir.path().join("custom.kdb")).unwrap()),
    );

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut parser = HashSetParser::open(&source).unwrap();
    let err = set.add_from_parser(&mut parser, &cancel).unwrap_err();
    assert!(matches!(err, HashDbError::Cancelled { .. }));
    assert_eq!(set.entry_count(), Some(0));
}

#[test]
fn test_kdb_set_deleted_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.kdb");
    let set = HashSet::new("custom", Classification::Known, Box::new(KdbSet::create(&path).unwrap()));
    assert!(set.is_valid());

    fs::remove_file(&path).unwrap();
    assert!(!set.is_valid());
    assert!(set.lookup_quick(&md5(EMPTY_MD5)).unwrap_err().is_unavailable());
}

#[test]
fn test_official_set_is_never_updatable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.kdb");
    let set = HashSet::new("custom", Classification::Notable, Box::new(KdbSet::create(&path).unwrap()))
        .into_official();
    assert!(set.is_official());
    assert!(!set.is_updatable());
    assert!(!set.notify_on_hit());
    assert!(set.add_records(&[HashRecord::new(md5(EMPTY_MD5))]).is_err());
}

#[test]
fn test_notify_defaults_per_classification() {
    let dir = TempDir::new().unwrap();
    let known = indexed_set(dir.path(), "k", Classification::Known, &[EMPTY_MD5]).with_notify_on_hit(true);
    let notable = indexed_set(dir.path(), "n", Classification::Notable, &[EMPTY_MD5]);
    let no_change = indexed_set(dir.path(), "c", Classification::NoChange, &[EMPTY_MD5]);
    assert!(!known.notify_on_hit());
    assert!(notable.notify_on_hit());
    assert!(!no_change.notify_on_hit());
}

#[test]
fn test_identity_is_name_and_classification() {
    let dir = TempDir::new().unwrap();
    let sub = dir.path().join("other");
    fs::create_dir(&sub).unwrap();
    let a = indexed_set(dir.path(), "bad", Classification::Notable, &[EMPTY_MD5]);
    let b = indexed_set(&sub, "bad", Classification::Notable, &[ABC_MD5]);
    let c = indexed_set(&sub, "good", Classification::Notable, &[ABC_MD5]);
    assert_eq!(a, b);
    assert_ne!(a, c);

    let mut seen = StdHashSet::new();
    assert!(seen.insert(a));
    assert!(!seen.insert(b));
}

/// Reference set service stand-in backed by a fixed hash list
struct FakeReferenceService {
    hashes: Vec<Md5Hash>,
    online: AtomicBool,
}

impl RemoteReferenceClient for FakeReferenceService {
    fn exists(&self, hash: &Md5Hash, _set_id: i64) -> Result<bool, RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        Ok(self.hashes.contains(hash))
    }

    fn lookup(&self, hash: &Md5Hash, set_id: i64) -> Result<Option<HitInfo>, RemoteError> {
        Ok(self.exists(hash, set_id)?.then(|| HitInfo::new(*hash)))
    }

    fn add(&self, _records: &[HashRecord], _set_id: i64) -> Result<usize, RemoteError> {
        Err("read only service".into())
    }

    fn is_available(&self, _set_id: i64) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[test]
fn test_remote_reference_set() {
    let service = Arc::new(FakeReferenceService {
        hashes: vec![md5(EMPTY_MD5)],
        online: AtomicBool::new(true),
    });
    let reference = ReferenceSetId {
        id: 7,
        version: "2.1".to_string(),
    };
    let backend = RemoteReferenceSet::new(service.clone(), reference, true);
    assert_eq!(backend.storage_kind(), StorageKind::RemoteReference);
    assert!(backend.is_valid());
    assert!(!backend.is_updatable());
    assert!(backend.location().contains('7'));

    let set = HashSet::new("remote", Classification::Notable, Box::new(backend));
    assert!(set.lookup_quick(&md5(EMPTY_MD5)).unwrap());
    assert!(set.lookup_verbose(&md5(ABC_MD5)).unwrap().is_none());

    service.online.store(false, Ordering::SeqCst);
    assert!(set.lookup_quick(&md5(EMPTY_MD5)).unwrap_err().is_unavailable());
    assert!(!set.is_valid());
}
