// Tests for parser module
// One file per source format, written to a scratch directory

use std::fs;
use std::io::Write;

use hashlookup::hash::{HashDbError, HashSetParser, KdbStore, HashRecord, SourceFormat};
use tempfile::TempDir;

use crate::common::{encase_bytes, md5, ABC_MD5, EMPTY_MD5, HELLO_MD5};

#[test]
fn test_encase_single_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.hash");
    let hash = [
        0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8, 0x42, 0x7e,
    ];
    fs::write(&path, encase_bytes(&[hash])).unwrap();

    let mut parser = HashSetParser::open(&path).unwrap();
    assert_eq!(parser.format(), SourceFormat::EncaseBinary);
    assert_eq!(parser.estimated_count(), 1);
    assert!(parser.has_more());

    let record = parser.next_record().unwrap().unwrap();
    assert_eq!(record.md5.to_hex(), EMPTY_MD5);
    assert!(record.comment.is_none());

    assert!(parser.next_record().unwrap().is_none());
    assert!(!parser.has_more());
    assert_eq!(parser.records_read(), 1);
}

#[test]
fn test_encase_bad_magic_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.hash");
    let mut bytes = encase_bytes(&[[0u8; 16]]);
    bytes[0] = b'X';
    fs::write(&path, bytes).unwrap();

    match HashSetParser::open(&path) {
        Err(HashDbError::ParseError { record, .. }) => assert_eq!(record, 0),
        other => panic!("expected ParseError, got {:?}", other.map(|p| p.format())),
    }
}

#[test]
fn test_encase_truncated_record_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.hash");
    let mut bytes = encase_bytes(&[[1u8; 16], [2u8; 16]]);
    bytes.truncate(bytes.len() - 10);
    fs::write(&path, bytes).unwrap();

    let mut parser = HashSetParser::open(&path).unwrap();
    assert!(parser.next_record().unwrap().is_some());
    let err = parser.next_record().unwrap_err();
    assert!(matches!(err, HashDbError::ParseError { record: 2, .. }));
    // A failed parser stays finished
    assert!(parser.next_record().unwrap().is_none());
}

#[test]
fn test_hashkeeper_with_comment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.hsh");
    fs::write(&path, format!("id,hash,comment\n1,{},test\n", EMPTY_MD5)).unwrap();

    let records: Vec<HashRecord> = HashSetParser::open(&path)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].md5.to_hex(), EMPTY_MD5);
    assert_eq!(records[0].comment.as_deref(), Some("test"));
}

#[test]
fn test_hashkeeper_missing_hash_column() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.csv");
    fs::write(&path, format!("id,md5,comment\n1,{},test\n", EMPTY_MD5)).unwrap();

    let err = HashSetParser::open(&path).map(|_| ()).unwrap_err();
    assert!(matches!(err, HashDbError::ParseError { .. }));
    assert!(err.to_string().contains("'hash'"));
}

#[test]
fn test_hashkeeper_bad_row_is_fatal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.hsh");
    fs::write(
        &path,
        format!("hash,comment\n{},ok\nnot-a-hash,bad\n{},never\n", EMPTY_MD5, ABC_MD5),
    )
    .unwrap();

    let result: Result<Vec<HashRecord>, HashDbError> = HashSetParser::open(&path).unwrap().collect();
    let err = result.unwrap_err();
    assert!(matches!(err, HashDbError::ParseError { record: 3, .. }));
}

#[test]
fn test_hashkeeper_sha256_secondary() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.hsh");
    let sha = "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
    fs::write(&path, format!("hash,sha256\n{},{}\n", EMPTY_MD5, sha)).unwrap();

    let record = HashSetParser::open(&path).unwrap().next_record().unwrap().unwrap();
    assert_eq!(record.secondary.as_deref(), Some(sha.to_ascii_lowercase().as_str()));
}

#[test]
fn test_nsrl_layout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("NSRLFile.txt");
    fs::write(
        &path,
        format!(
            "\"SHA-1\",\"MD5\",\"CRC32\",\"FileName\",\"FileSize\",\"ProductCode\",\"OpSystemCode\",\"SpecialCode\"\n\
             \"DA39A3EE5E6B4B0D3255BFEF95601890AFD80709\",\"{}\",\"00000000\",\"empty.txt\",0,1,\"WIN\",\"\"\n",
            EMPTY_MD5.to_ascii_uppercase()
        ),
    )
    .unwrap();

    // .txt would be detected as line-based; NSRL is always selected explicitly
    let mut parser = HashSetParser::open_as(&path, SourceFormat::Nsrl).unwrap();
    let record = parser.next_record().unwrap().unwrap();
    assert_eq!(record.md5.to_hex(), EMPTY_MD5);
    assert_eq!(record.comment.as_deref(), Some("empty.txt"));
    assert!(parser.next_record().unwrap().is_none());
}

#[test]
fn test_idx_is_permissive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.idx");
    let content = format!(
        "# exported hash list\n\n{}|file one\nnot a hash line\n{} file two\n\n{}\nzz41d8cd98f00b204e9800998ecf8427e|bad\n",
        EMPTY_MD5,
        ABC_MD5.to_ascii_uppercase(),
        HELLO_MD5
    );
    fs::write(&path, content).unwrap();

    let records: Vec<HashRecord> = HashSetParser::open(&path)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let hashes: Vec<String> = records.iter().map(|r| r.md5.to_hex()).collect();
    assert_eq!(hashes, vec![EMPTY_MD5, ABC_MD5, HELLO_MD5]);
}

#[test]
fn test_idx_xz_compressed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.idx.xz");
    let file = fs::File::create(&path).unwrap();
    let mut encoder = xz2::write::XzEncoder::new(file, 6);
    writeln!(encoder, "{}|a", EMPTY_MD5).unwrap();
    writeln!(encoder, "{}|b", ABC_MD5).unwrap();
    encoder.finish().unwrap();

    let parser = HashSetParser::open(&path).unwrap();
    assert_eq!(parser.format(), SourceFormat::LineHex);
    assert_eq!(parser.count(), 2);
}

#[test]
fn test_kdb_source() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.kdb");
    let store = KdbStore::create(&path).unwrap();
    store
        .add_records(&[
            HashRecord::new(md5(EMPTY_MD5)),
            HashRecord::new(md5(ABC_MD5)).with_comment("abc"),
        ])
        .unwrap();
    drop(store);

    let parser = HashSetParser::open(&path).unwrap();
    assert_eq!(parser.format(), SourceFormat::Kdb);
    assert_eq!(parser.estimated_count(), 2);
    let mut hashes: Vec<String> = parser.map(|r| r.unwrap().md5.to_hex()).collect();
    hashes.sort();
    assert_eq!(hashes, vec![ABC_MD5.to_string(), EMPTY_MD5.to_string()]);
}

#[test]
fn test_kdb_source_reads_non_positive_rowids() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("imported.kdb");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE hashes (id INTEGER PRIMARY KEY, md5 BLOB NOT NULL UNIQUE);")
        .unwrap();
    for (id, hash) in [(-5i64, EMPTY_MD5), (0, ABC_MD5), (7, HELLO_MD5)] {
        conn.execute(
            "INSERT INTO hashes (id, md5) VALUES (?1, ?2)",
            rusqlite::params![id, &md5(hash).as_bytes()[..]],
        )
        .unwrap();
    }
    drop(conn);

    let parser = HashSetParser::open(&path).unwrap();
    let hashes: Vec<String> = parser.map(|r| r.unwrap().md5.to_hex()).collect();
    assert_eq!(
        hashes,
        vec![EMPTY_MD5.to_string(), ABC_MD5.to_string(), HELLO_MD5.to_string()]
    );
}

#[test]
fn test_unknown_extension() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("set.bin");
    fs::write(&path, b"data").unwrap();
    assert!(matches!(
        HashSetParser::open(&path).map(|_| ()),
        Err(HashDbError::UnsupportedFormat { .. })
    ));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing.idx");
    assert!(matches!(
        HashSetParser::open(&path).map(|_| ()),
        Err(HashDbError::FileNotFound { .. })
    ));
}
