// Shared fixtures for hash set tests

use std::fs;
use std::path::{Path, PathBuf};

use hashlookup::hash::{Classification, HashSet, LocalIndexedSet, Md5Hash, CancelToken};

/// MD5 of the empty string
pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";
/// MD5 of "abc"
pub const ABC_MD5: &str = "900150983cd24fb0d6963f7d28e17f72";
/// MD5 of "hello world"
pub const HELLO_MD5: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

pub fn md5(hex: &str) -> Md5Hash {
    Md5Hash::from_hex(hex).unwrap()
}

/// Write an IDX source with one hash per line
pub fn write_idx(dir: &Path, name: &str, hashes: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut content = String::new();
    for hash in hashes {
        content.push_str(hash);
        content.push_str("|entry\n");
    }
    fs::write(&path, content).unwrap();
    path
}

/// An indexed flat-file set ready for lookups
pub fn indexed_set(dir: &Path, name: &str, classification: Classification, hashes: &[&str]) -> HashSet {
    let path = write_idx(dir, &format!("{}.idx", name), hashes);
    let backend = LocalIndexedSet::open(&path, None, false).unwrap();
    let set = HashSet::new(name, classification, Box::new(backend));
    set.reindex(&CancelToken::new(), None).unwrap();
    set
}

/// Build a minimal EnCase hash set holding the given raw hashes
pub fn encase_bytes(hashes: &[[u8; 16]]) -> Vec<u8> {
    let mut bytes = vec![
        0x48, 0x41, 0x53, 0x48, 0x0d, 0x0a, 0xff, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    ];
    bytes.extend_from_slice(&(hashes.len() as u32).to_le_bytes());
    bytes.extend(std::iter::repeat(0u8).take(0x3f4 + 0x50 + 0x28));
    for hash in hashes {
        bytes.extend_from_slice(hash);
        bytes.extend_from_slice(&[0x0d, 0x0a]);
    }
    bytes
}
