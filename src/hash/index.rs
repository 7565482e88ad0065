// Sorted hash index
// Builds a deduplicated, byte-ordered table of MD5 keys and answers lookups by binary search

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use memmap2::Mmap;
use rayon::prelude::*;

use super::error::HashDbError;
use super::parser::HashSetParser;
use super::record::{HashRecord, HitInfo, Md5Hash};

/// File magic of a persisted index
pub const INDEX_MAGIC: [u8; 8] = *b"HSIDX\0\0\x01";
const INDEX_VERSION: u32 = 1;

// Header layout (64 bytes, little endian)
//  0  8  magic
//  8  4  version
// 12  4  reserved
// 16  8  entry count
// 24  8  source length at build time
// 32  8  source mtime at build time (nanoseconds since the epoch)
// 40  8  comment blob offset
// 48 16  reserved
const HEADER_SIZE: usize = 64;
const HEADER_OFF_VERSION: usize = 8;
const HEADER_OFF_COUNT: usize = 16;
const HEADER_OFF_SOURCE_LEN: usize = 24;
const HEADER_OFF_SOURCE_MTIME: usize = 32;
const HEADER_OFF_COMMENTS: usize = 40;

// Entry: 16 byte md5, u32 comment offset, u32 comment length
const ENTRY_SIZE: usize = 24;

// Records between cancellation checks and progress callbacks
const PROGRESS_INTERVAL: usize = 10_000;

/// Lifecycle of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// No index has been built yet
    Unbuilt,
    /// A build is running; lookups report unavailable
    Building,
    /// Ready for lookups
    Built,
    /// The source changed after the index was built
    Stale,
    /// The backing index is missing or corrupt
    Invalid,
}

impl IndexState {
    pub fn is_usable(&self) -> bool {
        *self == IndexState::Built
    }

    pub fn describe(&self) -> &'static str {
        match self {
            IndexState::Unbuilt => "not indexed",
            IndexState::Building => "indexing in progress",
            IndexState::Built => "indexed",
            IndexState::Stale => "index out of date",
            IndexState::Invalid => "index missing or corrupt",
        }
    }
}

/// Cooperative cancellation flag shared with a running build
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Size and modification time of a source when its index was built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceStamp {
    pub len: u64,
    /// Nanoseconds since the epoch, so same-second rewrites are still seen
    pub mtime: i64,
}

impl SourceStamp {
    pub fn of(path: &Path) -> Result<Self, HashDbError> {
        let metadata = fs::metadata(path).map_err(|e| {
            HashDbError::from_io_error(e, "reading metadata", Some(path.to_path_buf()))
        })?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
            .unwrap_or(0);
        Ok(Self {
            len: metadata.len(),
            mtime,
        })
    }
}

/// Index path for a source file: `<source>-md5.hsi`
pub fn index_path_for(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(super::parser::INDEX_SUFFIX);
    PathBuf::from(name)
}

/// Progress callback: records consumed so far and the parser's estimate
pub type BuildProgress<'a> = &'a (dyn Fn(usize, u64) + Sync);

/// Accumulates records before sorting them into an index
#[derive(Debug, Default)]
pub struct IndexBuilder {
    entries: Vec<(Md5Hash, Option<String>)>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: HashRecord) {
        self.entries.push((record.md5, record.comment));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain a parser into the builder, checking for cancellation as it goes
    ///
    /// Any parse error aborts the whole pass.
    pub fn extend_from_parser(
        &mut self,
        parser: &mut HashSetParser,
        cancel: &CancelToken,
        progress: Option<BuildProgress<'_>>,
    ) -> Result<(), HashDbError> {
        let estimate = parser.estimated_count();
        self.entries
            .reserve(estimate.min(64 * 1024 * 1024) as usize);

        while let Some(record) = parser.next_record()? {
            self.push(record);
            if self.entries.len() % PROGRESS_INTERVAL == 0 {
                if cancel.is_cancelled() {
                    parser.close();
                    return Err(HashDbError::Cancelled {
                        operation: format!("Indexing {}", parser.path().display()),
                    });
                }
                if let Some(progress) = progress {
                    progress(self.entries.len(), estimate);
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(HashDbError::Cancelled {
                operation: format!("Indexing {}", parser.path().display()),
            });
        }
        if let Some(progress) = progress {
            progress(self.entries.len(), estimate);
        }
        Ok(())
    }

    /// Sort by raw key bytes and drop duplicate keys, keeping the first seen
    fn into_sorted(mut self) -> Vec<(Md5Hash, Option<String>)> {
        // Stable sort keeps source order among equal keys
        self.entries.par_sort_by(|a, b| a.0.cmp(&b.0));
        self.entries.dedup_by(|later, first| later.0 == first.0);
        self.entries
    }

    /// Finish into an index held in memory
    pub fn finish_in_memory(self) -> Result<SortedIndex, HashDbError> {
        let bytes = encode(&self.into_sorted(), SourceStamp::default())?;
        SortedIndex::from_bytes(None, IndexData::Owned(bytes))
    }

    /// Persist the index and open it
    ///
    /// The file is written under a temporary name and renamed into place, so a
    /// failed build never leaves a partial index behind.
    pub fn write_to(self, path: &Path, stamp: SourceStamp) -> Result<SortedIndex, HashDbError> {
        let bytes = encode(&self.into_sorted(), stamp)?;

        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let write_result = (|| -> Result<(), HashDbError> {
            let file = File::create(&tmp_path).map_err(|e| {
                HashDbError::from_io_error(e, "creating index", Some(tmp_path.clone()))
            })?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&bytes).map_err(|e| {
                HashDbError::from_io_error(e, "writing index", Some(tmp_path.clone()))
            })?;
            let file = writer.into_inner().map_err(|e| {
                HashDbError::from_io_error(e.into_error(), "writing index", Some(tmp_path.clone()))
            })?;
            file.sync_all().map_err(|e| {
                HashDbError::from_io_error(e, "syncing index", Some(tmp_path.clone()))
            })?;
            fs::rename(&tmp_path, path).map_err(|e| {
                HashDbError::from_io_error(e, "installing index", Some(path.to_path_buf()))
            })
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        SortedIndex::open(path)
    }
}

/// Serialize sorted entries into the on-disk layout
fn encode(entries: &[(Md5Hash, Option<String>)], stamp: SourceStamp) -> Result<Vec<u8>, HashDbError> {
    let comment_bytes: usize = entries
        .iter()
        .filter_map(|(_, c)| c.as_ref().map(|c| c.len()))
        .sum();
    if comment_bytes > u32::MAX as usize {
        return Err(HashDbError::IndexCorrupt {
            path: PathBuf::from("<index>"),
            reason: "comment data exceeds 4 GiB".to_string(),
        });
    }

    let comments_offset = HEADER_SIZE + entries.len() * ENTRY_SIZE;
    let mut out = Vec::with_capacity(comments_offset + comment_bytes);

    out.extend_from_slice(&INDEX_MAGIC);
    out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    out.extend_from_slice(&stamp.len.to_le_bytes());
    out.extend_from_slice(&stamp.mtime.to_le_bytes());
    out.extend_from_slice(&(comments_offset as u64).to_le_bytes());
    out.extend_from_slice(&[0u8; 16]);

    let mut blob_len: u32 = 0;
    for (md5, comment) in entries {
        let len = comment.as_ref().map(|c| c.len() as u32).unwrap_or(0);
        out.extend_from_slice(md5.as_bytes());
        out.extend_from_slice(&blob_len.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        blob_len += len;
    }
    for comment in entries.iter().filter_map(|(_, c)| c.as_ref()) {
        out.extend_from_slice(comment.as_bytes());
    }
    Ok(out)
}

enum IndexData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl IndexData {
    fn as_slice(&self) -> &[u8] {
        match self {
            IndexData::Mapped(mmap) => &mmap[..],
            IndexData::Owned(bytes) => bytes,
        }
    }
}

/// An immutable, sorted MD5 index
///
/// Safe to share between threads; lookups take no locks.
pub struct SortedIndex {
    path: Option<PathBuf>,
    data: IndexData,
    count: usize,
    comments_offset: usize,
    stamp: SourceStamp,
}

impl std::fmt::Debug for SortedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedIndex")
            .field("path", &self.path)
            .field("count", &self.count)
            .finish()
    }
}

impl SortedIndex {
    /// Parse, sort and persist a whole source in one call
    pub fn build(
        parser: &mut HashSetParser,
        index_path: &Path,
        cancel: &CancelToken,
        progress: Option<BuildProgress<'_>>,
    ) -> Result<SortedIndex, HashDbError> {
        let stamp = SourceStamp::of(parser.path())?;
        let mut builder = IndexBuilder::new();
        builder.extend_from_parser(parser, cancel, progress)?;
        tracing::info!(
            source = %parser.path().display(),
            records = builder.len(),
            "sorting hash set records"
        );
        builder.write_to(index_path, stamp)
    }

    /// Build an in-memory index from records
    pub fn from_records<I>(records: I) -> Result<SortedIndex, HashDbError>
    where
        I: IntoIterator<Item = HashRecord>,
    {
        let mut builder = IndexBuilder::new();
        for record in records {
            builder.push(record);
        }
        builder.finish_in_memory()
    }

    /// Open and validate a persisted index
    pub fn open(path: &Path) -> Result<SortedIndex, HashDbError> {
        let file = File::open(path).map_err(|e| {
            HashDbError::from_io_error(e, "opening index", Some(path.to_path_buf()))
        })?;
        let len = file
            .metadata()
            .map_err(|e| HashDbError::from_io_error(e, "reading index metadata", Some(path.to_path_buf())))?
            .len();
        if (len as usize) < HEADER_SIZE {
            return Err(HashDbError::IndexCorrupt {
                path: path.to_path_buf(),
                reason: "file is shorter than the index header".to_string(),
            });
        }
        // The index is never written in place once installed
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            HashDbError::from_io_error(e, "mapping index", Some(path.to_path_buf()))
        })?;
        SortedIndex::from_bytes(Some(path.to_path_buf()), IndexData::Mapped(mmap))
    }

    fn from_bytes(path: Option<PathBuf>, data: IndexData) -> Result<SortedIndex, HashDbError> {
        let bytes = data.as_slice();
        let corrupt = |reason: &str| HashDbError::IndexCorrupt {
            path: path.clone().unwrap_or_else(|| PathBuf::from("<memory>")),
            reason: reason.to_string(),
        };

        if bytes.len() < HEADER_SIZE || bytes[..8] != INDEX_MAGIC {
            return Err(corrupt("bad magic"));
        }
        if read_u32(bytes, HEADER_OFF_VERSION) != INDEX_VERSION {
            return Err(corrupt("unsupported index version"));
        }
        let count = read_u64(bytes, HEADER_OFF_COUNT) as usize;
        let comments_offset = read_u64(bytes, HEADER_OFF_COMMENTS) as usize;
        let expected_offset = count
            .checked_mul(ENTRY_SIZE)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or_else(|| corrupt("entry count overflows"))?;
        if comments_offset != expected_offset || comments_offset > bytes.len() {
            return Err(corrupt("entry table does not match file length"));
        }

        let stamp = SourceStamp {
            len: read_u64(bytes, HEADER_OFF_SOURCE_LEN),
            mtime: read_u64(bytes, HEADER_OFF_SOURCE_MTIME) as i64,
        };

        Ok(SortedIndex {
            path,
            data,
            count,
            comments_offset,
            stamp,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn source_stamp(&self) -> SourceStamp {
        self.stamp
    }

    /// Whether `source` changed since this index was built from it
    pub fn is_stale_for(&self, source: &Path) -> bool {
        match SourceStamp::of(source) {
            Ok(current) => current != self.stamp,
            Err(_) => true,
        }
    }

    /// Existence check
    pub fn contains(&self, hash: &Md5Hash) -> bool {
        self.find(hash).is_some()
    }

    /// Existence check plus the stored comment
    pub fn lookup(&self, hash: &Md5Hash) -> Option<HitInfo> {
        let i = self.find(hash)?;
        let mut hit = HitInfo::new(*hash);
        if let Some(comment) = self.comment_at(i) {
            hit.comments.push(comment.to_string());
        }
        Some(hit)
    }

    /// Iterate all keys in sorted order with their comments
    pub fn iter(&self) -> impl Iterator<Item = (Md5Hash, Option<&str>)> + '_ {
        (0..self.count).map(move |i| (self.key_at(i), self.comment_at(i)))
    }

    fn entry(&self, i: usize) -> &[u8] {
        let start = HEADER_SIZE + i * ENTRY_SIZE;
        &self.data.as_slice()[start..start + ENTRY_SIZE]
    }

    fn key_at(&self, i: usize) -> Md5Hash {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&self.entry(i)[..16]);
        Md5Hash::from_bytes(raw)
    }

    fn comment_at(&self, i: usize) -> Option<&str> {
        let entry = self.entry(i);
        let offset = read_u32(entry, 16) as usize;
        let len = read_u32(entry, 20) as usize;
        if len == 0 {
            return None;
        }
        let start = self.comments_offset.checked_add(offset)?;
        let bytes = self.data.as_slice().get(start..start.checked_add(len)?)?;
        std::str::from_utf8(bytes).ok()
    }

    fn find(&self, hash: &Md5Hash) -> Option<usize> {
        let key = hash.as_bytes();
        let (mut lo, mut hi) = (0usize, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.entry(mid)[..16].cmp(&key[..]) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(mid),
            }
        }
        None
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}
