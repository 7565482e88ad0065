// Hash sets
// Named, classified hash collections over interchangeable storage backends

use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::error::HashDbError;
use super::index::{index_path_for, BuildProgress, CancelToken, IndexState, SortedIndex};
use super::kdb::KdbStore;
use super::parser::{is_compressed, HashSetParser, SourceFormat};
use super::record::{HashRecord, HitInfo, Md5Hash};

// Records between cancellation checks when copying from a parser
const CANCEL_CHECK_INTERVAL: usize = 10_000;
const ADD_RESERVE_LIMIT: u64 = 16 * 1024 * 1024;

/// How a file matching a hash set is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Benign files (operating system, application files)
    Known,
    /// Known-bad files
    Notable,
    /// Hits are recorded but never change a file's known status
    NoChange,
}

impl Classification {
    pub const ALL: [Classification; 3] = [
        Classification::Notable,
        Classification::NoChange,
        Classification::Known,
    ];

    /// Stable identifier, also used in official set file names
    pub fn identifier(&self) -> &'static str {
        match self {
            Classification::Known => "Known",
            Classification::Notable => "Notable",
            Classification::NoChange => "NoChange",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Classification::Known => "Known",
            Classification::Notable => "Notable",
            Classification::NoChange => "No Change",
        }
    }

    /// Whether hits may raise a user notification
    pub fn allows_inbox_messages(&self) -> bool {
        !matches!(self, Classification::Known)
    }

    pub fn default_notify(&self) -> bool {
        matches!(self, Classification::Notable)
    }

    pub fn from_identifier(identifier: &str) -> Option<Self> {
        Classification::ALL
            .into_iter()
            .find(|c| c.identifier().eq_ignore_ascii_case(identifier))
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    LocalIndexed,
    RemoteReference,
}

/// Read-only query surface of a built hash set
///
/// Handles are taken once per job; the local forms answer without locking.
pub trait HashLookup: Send + Sync {
    fn contains(&self, hash: &Md5Hash) -> Result<bool, HashDbError>;
    fn lookup(&self, hash: &Md5Hash) -> Result<Option<HitInfo>, HashDbError>;
}

impl HashLookup for SortedIndex {
    fn contains(&self, hash: &Md5Hash) -> Result<bool, HashDbError> {
        Ok(SortedIndex::contains(self, hash))
    }

    fn lookup(&self, hash: &Md5Hash) -> Result<Option<HitInfo>, HashDbError> {
        Ok(SortedIndex::lookup(self, hash))
    }
}

impl HashLookup for KdbStore {
    fn contains(&self, hash: &Md5Hash) -> Result<bool, HashDbError> {
        KdbStore::contains(self, hash)
    }

    fn lookup(&self, hash: &Md5Hash) -> Result<Option<HitInfo>, HashDbError> {
        KdbStore::lookup(self, hash)
    }
}

/// Storage contract every hash set backend implements in full
pub trait HashSetBackend: Send + Sync {
    fn storage_kind(&self) -> StorageKind;

    /// Last known state, without touching storage
    fn state(&self) -> IndexState;

    /// Re-check backing storage and return the resulting state
    fn refresh_state(&self) -> IndexState;

    /// Lookup handle, present only while the backend is usable
    fn reader(&self) -> Option<Arc<dyn HashLookup>>;

    fn is_updatable(&self) -> bool;

    fn add_records(&self, records: &[HashRecord]) -> Result<usize, HashDbError>;

    /// Rebuild whatever index the backend maintains
    fn rebuild(&self, cancel: &CancelToken, progress: Option<BuildProgress<'_>>) -> Result<(), HashDbError>;

    /// Files owned by the backend, for path uniqueness
    fn paths(&self) -> Vec<PathBuf>;

    /// Human readable location
    fn location(&self) -> String;

    fn entry_count(&self) -> Option<u64>;

    fn is_valid(&self) -> bool {
        self.refresh_state().is_usable()
    }

    fn lookup_quick(&self, hash: &Md5Hash) -> Result<bool, HashDbError> {
        match self.reader() {
            Some(reader) => reader.contains(hash),
            None => Err(HashDbError::IndexUnavailable {
                set: self.location(),
                reason: self.state().describe().to_string(),
            }),
        }
    }

    fn lookup_verbose(&self, hash: &Md5Hash) -> Result<Option<HitInfo>, HashDbError> {
        match self.reader() {
            Some(reader) => reader.lookup(hash),
            None => Err(HashDbError::IndexUnavailable {
                set: self.location(),
                reason: self.state().describe().to_string(),
            }),
        }
    }
}

struct LocalState {
    state: IndexState,
    index: Option<Arc<SortedIndex>>,
}

/// Clears the building flag even if a build panics
struct BuildFlag<'a>(&'a AtomicBool);

impl Drop for BuildFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A flat-file hash set with a sorted index beside it
///
/// Index-only sets have no source and cannot be rebuilt.
pub struct LocalIndexedSet {
    source: Option<PathBuf>,
    format: SourceFormat,
    index_path: PathBuf,
    read_only: bool,
    inner: RwLock<LocalState>,
    building: AtomicBool,
}

impl LocalIndexedSet {
    /// Attach to a source (or prebuilt index) and load any existing index
    ///
    /// A missing source is not an error: the set comes up `Invalid` so it
    /// can be relocated or reindexed later.
    pub fn open(path: &Path, format: Option<SourceFormat>, read_only: bool) -> Result<Self, HashDbError> {
        let format = match format {
            Some(format) => format,
            None => SourceFormat::detect(path)?,
        };
        let (source, index_path) = match format {
            SourceFormat::IndexOnly => (None, path.to_path_buf()),
            _ => (Some(path.to_path_buf()), index_path_for(path)),
        };

        let set = Self {
            source,
            format,
            index_path,
            read_only,
            inner: RwLock::new(LocalState {
                state: IndexState::Unbuilt,
                index: None,
            }),
            building: AtomicBool::new(false),
        };
        set.load_existing_index();
        Ok(set)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    fn read(&self) -> RwLockReadGuard<'_, LocalState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LocalState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// The index is out of date when its source still exists and changed
    fn is_stale(&self, index: &SortedIndex) -> bool {
        self.source
            .as_deref()
            .filter(|s| s.exists())
            .map(|s| index.is_stale_for(s))
            .unwrap_or(false)
    }

    fn load_existing_index(&self) {
        let mut guard = self.write();
        if !self.index_path.exists() {
            guard.state = match &self.source {
                Some(source) if source.exists() => IndexState::Unbuilt,
                _ => IndexState::Invalid,
            };
            guard.index = None;
            return;
        }
        match SortedIndex::open(&self.index_path) {
            Ok(index) if self.is_stale(&index) => {
                tracing::warn!(index = %self.index_path.display(), "hash set index is out of date");
                guard.state = IndexState::Stale;
                guard.index = None;
            }
            Ok(index) => {
                guard.state = IndexState::Built;
                guard.index = Some(Arc::new(index));
            }
            Err(e) => {
                tracing::warn!(index = %self.index_path.display(), error = %e, "failed to open hash set index");
                guard.state = IndexState::Invalid;
                guard.index = None;
            }
        }
    }

    fn append_to_source(&self, source: &Path, records: &[HashRecord]) -> Result<(), HashDbError> {
        let io_err = |e: std::io::Error| HashDbError::from_io_error(e, "appending to", Some(source.to_path_buf()));
        let mut file = OpenOptions::new().read(true).append(true).open(source).map_err(io_err)?;

        // The last line may lack a terminator
        let len = file.metadata().map_err(io_err)?.len();
        let mut needs_newline = false;
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1)).map_err(io_err)?;
            file.read_exact(&mut last).map_err(io_err)?;
            needs_newline = last[0] != b'\n';
        }

        let mut writer = BufWriter::new(file);
        if needs_newline {
            writeln!(writer).map_err(io_err)?;
        }
        for record in records {
            writeln!(writer, "{}", record.md5).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)
    }
}

impl HashSetBackend for LocalIndexedSet {
    fn storage_kind(&self) -> StorageKind {
        StorageKind::LocalIndexed
    }

    fn state(&self) -> IndexState {
        self.read().state
    }

    fn refresh_state(&self) -> IndexState {
        let mut guard = self.write();
        if guard.state != IndexState::Built {
            return guard.state;
        }
        if !self.index_path.exists() {
            tracing::warn!(index = %self.index_path.display(), "hash set index has disappeared");
            guard.state = IndexState::Invalid;
            guard.index = None;
        } else if guard.index.as_deref().map(|i| self.is_stale(i)).unwrap_or(true) {
            guard.state = IndexState::Stale;
            guard.index = None;
        }
        guard.state
    }

    fn reader(&self) -> Option<Arc<dyn HashLookup>> {
        let guard = self.read();
        if guard.state != IndexState::Built {
            return None;
        }
        let index = guard.index.clone()?;
        let reader: Arc<dyn HashLookup> = index;
        Some(reader)
    }

    /// Only plain line-based sources can be appended to
    fn is_updatable(&self) -> bool {
        !self.read_only
            && self.format == SourceFormat::LineHex
            && self.source.as_deref().map(|s| !is_compressed(s)).unwrap_or(false)
    }

    fn add_records(&self, records: &[HashRecord]) -> Result<usize, HashDbError> {
        let source = match (&self.source, self.is_updatable()) {
            (Some(source), true) => source,
            _ => {
                return Err(HashDbError::NotUpdatable {
                    set: self.location(),
                })
            }
        };
        if self.building.load(Ordering::SeqCst) {
            return Err(HashDbError::IndexBusy {
                set: self.location(),
            });
        }
        if records.is_empty() {
            return Ok(0);
        }

        self.append_to_source(source, records)?;

        // Appends take effect on the next reindex
        let mut guard = self.write();
        if guard.state == IndexState::Built {
            guard.state = IndexState::Stale;
            guard.index = None;
        }
        Ok(records.len())
    }

    fn rebuild(&self, cancel: &CancelToken, progress: Option<BuildProgress<'_>>) -> Result<(), HashDbError> {
        let source = self.source.as_deref().ok_or_else(|| HashDbError::IndexUnavailable {
            set: self.location(),
            reason: "an index-only hash set has no source to rebuild from".to_string(),
        })?;
        if self
            .building
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HashDbError::IndexBusy {
                set: self.location(),
            });
        }
        let _flag = BuildFlag(&self.building);

        let (previous_state, previous_index) = {
            let mut guard = self.write();
            let previous = (guard.state, guard.index.take());
            guard.state = IndexState::Building;
            previous
        };

        tracing::info!(source = %source.display(), index = %self.index_path.display(), "indexing hash set");
        let result = HashSetParser::open_as(source, self.format)
            .and_then(|mut parser| SortedIndex::build(&mut parser, &self.index_path, cancel, progress));

        let mut guard = self.write();
        match result {
            Ok(index) => {
                tracing::info!(index = %self.index_path.display(), entries = index.len(), "hash set indexed");
                guard.state = IndexState::Built;
                guard.index = Some(Arc::new(index));
                Ok(())
            }
            Err(e @ HashDbError::Cancelled { .. }) => {
                guard.state = previous_state;
                guard.index = previous_index;
                Err(e)
            }
            Err(e) => {
                tracing::error!(source = %source.display(), error = %e, "failed to index hash set");
                guard.state = if previous_state == IndexState::Unbuilt {
                    IndexState::Unbuilt
                } else {
                    IndexState::Invalid
                };
                guard.index = None;
                Err(e)
            }
        }
    }

    fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.source.iter().cloned().collect();
        paths.push(self.index_path.clone());
        paths
    }

    fn location(&self) -> String {
        self.source
            .as_deref()
            .unwrap_or(&self.index_path)
            .display()
            .to_string()
    }

    fn entry_count(&self) -> Option<u64> {
        self.read().index.as_ref().map(|i| i.len() as u64)
    }
}

/// A hash set stored in an SQLite database, indexed by its unique `md5` column
pub struct KdbSet {
    path: PathBuf,
    read_only: bool,
    store: RwLock<Option<Arc<KdbStore>>>,
}

impl KdbSet {
    pub fn open(path: &Path, read_only: bool) -> Result<Self, HashDbError> {
        let store = KdbStore::open(path, read_only)?;
        Ok(Self {
            path: path.to_path_buf(),
            read_only,
            store: RwLock::new(Some(Arc::new(store))),
        })
    }

    pub fn create(path: &Path) -> Result<Self, HashDbError> {
        let store = KdbStore::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            read_only: false,
            store: RwLock::new(Some(Arc::new(store))),
        })
    }

    /// A configured database that could not be opened; reported as invalid
    pub fn unavailable(path: &Path, read_only: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            read_only,
            store: RwLock::new(None),
        }
    }

    fn current(&self) -> Option<Arc<KdbStore>> {
        self.store.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl HashSetBackend for KdbSet {
    fn storage_kind(&self) -> StorageKind {
        StorageKind::LocalIndexed
    }

    fn state(&self) -> IndexState {
        match self.current() {
            Some(_) => IndexState::Built,
            None => IndexState::Invalid,
        }
    }

    fn refresh_state(&self) -> IndexState {
        if !self.path.exists() {
            let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
            if store.take().is_some() {
                tracing::warn!(path = %self.path.display(), "hash database has disappeared");
            }
        }
        self.state()
    }

    fn reader(&self) -> Option<Arc<dyn HashLookup>> {
        let store = self.current()?;
        let reader: Arc<dyn HashLookup> = store;
        Some(reader)
    }

    fn is_updatable(&self) -> bool {
        !self.read_only && self.current().is_some()
    }

    fn add_records(&self, records: &[HashRecord]) -> Result<usize, HashDbError> {
        match self.current() {
            Some(store) if !self.read_only => store.add_records(records),
            Some(_) => Err(HashDbError::NotUpdatable {
                set: self.location(),
            }),
            None => Err(HashDbError::IndexUnavailable {
                set: self.location(),
                reason: IndexState::Invalid.describe().to_string(),
            }),
        }
    }

    /// Reopen the database; the unique index is maintained by SQLite
    fn rebuild(&self, _cancel: &CancelToken, _progress: Option<BuildProgress<'_>>) -> Result<(), HashDbError> {
        let reopened = KdbStore::open(&self.path, self.read_only)?;
        *self.store.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(reopened));
        Ok(())
    }

    fn paths(&self) -> Vec<PathBuf> {
        vec![self.path.clone()]
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn entry_count(&self) -> Option<u64> {
        self.current().and_then(|store| store.count().ok())
    }
}

/// A configured hash set
///
/// Two sets are equal when name and classification match, whatever backs them.
pub struct HashSet {
    name: String,
    classification: Classification,
    search_enabled: bool,
    notify_on_hit: bool,
    official: bool,
    backend: Box<dyn HashSetBackend>,
}

impl HashSet {
    pub fn new(name: impl Into<String>, classification: Classification, backend: Box<dyn HashSetBackend>) -> Self {
        Self {
            name: name.into(),
            classification,
            search_enabled: true,
            notify_on_hit: classification.default_notify(),
            official: false,
            backend,
        }
    }

    pub fn with_search_enabled(mut self, enabled: bool) -> Self {
        self.search_enabled = enabled;
        self
    }

    /// Notification is forced off for classifications that never notify
    pub fn with_notify_on_hit(mut self, notify: bool) -> Self {
        self.notify_on_hit = notify && self.classification.allows_inbox_messages();
        self
    }

    /// Mark as an officially distributed set: read-only, searched, silent
    pub fn into_official(mut self) -> Self {
        self.official = true;
        self.search_enabled = true;
        self.notify_on_hit = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn search_enabled(&self) -> bool {
        self.search_enabled
    }

    pub fn notify_on_hit(&self) -> bool {
        self.notify_on_hit
    }

    pub fn is_official(&self) -> bool {
        self.official
    }

    pub fn backend(&self) -> &dyn HashSetBackend {
        self.backend.as_ref()
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.backend.storage_kind()
    }

    pub fn state(&self) -> IndexState {
        self.backend.state()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.backend.paths()
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    pub fn entry_count(&self) -> Option<u64> {
        self.backend.entry_count()
    }

    /// Checks backing storage; invalid sets are excluded from lookups
    pub fn is_valid(&self) -> bool {
        self.backend.is_valid()
    }

    pub fn is_updatable(&self) -> bool {
        !self.official && self.backend.is_updatable()
    }

    /// Lookup handle for a job snapshot
    pub fn reader(&self) -> Result<Arc<dyn HashLookup>, HashDbError> {
        self.backend.reader().ok_or_else(|| HashDbError::IndexUnavailable {
            set: self.name.clone(),
            reason: self.backend.state().describe().to_string(),
        })
    }

    pub fn lookup_quick(&self, hash: &Md5Hash) -> Result<bool, HashDbError> {
        self.backend.lookup_quick(hash).map_err(|e| self.relabel(e))
    }

    pub fn lookup_verbose(&self, hash: &Md5Hash) -> Result<Option<HitInfo>, HashDbError> {
        self.backend.lookup_verbose(hash).map_err(|e| self.relabel(e))
    }

    pub fn add_records(&self, records: &[HashRecord]) -> Result<usize, HashDbError> {
        if !self.is_updatable() {
            return Err(HashDbError::NotUpdatable {
                set: self.name.clone(),
            });
        }
        self.backend.add_records(records).map_err(|e| self.relabel(e))
    }

    /// Copy every record of a parsed source into this set
    ///
    /// The whole source is parsed before anything is written, so a malformed
    /// record or a cancellation leaves the set unchanged.
    pub fn add_from_parser(&self, parser: &mut HashSetParser, cancel: &CancelToken) -> Result<usize, HashDbError> {
        if !self.is_updatable() {
            return Err(HashDbError::NotUpdatable {
                set: self.name.clone(),
            });
        }
        let cancelled = || HashDbError::Cancelled {
            operation: format!("Adding hashes to '{}'", self.name),
        };

        let mut records = Vec::with_capacity(parser.estimated_count().min(ADD_RESERVE_LIMIT) as usize);
        while let Some(record) = parser.next_record()? {
            records.push(record);
            if records.len() % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                parser.close();
                return Err(cancelled());
            }
        }
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        self.add_records(&records)
    }

    pub fn reindex(&self, cancel: &CancelToken, progress: Option<BuildProgress<'_>>) -> Result<(), HashDbError> {
        self.backend.rebuild(cancel, progress).map_err(|e| self.relabel(e))
    }

    /// Report backend errors under the set's configured name
    fn relabel(&self, err: HashDbError) -> HashDbError {
        match err {
            HashDbError::IndexUnavailable { reason, .. } => HashDbError::IndexUnavailable {
                set: self.name.clone(),
                reason,
            },
            HashDbError::IndexBusy { .. } => HashDbError::IndexBusy {
                set: self.name.clone(),
            },
            HashDbError::NotUpdatable { .. } => HashDbError::NotUpdatable {
                set: self.name.clone(),
            },
            other => other,
        }
    }
}

impl PartialEq for HashSet {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.classification == other.classification
    }
}

impl Eq for HashSet {}

impl std::hash::Hash for HashSet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.classification.hash(state);
    }
}

impl fmt::Debug for HashSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashSet")
            .field("name", &self.name)
            .field("classification", &self.classification)
            .field("location", &self.backend.location())
            .field("state", &self.backend.state())
            .field("official", &self.official)
            .finish()
    }
}
