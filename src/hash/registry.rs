// Hash set registry
// Owns the configured hash sets, enforces uniqueness and hands out per-job snapshots

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::config::{HashLookupSettings, HashSetInfo};
use super::error::HashDbError;
use super::hash_set::{Classification, HashLookup, HashSet, HashSetBackend, KdbSet, LocalIndexedSet};
use super::index::{BuildProgress, CancelToken};
use super::indexer::{submit_reindex, ReindexHandle};
use super::kdb::KDB_EXTENSION;
use super::parser::SourceFormat;
use super::record::{HitInfo, Md5Hash};
use super::remote::{ReferenceSetId, RemoteReferenceClient, RemoteReferenceSet};

/// Appended to a configured set name that collides with an official set
pub const CUSTOM_SUFFIX: &str = " (Custom)";

/// Per-set options when adding a hash set
#[derive(Debug, Clone)]
pub struct SetOptions {
    pub format: Option<SourceFormat>,
    pub read_only: bool,
    pub search_enabled: bool,
    /// Defaults per classification when absent
    pub notify_on_hit: Option<bool>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            format: None,
            read_only: false,
            search_enabled: true,
            notify_on_hit: None,
        }
    }
}

/// A configured set that failed to load at startup
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub name: String,
    pub error: String,
}

/// Aggregate outcome of loading the registry
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub official: usize,
    pub failures: Vec<LoadFailure>,
    /// Configured sets renamed to avoid an official set's name: (old, new)
    pub renamed: Vec<(String, String)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Entry {
    set: Arc<HashSet>,
    // None for official sets, which are discovered rather than configured
    info: Option<HashSetInfo>,
}

/// The set of configured hash sets
pub struct HashSetRegistry {
    entries: Vec<Entry>,
    // Configured entries that could not be loaded; kept so saving preserves them
    unloaded: Vec<HashSetInfo>,
    settings_path: Option<PathBuf>,
    official_dir: Option<PathBuf>,
    remote_client: Option<Arc<dyn RemoteReferenceClient>>,
    autosave: bool,
    active_jobs: Arc<AtomicUsize>,
}

impl Default for HashSetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HashSetRegistry {
    /// An empty registry that persists nothing until a settings path is set
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            unloaded: Vec::new(),
            settings_path: None,
            official_dir: None,
            remote_client: None,
            autosave: true,
            active_jobs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn with_official_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.official_dir = Some(dir.into());
        self
    }

    pub fn with_remote_client(mut self, client: Arc<dyn RemoteReferenceClient>) -> Self {
        self.remote_client = Some(client);
        self
    }

    /// Save after every add and remove (the default)
    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    pub fn settings_path(&self) -> Option<&Path> {
        self.settings_path.as_deref()
    }

    /// Load official sets, then the configured sets from the settings file
    ///
    /// Individual set failures are collected in the report; only an unreadable
    /// settings file fails the whole load.
    pub fn load(&mut self) -> Result<LoadReport, HashDbError> {
        let mut report = LoadReport::default();

        if let Some(dir) = self.official_dir.clone() {
            self.load_official_sets(&dir, &mut report);
        }

        let settings = match &self.settings_path {
            Some(path) => HashLookupSettings::load(path)?,
            None => HashLookupSettings::default(),
        };

        for mut info in settings.hash_sets {
            let original = info.name.clone();
            while self.is_official_name(&info.name) {
                info.name.push_str(CUSTOM_SUFFIX);
            }
            if info.name != original {
                tracing::info!(from = %original, to = %info.name, "renamed hash set that conflicts with an official set");
                report.renamed.push((original, info.name.clone()));
            }

            match self.load_configured(&info) {
                Ok(set) => {
                    if !set.is_valid() {
                        tracing::warn!(set = %set.name(), location = %set.location(), state = ?set.state(), "hash set is not usable until relocated or reindexed");
                    }
                    self.entries.push(Entry {
                        set: Arc::new(set),
                        info: Some(info),
                    });
                    report.loaded += 1;
                }
                Err(e) => {
                    tracing::error!(set = %info.name, error = %e, "failed to load hash set");
                    report.failures.push(LoadFailure {
                        name: info.name.clone(),
                        error: e.to_string(),
                    });
                    self.unloaded.push(info);
                }
            }
        }

        if !report.renamed.is_empty() && self.autosave {
            self.save()?;
        }
        Ok(report)
    }

    /// Register every `<name>.<Identifier>.kdb` in `dir` as a read-only official set
    fn load_official_sets(&mut self, dir: &Path, report: &mut LoadReport) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot read official hash set folder");
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        paths.sort();

        for path in paths {
            let (name, classification) = match parse_official_name(&path) {
                Some(parsed) => parsed,
                None => continue,
            };
            if self.find(&name).is_some() {
                report.failures.push(LoadFailure {
                    name: name.clone(),
                    error: HashDbError::DuplicateSetName { name }.to_string(),
                });
                continue;
            }
            match KdbSet::open(&path, true) {
                Ok(backend) => {
                    let set = HashSet::new(name, classification, Box::new(backend)).into_official();
                    tracing::debug!(set = %set.name(), path = %path.display(), "loaded official hash set");
                    self.entries.push(Entry {
                        set: Arc::new(set),
                        info: None,
                    });
                    report.official += 1;
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to load official hash set");
                    report.failures.push(LoadFailure {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    fn is_official_name(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.set.is_official() && e.set.name() == name)
    }

    /// Build a set from a settings entry; missing local files come up invalid
    fn load_configured(&self, info: &HashSetInfo) -> Result<HashSet, HashDbError> {
        let backend: Box<dyn HashSetBackend> = if let Some(id) = info.reference_set_id {
            let client = self.remote_client.clone().ok_or_else(|| HashDbError::IndexUnavailable {
                set: info.name.clone(),
                reason: "no reference set service is configured".to_string(),
            })?;
            let reference = ReferenceSetId {
                id,
                version: info.version.clone(),
            };
            Box::new(RemoteReferenceSet::new(client, reference, info.read_only))
        } else {
            let path = info.path.as_deref().ok_or_else(|| HashDbError::ConfigError {
                path: self.settings_path.clone().unwrap_or_default(),
                reason: format!("hash set '{}' has neither a path nor a reference set id", info.name),
            })?;
            open_local_backend(path, info.format, info.read_only, true)?
        };

        Ok(HashSet::new(info.name.clone(), info.classification, backend)
            .with_search_enabled(info.search_enabled)
            .with_notify_on_hit(info.notify()))
    }

    /// Reject a name or any backing path already in use
    fn check_collision(&self, name: &str, paths: &[PathBuf]) -> Result<(), HashDbError> {
        let wanted: Vec<PathBuf> = paths.iter().map(|p| normalize(p)).collect();
        for entry in &self.entries {
            for path in entry.set.paths() {
                let existing = normalize(&path);
                if let Some(clash) = wanted.iter().find(|w| **w == existing) {
                    return Err(HashDbError::DuplicateSetPath { path: clash.clone() });
                }
            }
        }
        if self.find(name).is_some() || self.unloaded.iter().any(|i| i.name == name) {
            return Err(HashDbError::DuplicateSetName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn register(&mut self, set: HashSet, info: HashSetInfo) -> Result<Arc<HashSet>, HashDbError> {
        let set = Arc::new(set);
        self.entries.push(Entry {
            set: Arc::clone(&set),
            info: Some(info),
        });
        tracing::info!(set = %set.name(), classification = %set.classification(), location = %set.location(), "added hash set");
        if self.autosave {
            self.save()?;
        }
        Ok(set)
    }

    fn info_for(name: &str, classification: Classification, path: &Path, options: &SetOptions) -> HashSetInfo {
        let mut info = HashSetInfo::local(name, classification, path);
        info.format = options.format;
        info.read_only = options.read_only;
        info.search_enabled = options.search_enabled;
        info.notify_on_hit = options.notify_on_hit;
        info
    }

    fn build_set(name: &str, classification: Classification, backend: Box<dyn HashSetBackend>, info: &HashSetInfo) -> HashSet {
        HashSet::new(name, classification, backend)
            .with_search_enabled(info.search_enabled)
            .with_notify_on_hit(info.notify())
    }

    /// Add a hash set file that already exists, without indexing it
    pub fn add_existing(
        &mut self,
        name: &str,
        path: &Path,
        classification: Classification,
        options: SetOptions,
    ) -> Result<Arc<HashSet>, HashDbError> {
        if !path.exists() {
            return Err(HashDbError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let backend = open_local_backend(path, options.format, options.read_only, false)?;
        self.check_collision(name, &backend.paths())?;

        let info = Self::info_for(name, classification, path, &options);
        let set = Self::build_set(name, classification, backend, &info);
        self.register(set, info)
    }

    /// Parse and index a hash set file, then add it
    ///
    /// Nothing is registered unless the whole source parses and indexes.
    pub fn import(
        &mut self,
        name: &str,
        path: &Path,
        classification: Classification,
        options: SetOptions,
        cancel: &CancelToken,
        progress: Option<BuildProgress<'_>>,
    ) -> Result<Arc<HashSet>, HashDbError> {
        if !path.exists() {
            return Err(HashDbError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let backend = open_local_backend(path, options.format, options.read_only, false)?;
        self.check_collision(name, &backend.paths())?;

        let info = Self::info_for(name, classification, path, &options);
        let set = Self::build_set(name, classification, backend, &info);
        if !set.is_valid() {
            set.reindex(cancel, progress)?;
        }
        self.register(set, info)
    }

    /// Create a new, empty, updatable `.kdb` hash set
    pub fn create_new(
        &mut self,
        name: &str,
        path: &Path,
        classification: Classification,
        options: SetOptions,
    ) -> Result<Arc<HashSet>, HashDbError> {
        let is_kdb = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(KDB_EXTENSION))
            .unwrap_or(false);
        if !is_kdb {
            return Err(HashDbError::UnsupportedFormat {
                path: path.to_path_buf(),
            });
        }
        if path.exists() {
            return Err(HashDbError::DuplicateSetPath {
                path: path.to_path_buf(),
            });
        }
        self.check_collision(name, &[path.to_path_buf()])?;

        let backend = KdbSet::create(path)?;
        let mut options = options;
        options.format = Some(SourceFormat::Kdb);
        options.read_only = false;
        let info = Self::info_for(name, classification, path, &options);
        let set = Self::build_set(name, classification, Box::new(backend), &info);
        self.register(set, info)
    }

    /// Add a set hosted by the reference set service
    ///
    /// Adding a set equal to one already configured returns the existing set.
    pub fn add_remote(
        &mut self,
        name: &str,
        classification: Classification,
        reference: ReferenceSetId,
        options: SetOptions,
    ) -> Result<Arc<HashSet>, HashDbError> {
        if let Some(existing) = self
            .entries
            .iter()
            .find(|e| e.set.name() == name && e.set.classification() == classification)
        {
            return Ok(Arc::clone(&existing.set));
        }
        let client = self.remote_client.clone().ok_or_else(|| HashDbError::IndexUnavailable {
            set: name.to_string(),
            reason: "no reference set service is configured".to_string(),
        })?;
        self.check_collision(name, &[])?;

        let backend = RemoteReferenceSet::new(client, reference.clone(), options.read_only);
        if !backend.is_valid() {
            return Err(HashDbError::IndexUnavailable {
                set: name.to_string(),
                reason: format!("reference set {} was not found", reference.id),
            });
        }
        let mut info = HashSetInfo::remote(name, classification, reference.id, reference.version);
        info.read_only = options.read_only;
        info.search_enabled = options.search_enabled;
        info.notify_on_hit = options.notify_on_hit;
        let set = Self::build_set(name, classification, Box::new(backend), &info);
        self.register(set, info)
    }

    /// Remove a configured set; refused while any job holds a snapshot
    pub fn remove(&mut self, name: &str) -> Result<(), HashDbError> {
        if self.active_jobs.load(Ordering::SeqCst) > 0 {
            return Err(HashDbError::ConcurrentModificationDenied {
                set: name.to_string(),
            });
        }
        if let Some(pos) = self.unloaded.iter().position(|i| i.name == name) {
            self.unloaded.remove(pos);
            tracing::info!(set = %name, "removed unloaded hash set");
            if self.autosave {
                self.save()?;
            }
            return Ok(());
        }
        let pos = self
            .entries
            .iter()
            .position(|e| e.set.name() == name)
            .ok_or_else(|| HashDbError::SetNotFound {
                name: name.to_string(),
            })?;
        if self.entries[pos].set.is_official() {
            return Err(HashDbError::OfficialSetLocked {
                set: name.to_string(),
            });
        }

        self.entries.remove(pos);
        tracing::info!(set = %name, "removed hash set");
        if self.autosave {
            self.save()?;
        }
        Ok(())
    }

    /// Persist the configured (non-official) sets
    pub fn save(&self) -> Result<(), HashDbError> {
        let path = match &self.settings_path {
            Some(path) => path,
            None => return Ok(()),
        };
        let settings = HashLookupSettings {
            hash_sets: self
                .entries
                .iter()
                .filter_map(|e| e.info.clone())
                .chain(self.unloaded.iter().cloned())
                .collect(),
        };
        settings.save(path)
    }

    pub fn find(&self, name: &str) -> Option<Arc<HashSet>> {
        self.entries
            .iter()
            .find(|e| e.set.name() == name)
            .map(|e| Arc::clone(&e.set))
    }

    /// All sets in configuration order
    pub fn all_sets(&self) -> Vec<Arc<HashSet>> {
        self.entries.iter().map(|e| Arc::clone(&e.set)).collect()
    }

    pub fn sets_of(&self, classification: Classification) -> Vec<Arc<HashSet>> {
        self.entries
            .iter()
            .filter(|e| e.set.classification() == classification)
            .map(|e| Arc::clone(&e.set))
            .collect()
    }

    pub fn known_sets(&self) -> Vec<Arc<HashSet>> {
        self.sets_of(Classification::Known)
    }

    pub fn notable_sets(&self) -> Vec<Arc<HashSet>> {
        self.sets_of(Classification::Notable)
    }

    pub fn no_change_sets(&self) -> Vec<Arc<HashSet>> {
        self.sets_of(Classification::NoChange)
    }

    /// Sets that accept new hashes
    pub fn updatable_sets(&self) -> Vec<Arc<HashSet>> {
        self.entries
            .iter()
            .filter(|e| e.set.is_updatable())
            .map(|e| Arc::clone(&e.set))
            .collect()
    }

    /// Configured entries that failed to load
    pub fn unloaded(&self) -> &[HashSetInfo] {
        &self.unloaded
    }

    /// True when every configured set loaded and is usable
    pub fn verify_all_loaded_correctly(&self) -> bool {
        self.unloaded.is_empty() && self.entries.iter().all(|e| e.set.is_valid())
    }

    /// Start background reindexing of a set
    pub fn reindex(&self, name: &str) -> Result<ReindexHandle, HashDbError> {
        let set = self.find(name).ok_or_else(|| HashDbError::SetNotFound {
            name: name.to_string(),
        })?;
        submit_reindex(set)
    }

    /// Capture the searchable, valid sets for one ingestion job
    ///
    /// Removal is refused until the returned guard is dropped.
    pub fn begin_job(&self) -> (JobSnapshot, JobGuard) {
        let snapshot = JobSnapshot::from_sets(
            self.entries
                .iter()
                .filter(|e| e.set.search_enabled())
                .map(|e| Arc::clone(&e.set)),
        );
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        let guard = JobGuard {
            active: Arc::clone(&self.active_jobs),
        };
        (snapshot, guard)
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }
}

/// Marks a running job; dropping it releases the registry for changes
pub struct JobGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A set captured for a job together with its lookup handle
#[derive(Clone)]
pub struct SnapshotEntry {
    set: Arc<HashSet>,
    reader: Arc<dyn HashLookup>,
}

impl SnapshotEntry {
    pub fn set(&self) -> &Arc<HashSet> {
        &self.set
    }

    pub fn name(&self) -> &str {
        self.set.name()
    }

    pub fn classification(&self) -> Classification {
        self.set.classification()
    }

    pub fn notify_on_hit(&self) -> bool {
        self.set.notify_on_hit()
    }

    pub fn lookup_quick(&self, hash: &Md5Hash) -> Result<bool, HashDbError> {
        self.reader.contains(hash)
    }

    pub fn lookup_verbose(&self, hash: &Md5Hash) -> Result<Option<HitInfo>, HashDbError> {
        self.reader.lookup(hash)
    }
}

/// A set left out of a job snapshot and why
#[derive(Debug, Clone)]
pub struct ExcludedSet {
    pub name: String,
    pub reason: String,
}

/// Immutable per-job view of the sets to search, grouped in priority order
#[derive(Clone, Default)]
pub struct JobSnapshot {
    notable: Vec<SnapshotEntry>,
    no_change: Vec<SnapshotEntry>,
    known: Vec<SnapshotEntry>,
    excluded: Vec<ExcludedSet>,
}

impl JobSnapshot {
    /// Validate each set once and keep the usable ones, preserving order
    pub fn from_sets<I>(sets: I) -> Self
    where
        I: IntoIterator<Item = Arc<HashSet>>,
    {
        let mut snapshot = JobSnapshot::default();
        for set in sets {
            if !set.is_valid() {
                tracing::warn!(set = %set.name(), state = ?set.state(), "excluding unusable hash set from job");
                snapshot.excluded.push(ExcludedSet {
                    name: set.name().to_string(),
                    reason: set.state().describe().to_string(),
                });
                continue;
            }
            let reader = match set.reader() {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::warn!(set = %set.name(), error = %e, "excluding unusable hash set from job");
                    snapshot.excluded.push(ExcludedSet {
                        name: set.name().to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let entry = SnapshotEntry { set, reader };
            match entry.classification() {
                Classification::Notable => snapshot.notable.push(entry),
                Classification::NoChange => snapshot.no_change.push(entry),
                Classification::Known => snapshot.known.push(entry),
            }
        }
        snapshot
    }

    pub fn notable(&self) -> &[SnapshotEntry] {
        &self.notable
    }

    pub fn no_change(&self) -> &[SnapshotEntry] {
        &self.no_change
    }

    pub fn known(&self) -> &[SnapshotEntry] {
        &self.known
    }

    pub fn excluded(&self) -> &[ExcludedSet] {
        &self.excluded
    }

    pub fn is_empty(&self) -> bool {
        self.notable.is_empty() && self.no_change.is_empty() && self.known.is_empty()
    }

    /// Names of every searched set, notable first
    pub fn set_names(&self) -> Vec<String> {
        self.notable
            .iter()
            .chain(&self.no_change)
            .chain(&self.known)
            .map(|e| e.name().to_string())
            .collect()
    }
}

/// Open a local backend: `.kdb` files as databases, everything else as an indexed flat file
///
/// With `retain_missing`, a database that cannot be opened is kept as an
/// invalid set instead of failing.
fn open_local_backend(
    path: &Path,
    format: Option<SourceFormat>,
    read_only: bool,
    retain_missing: bool,
) -> Result<Box<dyn HashSetBackend>, HashDbError> {
    let format = match format {
        Some(format) => format,
        None => SourceFormat::detect(path)?,
    };
    if format == SourceFormat::Kdb {
        return match KdbSet::open(path, read_only) {
            Ok(set) => Ok(Box::new(set)),
            Err(e) if retain_missing => {
                tracing::warn!(path = %path.display(), error = %e, "hash database unavailable");
                Ok(Box::new(KdbSet::unavailable(path, read_only)))
            }
            Err(e) => Err(e),
        };
    }
    Ok(Box::new(LocalIndexedSet::open(path, Some(format), read_only)?))
}

/// `<name>.<Identifier>.kdb` → (name, classification)
fn parse_official_name(path: &Path) -> Option<(String, Classification)> {
    let ext = path.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case(KDB_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (name, identifier) = stem.rsplit_once('.')?;
    if name.is_empty() {
        return None;
    }
    let classification = Classification::ALL
        .into_iter()
        .find(|c| c.identifier() == identifier)?;
    Some((name.to_string(), classification))
}

/// Compare paths by their canonical form where the file or its parent exists
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (fs::canonicalize(parent), path.file_name()) {
        (Ok(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}
