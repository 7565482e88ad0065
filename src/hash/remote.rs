// Remote reference sets
// Hash sets hosted by an external reference-set service, queried through a client trait

use std::path::PathBuf;
use std::sync::Arc;

use super::error::HashDbError;
use super::hash_set::{HashLookup, HashSetBackend, StorageKind};
use super::index::{BuildProgress, CancelToken, IndexState};
use super::record::{HashRecord, HitInfo, Md5Hash};

/// Error raised by a reference-set client (connectivity, timeouts, server faults)
pub type RemoteError = Box<dyn std::error::Error + Send + Sync>;

/// Client for a networked reference-set service
///
/// Implementations own their timeout and retry policy. Every call is treated
/// as a synchronous request that may fail.
pub trait RemoteReferenceClient: Send + Sync {
    fn exists(&self, hash: &Md5Hash, set_id: i64) -> Result<bool, RemoteError>;
    fn lookup(&self, hash: &Md5Hash, set_id: i64) -> Result<Option<HitInfo>, RemoteError>;
    fn add(&self, records: &[HashRecord], set_id: i64) -> Result<usize, RemoteError>;
    /// Whether the reference set is known to the service
    fn is_available(&self, set_id: i64) -> bool;
}

/// Identifies a reference set on the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSetId {
    pub id: i64,
    pub version: String,
}

struct RemoteLookup {
    client: Arc<dyn RemoteReferenceClient>,
    reference: ReferenceSetId,
}

impl RemoteLookup {
    fn unavailable(&self, err: RemoteError) -> HashDbError {
        HashDbError::IndexUnavailable {
            set: format!("reference set {}", self.reference.id),
            reason: err.to_string(),
        }
    }
}

impl HashLookup for RemoteLookup {
    fn contains(&self, hash: &Md5Hash) -> Result<bool, HashDbError> {
        self.client
            .exists(hash, self.reference.id)
            .map_err(|e| self.unavailable(e))
    }

    fn lookup(&self, hash: &Md5Hash) -> Result<Option<HitInfo>, HashDbError> {
        self.client
            .lookup(hash, self.reference.id)
            .map_err(|e| self.unavailable(e))
    }
}

/// A hash set backed by a remote reference set
pub struct RemoteReferenceSet {
    lookup: Arc<RemoteLookup>,
    read_only: bool,
}

impl RemoteReferenceSet {
    pub fn new(client: Arc<dyn RemoteReferenceClient>, reference: ReferenceSetId, read_only: bool) -> Self {
        Self {
            lookup: Arc::new(RemoteLookup { client, reference }),
            read_only,
        }
    }

    pub fn reference(&self) -> &ReferenceSetId {
        &self.lookup.reference
    }
}

impl HashSetBackend for RemoteReferenceSet {
    fn storage_kind(&self) -> StorageKind {
        StorageKind::RemoteReference
    }

    fn state(&self) -> IndexState {
        if self.lookup.client.is_available(self.lookup.reference.id) {
            IndexState::Built
        } else {
            IndexState::Invalid
        }
    }

    fn refresh_state(&self) -> IndexState {
        self.state()
    }

    fn reader(&self) -> Option<Arc<dyn HashLookup>> {
        let reader: Arc<dyn HashLookup> = self.lookup.clone();
        Some(reader)
    }

    fn is_updatable(&self) -> bool {
        !self.read_only
    }

    fn add_records(&self, records: &[HashRecord]) -> Result<usize, HashDbError> {
        if self.read_only {
            return Err(HashDbError::NotUpdatable {
                set: self.location(),
            });
        }
        self.lookup
            .client
            .add(records, self.lookup.reference.id)
            .map_err(|e| self.lookup.unavailable(e))
    }

    fn rebuild(&self, _cancel: &CancelToken, _progress: Option<BuildProgress<'_>>) -> Result<(), HashDbError> {
        // The service maintains its own indexes
        Ok(())
    }

    fn paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn location(&self) -> String {
        format!(
            "reference set {} (version {})",
            self.lookup.reference.id, self.lookup.reference.version
        )
    }

    fn entry_count(&self) -> Option<u64> {
        None
    }
}
