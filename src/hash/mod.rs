// Hash set storage and lookup engine
// Import parsers, sorted indexes, hash set backends and the registry that owns them

pub mod config;
pub mod error;
pub mod hash;
pub mod hash_set;
pub mod index;
pub mod indexer;
pub mod kdb;
pub mod parser;
pub mod record;
pub mod registry;
pub mod remote;

// Re-export commonly used types for convenience
pub use config::{HashLookupSettings, HashSetInfo};
pub use error::HashDbError;
pub use hash::{ComputedHashes, HashComputer};
pub use hash_set::{Classification, HashLookup, HashSet, HashSetBackend, KdbSet, LocalIndexedSet, StorageKind};
pub use index::{index_path_for, CancelToken, IndexBuilder, IndexState, SortedIndex};
pub use indexer::{submit_reindex, ReindexHandle, ReindexStatus};
pub use kdb::KdbStore;
pub use parser::{HashSetParser, SourceFormat};
pub use record::{HashRecord, HitInfo, Md5Hash, MAX_COMMENT_SIZE};
pub use registry::{HashSetRegistry, JobGuard, JobSnapshot, LoadReport, SetOptions, SnapshotEntry};
pub use remote::{ReferenceSetId, RemoteReferenceClient, RemoteReferenceSet};
