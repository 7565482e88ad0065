// Centralized error handling module
// Error taxonomy for hash set import, indexing, lookup and registry management

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Main error type for the hash lookup engine
/// Every variant carries enough context to be reported to the operator as-is
#[derive(Debug)]
pub enum HashDbError {
    /// File system errors with context
    FileNotFound { path: PathBuf },
    PermissionDenied { path: PathBuf, operation: String },
    IoError { path: Option<PathBuf>, operation: String, source: io::Error },

    /// Import errors
    UnsupportedFormat { path: PathBuf },
    ParseError { path: PathBuf, record: usize, reason: String },

    /// Index errors
    IndexUnavailable { set: String, reason: String },
    IndexCorrupt { path: PathBuf, reason: String },
    IndexBusy { set: String },

    /// Content hashing errors
    HashComputeError { path: PathBuf, reason: String },

    /// Registry errors
    DuplicateSetName { name: String },
    DuplicateSetPath { path: PathBuf },
    ConcurrentModificationDenied { set: String },
    SetNotFound { name: String },
    NotUpdatable { set: String },
    OfficialSetLocked { set: String },

    /// Backing store and configuration errors
    DatabaseError { path: Option<PathBuf>, source: rusqlite::Error },
    ConfigError { path: PathBuf, reason: String },

    /// Operation stopped by a cancellation request
    Cancelled { operation: String },
}

impl fmt::Display for HashDbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HashDbError::FileNotFound { path } => {
                write!(f, "File not found: {}\n", path.display())?;
                write!(f, "Suggestion: Check that the file path is correct and the file exists")
            }
            HashDbError::PermissionDenied { path, operation } => {
                write!(f, "Permission denied while {} file: {}\n", operation, path.display())?;
                write!(f, "Suggestion: Check file permissions or run with appropriate privileges")
            }
            HashDbError::IoError { path, operation, source } => {
                if let Some(p) = path {
                    write!(f, "I/O error while {} file {}: {}\n", operation, p.display(), source)?;
                } else {
                    write!(f, "I/O error while {}: {}\n", operation, source)?;
                }
                write!(f, "Suggestion: Check file permissions and disk space")
            }

            HashDbError::UnsupportedFormat { path } => {
                write!(f, "Unrecognized hash set format: {}\n", path.display())?;
                write!(f, "Suggestion: Use one of .idx, .txt, .md5, .hash, .hsh, .csv or .kdb, or pass --format")
            }
            HashDbError::ParseError { path, record, reason } => {
                write!(f, "Error parsing hash set {} at record {}: {}\n", path.display(), record, reason)?;
                write!(f, "Suggestion: The hash set was not imported; repair or replace the source file")
            }

            HashDbError::IndexUnavailable { set, reason } => {
                write!(f, "Index for hash set '{}' is unavailable: {}\n", set, reason)?;
                write!(f, "Suggestion: Reindex the hash set before using it for lookups")
            }
            HashDbError::IndexCorrupt { path, reason } => {
                write!(f, "Index file {} is corrupt: {}\n", path.display(), reason)?;
                write!(f, "Suggestion: Delete the index file and reindex the hash set")
            }
            HashDbError::IndexBusy { set } => {
                write!(f, "Hash set '{}' is already being indexed\n", set)?;
                write!(f, "Suggestion: Wait for the running indexing job to finish")
            }

            HashDbError::HashComputeError { path, reason } => {
                write!(f, "Failed to compute MD5 hash for {}: {}\n", path.display(), reason)?;
                write!(f, "Suggestion: Check that the file is readable and not corrupted")
            }

            HashDbError::DuplicateSetName { name } => {
                write!(f, "A hash set named '{}' is already configured\n", name)?;
                write!(f, "Suggestion: Choose a different hash set name")
            }
            HashDbError::DuplicateSetPath { path } => {
                write!(f, "The hash set at {} has already been added\n", path.display())?;
                write!(f, "Suggestion: Each hash set file may only be configured once")
            }
            HashDbError::ConcurrentModificationDenied { set } => {
                write!(f, "Hash set '{}' cannot be changed while ingest is running\n", set)?;
                write!(f, "Suggestion: Wait for running ingest jobs to complete")
            }
            HashDbError::SetNotFound { name } => {
                write!(f, "No hash set named '{}' is configured\n", name)?;
                write!(f, "Suggestion: Use the 'list' command to see configured hash sets")
            }
            HashDbError::NotUpdatable { set } => {
                write!(f, "Hash set '{}' does not accept new hashes\n", set)?;
                write!(f, "Suggestion: Add hashes to an updatable .kdb hash set instead")
            }

            HashDbError::OfficialSetLocked { set } => {
                write!(f, "Hash set '{}' is an official hash set and cannot be removed or changed\n", set)?;
                write!(f, "Suggestion: Remove the file from the official hash set folder instead")
            }

            HashDbError::DatabaseError { path, source } => {
                if let Some(p) = path {
                    write!(f, "Hash database error in {}: {}\n", p.display(), source)?;
                } else {
                    write!(f, "Hash database error: {}\n", source)?;
                }
                write!(f, "Suggestion: Check that the file is a valid hash database")
            }
            HashDbError::ConfigError { path, reason } => {
                write!(f, "Invalid hash lookup settings in {}: {}\n", path.display(), reason)?;
                write!(f, "Suggestion: Fix or remove the settings file")
            }

            HashDbError::Cancelled { operation } => {
                write!(f, "{} was cancelled", operation)
            }
        }
    }
}

impl std::error::Error for HashDbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HashDbError::IoError { source, .. } => Some(source),
            HashDbError::DatabaseError { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl HashDbError {
    /// Create an IoError with context about the operation and optional path
    pub fn from_io_error(err: io::Error, operation: &str, path: Option<PathBuf>) -> Self {
        match (err.kind(), path) {
            (io::ErrorKind::NotFound, Some(p)) => HashDbError::FileNotFound { path: p },
            (io::ErrorKind::PermissionDenied, Some(p)) => HashDbError::PermissionDenied {
                path: p,
                operation: operation.to_string(),
            },
            (_, path) => HashDbError::IoError {
                path,
                operation: operation.to_string(),
                source: err,
            },
        }
    }

    /// Wrap a SQLite error with the database path it occurred on
    pub fn from_sqlite(err: rusqlite::Error, path: &std::path::Path) -> Self {
        HashDbError::DatabaseError {
            path: Some(path.to_path_buf()),
            source: err,
        }
    }

    /// Build a parse error for the given source record
    pub fn parse(path: &std::path::Path, record: usize, reason: impl Into<String>) -> Self {
        HashDbError::ParseError {
            path: path.to_path_buf(),
            record,
            reason: reason.into(),
        }
    }

    /// Duplicate name or duplicate backing path on add
    pub fn is_registry_conflict(&self) -> bool {
        matches!(
            self,
            HashDbError::DuplicateSetName { .. } | HashDbError::DuplicateSetPath { .. }
        )
    }

    /// Errors that downgrade a lookup to "no match" instead of failing the file
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            HashDbError::IndexUnavailable { .. }
                | HashDbError::IndexCorrupt { .. }
                | HashDbError::IndexBusy { .. }
                | HashDbError::DatabaseError { .. }
        )
    }
}

impl From<io::Error> for HashDbError {
    fn from(err: io::Error) -> Self {
        HashDbError::from_io_error(err, "unknown operation", None)
    }
}

impl From<rusqlite::Error> for HashDbError {
    fn from(err: rusqlite::Error) -> Self {
        HashDbError::DatabaseError { path: None, source: err }
    }
}
