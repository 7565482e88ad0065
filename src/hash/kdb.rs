// SQLite hash database
// Creates, opens, appends to and queries `.kdb` hash databases

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::error::HashDbError;
use super::record::{HashRecord, HitInfo, Md5Hash};

/// File extension required for new hash databases
pub const KDB_EXTENSION: &str = "kdb";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS hashes (
        id INTEGER PRIMARY KEY,
        md5 BLOB NOT NULL UNIQUE,
        sha1 BLOB,
        sha2_256 BLOB
    );
    CREATE TABLE IF NOT EXISTS comments (
        id INTEGER PRIMARY KEY,
        comment TEXT NOT NULL,
        hash_id INTEGER NOT NULL,
        UNIQUE(comment, hash_id)
    );
    CREATE TABLE IF NOT EXISTS properties (
        name TEXT PRIMARY KEY,
        value TEXT
    );
";

const SCHEMA_VERSION: &str = "1";

/// A hash set stored in an SQLite database
///
/// The connection is serialized behind a mutex; SQLite handles are not
/// shareable between threads.
pub struct KdbStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    read_only: bool,
}

impl std::fmt::Debug for KdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KdbStore")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl KdbStore {
    /// Create a new, empty hash database
    ///
    /// The path must carry the `.kdb` extension and must not exist yet.
    pub fn create(path: &Path) -> Result<Self, HashDbError> {
        let has_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(KDB_EXTENSION))
            .unwrap_or(false);
        if !has_ext {
            return Err(HashDbError::UnsupportedFormat {
                path: path.to_path_buf(),
            });
        }
        if path.exists() {
            return Err(HashDbError::DuplicateSetPath {
                path: path.to_path_buf(),
            });
        }

        let conn = Connection::open(path).map_err(|e| HashDbError::from_sqlite(e, path))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| HashDbError::from_sqlite(e, path))?;
        conn.execute(
            "INSERT OR REPLACE INTO properties(name, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION],
        )
        .map_err(|e| HashDbError::from_sqlite(e, path))?;

        tracing::info!(path = %path.display(), "created hash database");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            read_only: false,
        })
    }

    /// Open an existing hash database
    pub fn open(path: &Path, read_only: bool) -> Result<Self, HashDbError> {
        if !path.exists() {
            return Err(HashDbError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| HashDbError::from_sqlite(e, path))?;

        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'hashes'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| HashDbError::from_sqlite(e, path))?;
        if tables == 0 {
            return Err(HashDbError::IndexCorrupt {
                path: path.to_path_buf(),
                reason: "database has no 'hashes' table".to_string(),
            });
        }
        if !read_only {
            // Older databases may lack the comment and property tables
            conn.execute_batch(SCHEMA)
                .map_err(|e| HashDbError::from_sqlite(e, path))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sqlite_err(&self, err: rusqlite::Error) -> HashDbError {
        HashDbError::from_sqlite(err, &self.path)
    }

    /// Number of distinct hashes stored
    pub fn count(&self) -> Result<u64, HashDbError> {
        let conn = self.lock();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM hashes", [], |row| row.get(0))
            .map_err(|e| self.sqlite_err(e))?;
        Ok(n.max(0) as u64)
    }

    /// Existence check against the unique index on `md5`
    pub fn contains(&self, hash: &Md5Hash) -> Result<bool, HashDbError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM hashes WHERE md5 = ?1")
            .map_err(|e| self.sqlite_err(e))?;
        stmt.exists(params![&hash.as_bytes()[..]])
            .map_err(|e| self.sqlite_err(e))
    }

    /// Existence check plus every comment recorded for the hash
    pub fn lookup(&self, hash: &Md5Hash) -> Result<Option<HitInfo>, HashDbError> {
        let conn = self.lock();
        let id: Option<i64> = conn
            .prepare_cached("SELECT id FROM hashes WHERE md5 = ?1")
            .and_then(|mut stmt| {
                stmt.query_row(params![&hash.as_bytes()[..]], |row| row.get(0))
                    .optional()
            })
            .map_err(|e| self.sqlite_err(e))?;
        let id = match id {
            Some(id) => id,
            None => return Ok(None),
        };

        let mut stmt = conn
            .prepare_cached("SELECT comment FROM comments WHERE hash_id = ?1 ORDER BY id")
            .map_err(|e| self.sqlite_err(e))?;
        let comments = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| self.sqlite_err(e))?;

        let mut hit = HitInfo::new(*hash);
        hit.comments = comments;
        Ok(Some(hit))
    }

    /// Insert records in a single transaction
    ///
    /// Hashes already present are kept; a new comment for an existing hash is
    /// still attached. Returns the number of hashes that were new.
    pub fn add_records(&self, records: &[HashRecord]) -> Result<usize, HashDbError> {
        if self.read_only {
            return Err(HashDbError::NotUpdatable {
                set: self.path.display().to_string(),
            });
        }

        let mut conn = self.lock();
        let tx = conn.transaction().map_err(|e| self.sqlite_err(e))?;
        let mut added = 0;
        {
            let mut insert_hash = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO hashes(md5, sha1, sha2_256) VALUES (?1, ?2, ?3)",
                )
                .map_err(|e| self.sqlite_err(e))?;
            let mut select_id = tx
                .prepare_cached("SELECT id FROM hashes WHERE md5 = ?1")
                .map_err(|e| self.sqlite_err(e))?;
            let mut insert_comment = tx
                .prepare_cached("INSERT OR IGNORE INTO comments(comment, hash_id) VALUES (?1, ?2)")
                .map_err(|e| self.sqlite_err(e))?;

            for record in records {
                let md5 = &record.md5.as_bytes()[..];
                let (sha1, sha256) = split_secondary(record.secondary.as_deref());
                added += insert_hash
                    .execute(params![md5, sha1, sha256])
                    .map_err(|e| self.sqlite_err(e))?;

                if let Some(comment) = &record.comment {
                    let id: i64 = select_id
                        .query_row(params![md5], |row| row.get(0))
                        .map_err(|e| self.sqlite_err(e))?;
                    insert_comment
                        .execute(params![comment, id])
                        .map_err(|e| self.sqlite_err(e))?;
                }
            }
        }
        tx.commit().map_err(|e| self.sqlite_err(e))?;

        tracing::debug!(
            path = %self.path.display(),
            submitted = records.len(),
            added,
            "added hashes to database"
        );
        Ok(added)
    }

    pub fn property(&self, name: &str) -> Result<Option<String>, HashDbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT value FROM properties WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| self.sqlite_err(e))
    }

    pub fn set_property(&self, name: &str, value: &str) -> Result<(), HashDbError> {
        if self.read_only {
            return Err(HashDbError::NotUpdatable {
                set: self.path.display().to_string(),
            });
        }
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO properties(name, value) VALUES (?1, ?2)",
            params![name, value],
        )
        .map_err(|e| self.sqlite_err(e))?;
        Ok(())
    }
}

/// Route a hex secondary digest to the sha1 or sha2_256 column by length
fn split_secondary(secondary: Option<&str>) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let bytes = match secondary.and_then(|s| hex::decode(s).ok()) {
        Some(bytes) => bytes,
        None => return (None, None),
    };
    match bytes.len() {
        20 => (Some(bytes), None),
        32 => (None, Some(bytes)),
        _ => (None, None),
    }
}
