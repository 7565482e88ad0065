// SQLite hash database parser
// Streams the md5 column of the `hashes` table in rowid order

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags};

use super::RecordSource;
use crate::hash::error::HashDbError;
use crate::hash::record::{HashRecord, Md5Hash};

const BATCH_SIZE: i64 = 4096;

const SELECT_WITH_COMMENTS: &str = "SELECT h.rowid, h.md5, \
     (SELECT group_concat(c.comment, ' ') FROM comments c WHERE c.hash_id = h.rowid) \
     FROM hashes h WHERE ?1 IS NULL OR h.rowid > ?1 ORDER BY h.rowid LIMIT ?2";
const SELECT_HASHES: &str =
    "SELECT rowid, md5, NULL FROM hashes WHERE ?1 IS NULL OR rowid > ?1 ORDER BY rowid LIMIT ?2";

pub(super) struct KdbSource {
    path: PathBuf,
    conn: Option<Connection>,
    total: u64,
    query: &'static str,
    /// Keyset cursor; `None` before the first page, since rowids may be zero or negative
    last_rowid: Option<i64>,
    returned: usize,
    buffer: VecDeque<(String, Option<String>)>,
    exhausted: bool,
}

impl KdbSource {
    pub(super) fn open(path: &Path) -> Result<Self, HashDbError> {
        if !path.exists() {
            return Err(HashDbError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| HashDbError::from_sqlite(e, path))?;

        let total: i64 = conn
            .query_row("SELECT count(*) FROM hashes", [], |row| row.get(0))
            .map_err(|e| HashDbError::from_sqlite(e, path))?;

        let has_comments: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'comments'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(|e| HashDbError::from_sqlite(e, path))?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Some(conn),
            total: total.max(0) as u64,
            query: if has_comments { SELECT_WITH_COMMENTS } else { SELECT_HASHES },
            last_rowid: None,
            returned: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    fn fill_buffer(&mut self) -> Result<(), HashDbError> {
        let conn = match self.conn.as_ref() {
            Some(conn) => conn,
            None => {
                self.exhausted = true;
                return Ok(());
            }
        };
        let path = &self.path;
        let sqlite_err = |e| HashDbError::from_sqlite(e, path);

        let mut stmt = conn.prepare_cached(self.query).map_err(sqlite_err)?;
        let mut rows = stmt
            .query(params![self.last_rowid, BATCH_SIZE])
            .map_err(sqlite_err)?;

        let mut fetched = 0;
        while let Some(row) = rows.next().map_err(sqlite_err)? {
            let rowid: i64 = row.get(0).map_err(sqlite_err)?;
            let md5 = match row.get_ref(1).map_err(sqlite_err)? {
                ValueRef::Blob(bytes) => hex::encode(bytes),
                ValueRef::Text(text) => String::from_utf8_lossy(text).to_ascii_lowercase(),
                ValueRef::Null => String::new(),
                other => format!("{:?}", other),
            };
            let comment: Option<String> = row.get(2).map_err(sqlite_err)?;
            self.last_rowid = Some(rowid);
            self.buffer.push_back((md5, comment));
            fetched += 1;
        }
        if fetched < BATCH_SIZE {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl RecordSource for KdbSource {
    fn estimated_count(&self) -> u64 {
        self.total
    }

    fn read_next(&mut self) -> Result<Option<HashRecord>, HashDbError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill_buffer()?;
        }
        let (md5_hex, comment) = match self.buffer.pop_front() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.returned += 1;

        if md5_hex.len() != 32 {
            return Err(HashDbError::parse(
                &self.path,
                self.returned,
                format!("md5 value '{}' is not 32 hex characters", md5_hex),
            ));
        }
        let md5 = Md5Hash::from_hex(&md5_hex).ok_or_else(|| {
            HashDbError::parse(&self.path, self.returned, format!("'{}' is not hex", md5_hex))
        })?;

        let mut record = HashRecord::new(md5);
        if let Some(comment) = comment {
            record = record.with_comment(comment);
        }
        Ok(Some(record))
    }

    fn close(&mut self) {
        self.buffer.clear();
        self.exhausted = true;
        self.conn = None;
    }
}
