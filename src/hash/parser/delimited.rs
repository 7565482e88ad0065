// Delimited text hash set parser
// Hashkeeper and NSRL style CSV with a declared header row

use std::io::BufRead;
use std::path::{Path, PathBuf};

use csv::{Reader, ReaderBuilder, StringRecord};

use super::{file_len, open_text_reader, RecordSource};
use crate::hash::error::HashDbError;
use crate::hash::record::{HashRecord, Md5Hash};

/// Column names a delimited source is read by (case-sensitive)
#[derive(Debug, Clone)]
pub struct DelimitedLayout {
    pub hash_column: &'static str,
    pub comment_column: Option<&'static str>,
    pub secondary_column: Option<&'static str>,
    /// Average bytes per row, for the progress estimate
    pub row_size_hint: u64,
}

impl DelimitedLayout {
    pub fn hashkeeper() -> Self {
        Self {
            hash_column: "hash",
            comment_column: Some("comment"),
            secondary_column: Some("sha256"),
            row_size_hint: 75,
        }
    }

    pub fn nsrl() -> Self {
        Self {
            hash_column: "MD5",
            comment_column: Some("FileName"),
            secondary_column: Some("SHA-1"),
            row_size_hint: 200,
        }
    }
}

struct Columns {
    hash: usize,
    comment: Option<usize>,
    secondary: Option<usize>,
}

pub(super) struct DelimitedSource {
    path: PathBuf,
    reader: Option<Reader<Box<dyn BufRead + Send>>>,
    columns: Columns,
    row: StringRecord,
    estimate: u64,
}

impl DelimitedSource {
    pub(super) fn open(path: &Path, layout: DelimitedLayout) -> Result<Self, HashDbError> {
        let input = open_text_reader(path)?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(input);

        let headers = reader
            .headers()
            .map_err(|e| csv_error(path, 0, e))?
            .clone();
        let columns = Columns {
            hash: find_column(&headers, layout.hash_column).ok_or_else(|| {
                HashDbError::parse(
                    path,
                    0,
                    format!("header row has no '{}' column", layout.hash_column),
                )
            })?,
            comment: layout.comment_column.and_then(|c| find_column(&headers, c)),
            secondary: layout.secondary_column.and_then(|c| find_column(&headers, c)),
        };

        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(reader),
            columns,
            row: StringRecord::new(),
            estimate: file_len(path) / layout.row_size_hint.max(1),
        })
    }
}

impl RecordSource for DelimitedSource {
    fn estimated_count(&self) -> u64 {
        self.estimate
    }

    fn read_next(&mut self) -> Result<Option<HashRecord>, HashDbError> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        let line = reader.position().line() as usize;
        let more = reader
            .read_record(&mut self.row)
            .map_err(|e| csv_error(&self.path, line, e))?;
        if !more {
            return Ok(None);
        }

        let line = self
            .row
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(line);
        let value = self.row.get(self.columns.hash).unwrap_or_default().trim();
        let md5 = Md5Hash::from_hex(value).ok_or_else(|| {
            HashDbError::parse(
                &self.path,
                line,
                format!("'{}' is not a 32 character hex hash", value),
            )
        })?;

        let mut record = HashRecord::new(md5);
        if let Some(comment) = self.columns.comment.and_then(|i| self.row.get(i)) {
            record = record.with_comment(comment.trim());
        }
        if let Some(secondary) = self.columns.secondary.and_then(|i| self.row.get(i)) {
            record = record.with_secondary(secondary.trim().to_ascii_lowercase());
        }
        Ok(Some(record))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

fn find_column(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

fn csv_error(path: &Path, line: usize, err: csv::Error) -> HashDbError {
    match err.into_kind() {
        csv::ErrorKind::Io(e) => {
            HashDbError::from_io_error(e, "reading hash set", Some(path.to_path_buf()))
        }
        kind => HashDbError::parse(path, line, format!("{:?}", kind)),
    }
}
