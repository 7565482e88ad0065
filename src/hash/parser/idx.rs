// Line-based hex hash set parser
// IDX and md5sum style files: first token per line, non-hash lines skipped

use std::io::BufRead;
use std::path::{Path, PathBuf};

use super::{file_len, open_text_reader, RecordSource};
use crate::hash::error::HashDbError;
use crate::hash::record::{HashRecord, Md5Hash};

// Average IDX line length, used for the progress estimate
const IDX_LINE_LEN: u64 = 0x33;

pub(super) struct IdxSource {
    path: PathBuf,
    reader: Option<Box<dyn BufRead + Send>>,
    line: String,
    skipped: usize,
    estimate: u64,
}

impl IdxSource {
    pub(super) fn open(path: &Path) -> Result<Self, HashDbError> {
        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(open_text_reader(path)?),
            line: String::new(),
            skipped: 0,
            estimate: file_len(path) / IDX_LINE_LEN,
        })
    }
}

/// Extract the hash from one line, if the line carries one
pub(super) fn parse_line(line: &str) -> Option<Md5Hash> {
    let token = line
        .trim_end_matches(['\r', '\n'])
        .split(['|', ' '])
        .next()?
        .to_ascii_lowercase();
    if !Md5Hash::is_canonical_hex(&token) {
        return None;
    }
    Md5Hash::from_hex(&token)
}

impl RecordSource for IdxSource {
    fn estimated_count(&self) -> u64 {
        self.estimate
    }

    fn read_next(&mut self) -> Result<Option<HashRecord>, HashDbError> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        loop {
            self.line.clear();
            let read = reader.read_line(&mut self.line).map_err(|e| {
                HashDbError::from_io_error(e, "reading hash set", Some(self.path.clone()))
            })?;
            if read == 0 {
                if self.skipped > 0 {
                    tracing::debug!(
                        path = %self.path.display(),
                        skipped = self.skipped,
                        "skipped non-hash lines"
                    );
                }
                return Ok(None);
            }
            match parse_line(&self.line) {
                Some(md5) => return Ok(Some(HashRecord::new(md5))),
                None => self.skipped += 1,
            }
        }
    }

    fn close(&mut self) {
        self.reader = None;
    }
}
