// Hash set import parsers
// Format detection and a uniform record stream over every supported source format

mod delimited;
mod encase;
mod idx;
mod kdb;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use xz2::read::XzDecoder;

use super::error::HashDbError;
use super::record::HashRecord;

pub use delimited::DelimitedLayout;
pub use encase::{ENCASE_MAGIC, ENCASE_RECORD_START};

/// File extension of prebuilt sorted indexes (`<source>-md5.hsi`)
pub const INDEX_SUFFIX: &str = "-md5.hsi";

/// Source formats a hash set can be imported from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// One hash per line, `|` or space separated (IDX, md5sum)
    LineHex,
    /// EnCase fixed-record binary hash set
    EncaseBinary,
    /// Hashkeeper delimited text with a `hash` header column
    Hashkeeper,
    /// NSRL RDS file listing with an `MD5` header column
    Nsrl,
    /// SQLite hash database with a `hashes` table
    Kdb,
    /// A prebuilt sorted index with no source
    IndexOnly,
}

impl SourceFormat {
    /// Detect the format of a source file from its name
    pub fn detect(path: &Path) -> Result<Self, HashDbError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.ends_with(INDEX_SUFFIX) {
            return Ok(SourceFormat::IndexOnly);
        }

        // Compressed line files are named e.g. hashes.idx.xz
        let inner = if is_compressed(path) {
            Path::new(name.trim_end_matches(".xz")).to_path_buf()
        } else {
            path.to_path_buf()
        };

        let ext = inner.extension().and_then(|e| e.to_str()).unwrap_or_default();
        match ext {
            "hash" | "Hash" => Ok(SourceFormat::EncaseBinary),
            _ => match ext.to_ascii_lowercase().as_str() {
                "idx" | "txt" | "md5" => Ok(SourceFormat::LineHex),
                "hsh" | "csv" => Ok(SourceFormat::Hashkeeper),
                "kdb" => Ok(SourceFormat::Kdb),
                _ => Err(HashDbError::UnsupportedFormat {
                    path: path.to_path_buf(),
                }),
            },
        }
    }

    /// Parse a user-supplied format name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "idx" | "md5sum" | "line" | "line_hex" => Some(SourceFormat::LineHex),
            "encase" | "hash" => Some(SourceFormat::EncaseBinary),
            "hashkeeper" | "hsh" | "csv" => Some(SourceFormat::Hashkeeper),
            "nsrl" => Some(SourceFormat::Nsrl),
            "kdb" | "sqlite" => Some(SourceFormat::Kdb),
            "index" | "hsi" => Some(SourceFormat::IndexOnly),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SourceFormat::LineHex => "idx",
            SourceFormat::EncaseBinary => "encase",
            SourceFormat::Hashkeeper => "hashkeeper",
            SourceFormat::Nsrl => "nsrl",
            SourceFormat::Kdb => "kdb",
            SourceFormat::IndexOnly => "index",
        }
    }
}

/// Check if a path has .xz extension (compressed source)
pub fn is_compressed(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == "xz")
        .unwrap_or(false)
}

/// Open a text source, automatically decompressing if it has .xz extension
pub fn open_text_reader(path: &Path) -> Result<Box<dyn BufRead + Send>, HashDbError> {
    let file = File::open(path).map_err(|e| {
        HashDbError::from_io_error(e, "opening hash set", Some(path.to_path_buf()))
    })?;

    if is_compressed(path) {
        Ok(Box::new(BufReader::new(XzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Size of a source on disk, used for the text formats' estimates
fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// A format-specific record reader
///
/// `read_next` returns `Ok(None)` at end of input. Strict formats return a
/// `ParseError` for the first malformed record and are not read further.
trait RecordSource: Send {
    fn estimated_count(&self) -> u64;
    fn read_next(&mut self) -> Result<Option<HashRecord>, HashDbError>;
    fn close(&mut self);
}

/// Lazy record stream over a hash set source file
pub struct HashSetParser {
    path: PathBuf,
    format: SourceFormat,
    source: Box<dyn RecordSource>,
    peeked: Option<Result<Option<HashRecord>, HashDbError>>,
    records_read: usize,
    finished: bool,
}

impl HashSetParser {
    /// Open a parser, detecting the format from the file name
    pub fn open(path: &Path) -> Result<Self, HashDbError> {
        let format = SourceFormat::detect(path)?;
        Self::open_as(path, format)
    }

    /// Open a parser for an explicit format
    pub fn open_as(path: &Path, format: SourceFormat) -> Result<Self, HashDbError> {
        let source: Box<dyn RecordSource> = match format {
            SourceFormat::LineHex => Box::new(idx::IdxSource::open(path)?),
            SourceFormat::EncaseBinary => Box::new(encase::EncaseSource::open(path)?),
            SourceFormat::Hashkeeper => Box::new(delimited::DelimitedSource::open(
                path,
                DelimitedLayout::hashkeeper(),
            )?),
            SourceFormat::Nsrl => Box::new(delimited::DelimitedSource::open(
                path,
                DelimitedLayout::nsrl(),
            )?),
            SourceFormat::Kdb => Box::new(kdb::KdbSource::open(path)?),
            SourceFormat::IndexOnly => {
                return Err(HashDbError::UnsupportedFormat {
                    path: path.to_path_buf(),
                })
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            format,
            source,
            peeked: None,
            records_read: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    /// Approximate record count, for progress reporting only
    pub fn estimated_count(&self) -> u64 {
        self.source.estimated_count()
    }

    /// Number of records returned so far
    pub fn records_read(&self) -> usize {
        self.records_read
    }

    /// Whether another record (or a pending parse error) is available
    pub fn has_more(&mut self) -> bool {
        if self.finished {
            return false;
        }
        if self.peeked.is_none() {
            self.peeked = Some(self.source.read_next());
        }
        !matches!(self.peeked, Some(Ok(None)))
    }

    /// Next record, `Ok(None)` at end of sequence
    pub fn next_record(&mut self) -> Result<Option<HashRecord>, HashDbError> {
        if self.finished {
            return Ok(None);
        }
        let next = match self.peeked.take() {
            Some(next) => next,
            None => self.source.read_next(),
        };
        match next {
            Ok(Some(record)) => {
                self.records_read += 1;
                Ok(Some(record))
            }
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Release the underlying file or database handle
    pub fn close(&mut self) {
        if !self.finished {
            self.finished = true;
            self.peeked = None;
            self.source.close();
        }
    }
}

impl Iterator for HashSetParser {
    type Item = Result<HashRecord, HashDbError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

impl Drop for HashSetParser {
    fn drop(&mut self) {
        self.close();
    }
}
