// EnCase hash set parser
// Fixed-record binary format: magic, record count, metadata blocks, then 18-byte records

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use super::RecordSource;
use crate::hash::error::HashDbError;
use crate::hash::record::{HashRecord, Md5Hash};

/// Every EnCase hash set starts with these 16 bytes
pub const ENCASE_MAGIC: [u8; 16] = [
    0x48, 0x41, 0x53, 0x48, 0x0d, 0x0a, 0xff, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
];

const FILLER_LEN: usize = 0x3f4;
const NAME_LEN: usize = 0x50;
const TYPE_LEN: usize = 0x28;
const SEPARATOR_LEN: usize = 2;

/// Byte offset of the first hash record
pub const ENCASE_RECORD_START: usize = 16 + 4 + FILLER_LEN + NAME_LEN + TYPE_LEN;

pub(super) struct EncaseSource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    expected: u32,
    returned: u32,
}

impl EncaseSource {
    pub(super) fn open(path: &Path) -> Result<Self, HashDbError> {
        let file = File::open(path).map_err(|e| {
            HashDbError::from_io_error(e, "opening hash set", Some(path.to_path_buf()))
        })?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 16];
        read_header_field(&mut reader, &mut magic, path, "header")?;
        if magic != ENCASE_MAGIC {
            return Err(HashDbError::parse(path, 0, "file does not start with the EnCase header"));
        }

        let mut count = [0u8; 4];
        read_header_field(&mut reader, &mut count, path, "record count")?;
        let expected = u32::from_le_bytes(count);

        let mut filler = vec![0u8; FILLER_LEN];
        read_header_field(&mut reader, &mut filler, path, "header filler")?;

        let mut name = [0u8; NAME_LEN];
        read_header_field(&mut reader, &mut name, path, "set name")?;
        let mut set_type = [0u8; TYPE_LEN];
        read_header_field(&mut reader, &mut set_type, path, "set type")?;

        tracing::debug!(
            path = %path.display(),
            set_name = %decode_utf16_field(&name),
            set_type = %decode_utf16_field(&set_type),
            records = expected,
            "opened EnCase hash set"
        );

        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(reader),
            expected,
            returned: 0,
        })
    }
}

impl RecordSource for EncaseSource {
    fn estimated_count(&self) -> u64 {
        self.expected as u64
    }

    fn read_next(&mut self) -> Result<Option<HashRecord>, HashDbError> {
        if self.returned >= self.expected {
            return Ok(None);
        }
        let record_no = self.returned as usize + 1;
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        let mut record = [0u8; 16 + SEPARATOR_LEN];
        reader.read_exact(&mut record).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => HashDbError::parse(
                &self.path,
                record_no,
                format!(
                    "file ends after {} of {} declared records",
                    self.returned, self.expected
                ),
            ),
            _ => HashDbError::from_io_error(e, "reading hash set", Some(self.path.clone())),
        })?;

        self.returned += 1;
        let md5 = Md5Hash::from_slice(&record[..16])
            .ok_or_else(|| HashDbError::parse(&self.path, record_no, "short hash record"))?;
        Ok(Some(HashRecord::new(md5)))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

fn read_header_field(
    reader: &mut BufReader<File>,
    buf: &mut [u8],
    path: &Path,
    field: &str,
) -> Result<(), HashDbError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            HashDbError::parse(path, 0, format!("file is truncated inside the {}", field))
        }
        _ => HashDbError::from_io_error(e, "reading hash set header", Some(path.to_path_buf())),
    })
}

/// Name and type blocks are NUL padded UTF-16LE
fn decode_utf16_field(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}
