// Hash computation module
// Computes the MD5 (primary) and SHA-256 (secondary) digests of file content

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest as Md5Digest, Md5};
use memmap2::Mmap;
use sha2::{Digest as Sha2Digest, Sha256};

use super::error::HashDbError;
use super::record::Md5Hash;

// Constants for memory mapping
const MMAP_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024; // 2GB

/// Digests of one piece of content
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ComputedHashes {
    pub md5: Md5Hash,
    pub sha256: String, // hex-encoded
}

/// Both digests fed from a single pass over the data
struct DualHasher {
    md5: Md5,
    sha256: Sha256,
}

impl DualHasher {
    fn new() -> Self {
        Self {
            md5: Md5Digest::new(),
            sha256: Sha2Digest::new(),
        }
    }

    fn update(&mut self, data: &[u8]) {
        Md5Digest::update(&mut self.md5, data);
        Sha2Digest::update(&mut self.sha256, data);
    }

    fn finalize(self) -> ComputedHashes {
        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&Md5Digest::finalize(self.md5));
        ComputedHashes {
            md5: Md5Hash::from_bytes(md5),
            sha256: hex::encode(Sha2Digest::finalize(self.sha256)),
        }
    }
}

/// Hash computer with streaming I/O
#[derive(Debug, Clone)]
pub struct HashComputer {
    buffer_size: usize,
}

impl HashComputer {
    /// Create a new HashComputer with default buffer size (1MB)
    pub fn new() -> Self {
        Self {
            buffer_size: 1024 * 1024,
        }
    }

    /// Create a new HashComputer with custom buffer size
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self { buffer_size }
    }

    /// Digest an in-memory buffer
    pub fn compute_bytes(&self, data: &[u8]) -> ComputedHashes {
        let mut hasher = DualHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Compute the hashes of a file
    ///
    /// Files smaller than 2GB are memory mapped; larger files (and files that
    /// fail to map) are streamed through a buffer.
    ///
    /// # Safety
    ///
    /// Memory mapping assumes the file is not modified while it is hashed.
    pub fn compute_file(&self, path: &Path) -> Result<ComputedHashes, HashDbError> {
        let file = File::open(path).map_err(|e| self.compute_error(path, e))?;
        let file_size = file
            .metadata()
            .map_err(|e| self.compute_error(path, e))?
            .len();

        let mut hasher = DualHasher::new();
        if file_size > 0 && file_size < MMAP_THRESHOLD {
            match unsafe { Mmap::map(&file) } {
                Ok(mmap) => hasher.update(&mmap[..]),
                Err(_) => self.hash_with_buffered_io(&mut hasher, file, path)?,
            }
        } else {
            self.hash_with_buffered_io(&mut hasher, file, path)?;
        }

        Ok(hasher.finalize())
    }

    /// Helper method to hash a file using buffered I/O
    fn hash_with_buffered_io(
        &self,
        hasher: &mut DualHasher,
        mut file: File,
        path: &Path,
    ) -> Result<(), HashDbError> {
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let bytes_read = file
                .read(&mut buffer)
                .map_err(|e| self.compute_error(path, e))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(())
    }

    fn compute_error(&self, path: &Path, err: std::io::Error) -> HashDbError {
        HashDbError::HashComputeError {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

impl Default for HashComputer {
    fn default() -> Self {
        Self::new()
    }
}
