//! Collaborators of the classification engine.
//!
//! The engine never owns an ingestion pipeline. It is handed a [`JobContext`]
//! for cancellation and user messages, a [`ContentHasher`] for files whose MD5
//! is not yet known, and optionally an [`ArtifactSink`] that records hits.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::hash::error::HashDbError;
use crate::hash::hash::{ComputedHashes, HashComputer};
use crate::hash::index::CancelToken;
use crate::hash::record::Md5Hash;

use super::classify::HashHit;

/// Severity of a user-visible ingestion message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
    /// A result worth the user's attention, such as a hash set hit
    Data,
}

/// A message for the user, posted through the job context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestMessage {
    pub level: MessageLevel,
    pub subject: String,
    pub details: String,
}

impl IngestMessage {
    pub fn new(level: MessageLevel, subject: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            level,
            subject: subject.into(),
            details: details.into(),
        }
    }

    pub fn info(subject: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(MessageLevel::Info, subject, details)
    }

    pub fn warning(subject: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(MessageLevel::Warning, subject, details)
    }

    pub fn error(subject: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(MessageLevel::Error, subject, details)
    }

    pub fn data(subject: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(MessageLevel::Data, subject, details)
    }
}

/// The ingestion job a file is processed under
pub trait JobContext: Send + Sync {
    fn job_id(&self) -> u64;
    fn is_cancelled(&self) -> bool;
    fn post_message(&self, message: IngestMessage);
}

/// Error raised by an artifact sink
pub type ArtifactError = Box<dyn std::error::Error + Send + Sync>;

/// Records hash set hits; returns the id of the created artifact
pub trait ArtifactSink: Send + Sync {
    fn post_hit(&self, hit: &HashHit) -> Result<u64, ArtifactError>;
}

/// Computes content hashes for files that arrive without one
pub trait ContentHasher: Send + Sync {
    fn compute_hashes(&self, subject: &FileSubject) -> Result<ComputedHashes, HashDbError>;
}

impl ContentHasher for HashComputer {
    fn compute_hashes(&self, subject: &FileSubject) -> Result<ComputedHashes, HashDbError> {
        self.compute_file(&subject.path)
    }
}

/// What kind of object an ingested subject is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    File,
    Directory,
    /// Unallocated space carved into a pseudo-file
    UnallocatedBlocks,
    /// File slack
    Slack,
}

/// A file handed to the engine by the ingestion pipeline
#[derive(Debug, Clone)]
pub struct FileSubject {
    pub id: u64,
    pub name: String,
    pub path: PathBuf,
    pub kind: SubjectKind,
    /// Present when the pipeline already hashed the file
    pub md5: Option<Md5Hash>,
}

impl FileSubject {
    pub fn file(id: u64, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = display_name(&path);
        Self {
            id,
            name,
            path,
            kind: SubjectKind::File,
            md5: None,
        }
    }

    pub fn with_kind(mut self, kind: SubjectKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_md5(mut self, md5: Md5Hash) -> Self {
        self.md5 = Some(md5);
        self
    }

    /// Directories, unallocated space and slack are never hashed
    pub fn is_skipped_kind(&self) -> bool {
        !matches!(self.kind, SubjectKind::File)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// A job context that keeps every posted message in memory
#[derive(Debug, Default)]
pub struct MemoryJobContext {
    job_id: u64,
    cancel: CancelToken,
    messages: Mutex<Vec<IngestMessage>>,
}

impl MemoryJobContext {
    pub fn new(job_id: u64) -> Self {
        Self {
            job_id,
            ..Self::default()
        }
    }

    /// Token that cancels this job when triggered
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn messages(&self) -> Vec<IngestMessage> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn messages_at(&self, level: MessageLevel) -> Vec<IngestMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.level == level)
            .collect()
    }
}

impl JobContext for MemoryJobContext {
    fn job_id(&self) -> u64 {
        self.job_id
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn post_message(&self, message: IngestMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

/// An artifact sink that keeps hits in memory and numbers them sequentially
#[derive(Debug, Default)]
pub struct MemoryArtifactSink {
    hits: Mutex<Vec<HashHit>>,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> Vec<HashHit> {
        self.hits.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ArtifactSink for MemoryArtifactSink {
    fn post_hit(&self, hit: &HashHit) -> Result<u64, ArtifactError> {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.push(hit.clone());
        Ok(hits.len() as u64)
    }
}
