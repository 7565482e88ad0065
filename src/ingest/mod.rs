// Ingestion-side hash lookup
// Classifies ingested files against a job's snapshot of the hash set registry

pub mod classify;
pub mod context;
pub mod totals;

pub use classify::{ClassificationEngine, ClassificationResult, ClassifierOptions, Disposition, HashHit};
pub use context::{
    ArtifactError, ArtifactSink, ContentHasher, FileSubject, IngestMessage, JobContext,
    MemoryArtifactSink, MemoryJobContext, MessageLevel, SubjectKind,
};
pub use totals::{ClassificationEvent, JobSummary, JobTotals};
