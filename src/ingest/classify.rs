//! File classification against a job's hash set snapshot.
//!
//! Sets are consulted in a fixed order: notable, then no-change, then known.
//! A notable hit always wins, and the first configured notable set that
//! matches is the one a hit is attributed to. Known sets are only consulted
//! when no notable hit was found, with the cheap existence lookup.
//!
//! Lookup failures never fail a file: the set is treated as a non-match and
//! reported once per job.

use std::collections::HashSet as StdHashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;

use crate::hash::error::HashDbError;
use crate::hash::hash_set::Classification;
use crate::hash::record::{HitInfo, Md5Hash, MAX_COMMENT_SIZE};
use crate::hash::registry::{JobSnapshot, SnapshotEntry};

use super::context::{ArtifactSink, ContentHasher, FileSubject, IngestMessage, JobContext};
use super::totals::{ClassificationEvent, JobSummary, JobTotals};

/// Final classification of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Unknown,
    Known,
    Notable,
}

/// A notable or no-change hit, as handed to the artifact sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashHit {
    pub file_id: u64,
    pub file_name: String,
    pub set_name: String,
    pub classification: Classification,
    pub md5: Md5Hash,
    /// Joined comments, capped for display
    pub comment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<u64>,
}

/// Outcome of classifying one file
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub file_id: u64,
    pub file_name: String,
    pub md5: Option<Md5Hash>,
    pub disposition: Disposition,
    /// First set that matched, in priority order
    pub matched_set: Option<String>,
    pub hit_comment: Option<String>,
    pub hits: Vec<HashHit>,
    /// The file was not looked up at all (directory, slack, nothing to search)
    pub skipped: bool,
    pub errors: Vec<String>,
    #[serde(skip)]
    pub events: Vec<ClassificationEvent>,
}

impl ClassificationResult {
    fn new(subject: &FileSubject) -> Self {
        Self {
            file_id: subject.id,
            file_name: subject.name.clone(),
            md5: subject.md5,
            disposition: Disposition::Unknown,
            matched_set: None,
            hit_comment: None,
            hits: Vec::new(),
            skipped: false,
            errors: Vec::new(),
            events: Vec::new(),
        }
    }

    fn skipped(subject: &FileSubject) -> Self {
        let mut result = Self::new(subject);
        result.skipped = true;
        result
    }
}

/// Engine options
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierOptions {
    /// Keep searching notable and no-change sets after the first hit so every
    /// matching set gets its own hit; disposition and attribution do not change
    pub report_all_hits: bool,
    /// Hash files even when no set is searched
    pub calculate_hashes: bool,
}

/// Classifies files for one ingestion job
pub struct ClassificationEngine {
    snapshot: JobSnapshot,
    hasher: Arc<dyn ContentHasher>,
    sink: Option<Arc<dyn ArtifactSink>>,
    options: ClassifierOptions,
    totals: JobTotals,
    reported_sets: Mutex<StdHashSet<String>>,
}

impl ClassificationEngine {
    pub fn new(snapshot: JobSnapshot, hasher: Arc<dyn ContentHasher>, options: ClassifierOptions) -> Self {
        Self {
            snapshot,
            hasher,
            sink: None,
            options,
            totals: JobTotals::new(),
            reported_sets: Mutex::new(StdHashSet::new()),
        }
    }

    pub fn with_artifact_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn snapshot(&self) -> &JobSnapshot {
        &self.snapshot
    }

    pub fn totals(&self) -> &JobTotals {
        &self.totals
    }

    /// Post the start-of-job warnings
    pub fn start(&self, ctx: &dyn JobContext) {
        if self.snapshot.notable().is_empty() {
            ctx.post_message(IngestMessage::warning(
                "No notable hash set.",
                "Notable file search will not be executed.",
            ));
        }
        if self.snapshot.known().is_empty() {
            ctx.post_message(IngestMessage::warning(
                "No known hash set.",
                "Known file search will not be executed.",
            ));
        }
        for excluded in self.snapshot.excluded() {
            ctx.post_message(IngestMessage::warning(
                format!("Hash set '{}' will not be searched.", excluded.name),
                excluded.reason.clone(),
            ));
        }
        tracing::info!(
            job = ctx.job_id(),
            notable = self.snapshot.notable().len(),
            no_change = self.snapshot.no_change().len(),
            known = self.snapshot.known().len(),
            "hash lookup started"
        );
    }

    /// Classify one file
    pub fn classify(&self, subject: &FileSubject, ctx: &dyn JobContext) -> ClassificationResult {
        if subject.is_skipped_kind() {
            return ClassificationResult::skipped(subject);
        }
        if self.snapshot.is_empty() && !self.options.calculate_hashes {
            return ClassificationResult::skipped(subject);
        }

        let mut result = ClassificationResult::new(subject);
        let md5 = match subject.md5 {
            Some(md5) => md5,
            None => match self.compute_md5(subject, ctx, &mut result) {
                Some(md5) => md5,
                None => return self.record(result),
            },
        };
        result.md5 = Some(md5);

        let notable_found = self.search_verbose(self.snapshot.notable(), &md5, subject, ctx, &mut result);
        if notable_found {
            result.disposition = Disposition::Notable;
        }

        self.search_verbose(self.snapshot.no_change(), &md5, subject, ctx, &mut result);

        if !notable_found {
            for entry in self.snapshot.known() {
                let start = Instant::now();
                let found = entry.lookup_quick(&md5);
                result.events.push(ClassificationEvent::Lookup {
                    elapsed: start.elapsed(),
                });
                match found {
                    Ok(true) => {
                        result.disposition = Disposition::Known;
                        if result.matched_set.is_none() {
                            result.matched_set = Some(entry.name().to_string());
                        }
                        result.events.push(ClassificationEvent::Hit {
                            classification: Classification::Known,
                            set: entry.name().to_string(),
                        });
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => self.lookup_failed(entry, e, subject, ctx, &mut result),
                }
            }
        }

        self.record(result)
    }

    /// Classify many files in parallel; files not started before cancellation are left out
    pub fn classify_all(&self, subjects: &[FileSubject], ctx: &dyn JobContext) -> Vec<ClassificationResult> {
        self.classify_all_with_progress(subjects, ctx, &|_| {})
    }

    /// Like `classify_all`, calling `progress` after each file
    pub fn classify_all_with_progress(
        &self,
        subjects: &[FileSubject],
        ctx: &dyn JobContext,
        progress: &(dyn Fn(&ClassificationResult) + Sync),
    ) -> Vec<ClassificationResult> {
        subjects
            .par_iter()
            .filter_map(|subject| {
                if ctx.is_cancelled() {
                    return None;
                }
                let result = self.classify(subject, ctx);
                progress(&result);
                Some(result)
            })
            .collect()
    }

    /// Post the end-of-job summary and return it
    pub fn finish(&self, ctx: &dyn JobContext) -> JobSummary {
        let summary = self.totals.summary(self.snapshot.set_names());
        if !self.snapshot.notable().is_empty() || !self.snapshot.known().is_empty() {
            ctx.post_message(IngestMessage::info("Hash Lookup Results", summary.render()));
        }
        tracing::info!(
            job = ctx.job_id(),
            notable = summary.notable_hits,
            no_change = summary.no_change_hits,
            known = summary.known_hits,
            hash_ms = summary.hash_time_ms,
            lookup_ms = summary.lookup_time_ms,
            "hash lookup finished"
        );
        summary
    }

    fn record(&self, result: ClassificationResult) -> ClassificationResult {
        for event in &result.events {
            self.totals.apply(event);
        }
        result
    }

    fn compute_md5(&self, subject: &FileSubject, ctx: &dyn JobContext, result: &mut ClassificationResult) -> Option<Md5Hash> {
        let start = Instant::now();
        match self.hasher.compute_hashes(subject) {
            Ok(hashes) => {
                result.events.push(ClassificationEvent::HashComputed {
                    elapsed: start.elapsed(),
                });
                Some(hashes.md5)
            }
            Err(e) => {
                tracing::warn!(file = %subject.path.display(), file_id = subject.id, error = %e, "error calculating hash of file");
                ctx.post_message(IngestMessage::error(
                    format!("Read Error: {}", subject.name),
                    format!("Error encountered while calculating the hash value for {}.", subject.name),
                ));
                result.events.push(ClassificationEvent::HashFailed);
                result.errors.push(e.to_string());
                None
            }
        }
    }

    /// Verbose search of one priority group; returns whether any set matched
    fn search_verbose(
        &self,
        entries: &[SnapshotEntry],
        md5: &Md5Hash,
        subject: &FileSubject,
        ctx: &dyn JobContext,
        result: &mut ClassificationResult,
    ) -> bool {
        let mut found = false;
        for entry in entries {
            let start = Instant::now();
            let lookup = entry.lookup_verbose(md5);
            result.events.push(ClassificationEvent::Lookup {
                elapsed: start.elapsed(),
            });
            match lookup {
                Ok(Some(info)) => {
                    let first = !found;
                    found = true;
                    self.report_hit(entry, &info, subject, ctx, result, first);
                    if !self.options.report_all_hits {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => self.lookup_failed(entry, e, subject, ctx, result),
            }
        }
        found
    }

    fn report_hit(
        &self,
        entry: &SnapshotEntry,
        info: &HitInfo,
        subject: &FileSubject,
        ctx: &dyn JobContext,
        result: &mut ClassificationResult,
        first_in_group: bool,
    ) {
        let comment = info.comment_summary(MAX_COMMENT_SIZE);
        if result.matched_set.is_none() {
            result.matched_set = Some(entry.name().to_string());
        }
        if first_in_group && result.hit_comment.is_none() {
            result.hit_comment = Some(comment.clone());
        }

        let mut hit = HashHit {
            file_id: subject.id,
            file_name: subject.name.clone(),
            set_name: entry.name().to_string(),
            classification: entry.classification(),
            md5: info.hash,
            comment,
            artifact_id: None,
        };

        if let Some(sink) = &self.sink {
            match sink.post_hit(&hit) {
                Ok(id) => hit.artifact_id = Some(id),
                Err(e) => {
                    tracing::error!(file_id = subject.id, set = %entry.name(), error = %e, "failed to post hash set hit");
                    ctx.post_message(IngestMessage::error(
                        format!("Failed to record hash set hit for {}", subject.name),
                        e.to_string(),
                    ));
                    result.errors.push(e.to_string());
                }
            }
        }

        if entry.notify_on_hit() {
            ctx.post_message(IngestMessage::data(
                format!("{}: {}", entry.classification().display_name(), subject.name),
                format!(
                    "File Name: {}\nMD5 Hash: {}\nHash Set Name: {}",
                    subject.name, hit.md5, hit.set_name
                ),
            ));
        }

        result.events.push(ClassificationEvent::Hit {
            classification: entry.classification(),
            set: entry.name().to_string(),
        });
        result.hits.push(hit);
    }

    /// Downgrade a failed lookup to a non-match; the set is reported once per job
    fn lookup_failed(
        &self,
        entry: &SnapshotEntry,
        err: HashDbError,
        subject: &FileSubject,
        ctx: &dyn JobContext,
        result: &mut ClassificationResult,
    ) {
        tracing::warn!(set = %entry.name(), file_id = subject.id, file = %subject.name, error = %err, "hash lookup failed");
        let first_report = self
            .reported_sets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.name().to_string());
        if first_report {
            ctx.post_message(IngestMessage::warning(
                format!("Hash Lookup Error: {}", subject.name),
                format!(
                    "Error encountered while looking up {} hash value for {}. Hash set '{}' is treated as no match for the rest of the job.",
                    entry.classification().display_name(),
                    subject.name,
                    entry.name()
                ),
            ));
        }
        result.events.push(ClassificationEvent::LookupFailed {
            set: entry.name().to_string(),
        });
        result.errors.push(err.to_string());
    }
}
