//! Per-job classification metrics.
//!
//! Every file classification emits [`ClassificationEvent`]s. The engine folds
//! them into [`JobTotals`] as it goes; the same totals can be rebuilt from the
//! recorded events with [`JobTotals::from_events`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::hash::hash_set::Classification;

/// One measurable step of classifying a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClassificationEvent {
    /// Content was hashed because no MD5 was supplied
    HashComputed { elapsed: Duration },
    HashFailed,
    /// One set lookup, hit or not
    Lookup { elapsed: Duration },
    LookupFailed { set: String },
    Hit { classification: Classification, set: String },
}

/// Running totals for one ingestion job; safe to update from many threads
#[derive(Debug, Default)]
pub struct JobTotals {
    notable_hits: AtomicU64,
    no_change_hits: AtomicU64,
    known_hits: AtomicU64,
    hash_errors: AtomicU64,
    lookup_errors: AtomicU64,
    hash_nanos: AtomicU64,
    lookup_nanos: AtomicU64,
}

impl JobTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &ClassificationEvent) {
        match event {
            ClassificationEvent::HashComputed { elapsed } => {
                self.hash_nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
            }
            ClassificationEvent::HashFailed => {
                self.hash_errors.fetch_add(1, Ordering::Relaxed);
            }
            ClassificationEvent::Lookup { elapsed } => {
                self.lookup_nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
            }
            ClassificationEvent::LookupFailed { .. } => {
                self.lookup_errors.fetch_add(1, Ordering::Relaxed);
            }
            ClassificationEvent::Hit { classification, .. } => {
                let counter = match classification {
                    Classification::Notable => &self.notable_hits,
                    Classification::NoChange => &self.no_change_hits,
                    Classification::Known => &self.known_hits,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Rebuild totals from a recorded event stream
    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a ClassificationEvent>,
    {
        let totals = Self::new();
        for event in events {
            totals.apply(event);
        }
        totals
    }

    pub fn notable_hits(&self) -> u64 {
        self.notable_hits.load(Ordering::Relaxed)
    }

    pub fn no_change_hits(&self) -> u64 {
        self.no_change_hits.load(Ordering::Relaxed)
    }

    pub fn known_hits(&self) -> u64 {
        self.known_hits.load(Ordering::Relaxed)
    }

    pub fn hash_time(&self) -> Duration {
        Duration::from_nanos(self.hash_nanos.load(Ordering::Relaxed))
    }

    pub fn lookup_time(&self) -> Duration {
        Duration::from_nanos(self.lookup_nanos.load(Ordering::Relaxed))
    }

    pub fn summary(&self, sets_used: Vec<String>) -> JobSummary {
        JobSummary {
            notable_hits: self.notable_hits(),
            no_change_hits: self.no_change_hits(),
            known_hits: self.known_hits(),
            hash_errors: self.hash_errors.load(Ordering::Relaxed),
            lookup_errors: self.lookup_errors.load(Ordering::Relaxed),
            hash_time_ms: self.hash_time().as_millis() as u64,
            lookup_time_ms: self.lookup_time().as_millis() as u64,
            sets_used,
        }
    }
}

/// End-of-job summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub notable_hits: u64,
    pub no_change_hits: u64,
    pub known_hits: u64,
    pub hash_errors: u64,
    pub lookup_errors: u64,
    pub hash_time_ms: u64,
    pub lookup_time_ms: u64,
    pub sets_used: Vec<String>,
}

impl JobSummary {
    /// Plain text body of the summary message
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Notable files found: {}\n", self.notable_hits));
        out.push_str(&format!("No change files found: {}\n", self.no_change_hits));
        out.push_str(&format!("Known files found: {}\n", self.known_hits));
        out.push_str(&format!("Total calculation time: {} ms\n", self.hash_time_ms));
        out.push_str(&format!("Total lookup time: {} ms\n", self.lookup_time_ms));
        out.push_str("Hash sets used:\n");
        for name in &self.sets_used {
            out.push_str(&format!("  {}\n", name));
        }
        out
    }
}
