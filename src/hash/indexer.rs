// Background indexing
// Runs a hash set rebuild on its own thread and exposes it as a pollable handle

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, TryRecvError};

use super::error::HashDbError;
use super::hash_set::HashSet;
use super::index::{CancelToken, IndexState};

/// Progress of a submitted reindex
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReindexStatus {
    Building,
    Built,
    Failed(String),
    Cancelled,
}

impl ReindexStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ReindexStatus::Building)
    }
}

/// Handle to a reindex running in the background
pub struct ReindexHandle {
    set_name: String,
    status: Arc<Mutex<ReindexStatus>>,
    records: Arc<AtomicU64>,
    estimate: Arc<AtomicU64>,
    cancel: CancelToken,
    done: Receiver<Result<(), HashDbError>>,
    result: Option<Result<(), HashDbError>>,
    thread: Option<JoinHandle<()>>,
}

/// Start rebuilding a hash set's index on a background thread
///
/// Fails with `IndexBusy` if the set is already being indexed.
pub fn submit_reindex(set: Arc<HashSet>) -> Result<ReindexHandle, HashDbError> {
    if set.state() == IndexState::Building {
        return Err(HashDbError::IndexBusy {
            set: set.name().to_string(),
        });
    }

    let status = Arc::new(Mutex::new(ReindexStatus::Building));
    let records = Arc::new(AtomicU64::new(0));
    let estimate = Arc::new(AtomicU64::new(0));
    let cancel = CancelToken::new();
    let (tx, rx) = bounded(1);

    let set_name = set.name().to_string();
    let thread_status = Arc::clone(&status);
    let thread_records = Arc::clone(&records);
    let thread_estimate = Arc::clone(&estimate);
    let thread_cancel = cancel.clone();

    let thread = thread::Builder::new()
        .name(format!("reindex-{}", set_name))
        .spawn(move || {
            let progress = |done: usize, total: u64| {
                thread_records.store(done as u64, Ordering::Relaxed);
                thread_estimate.store(total, Ordering::Relaxed);
            };
            let result = set.reindex(&thread_cancel, Some(&progress));

            let final_status = match &result {
                Ok(()) => ReindexStatus::Built,
                Err(HashDbError::Cancelled { .. }) => ReindexStatus::Cancelled,
                Err(e) => ReindexStatus::Failed(e.to_string()),
            };
            *thread_status.lock().unwrap_or_else(|e| e.into_inner()) = final_status;
            let _ = tx.send(result);
        })
        .map_err(|e| HashDbError::from_io_error(e, "starting indexing thread", None))?;

    Ok(ReindexHandle {
        set_name,
        status,
        records,
        estimate,
        cancel,
        done: rx,
        result: None,
        thread: Some(thread),
    })
}

impl ReindexHandle {
    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn status(&self) -> ReindexStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Records consumed so far and the parser's estimate of the total
    pub fn progress(&self) -> (u64, u64) {
        (
            self.records.load(Ordering::Relaxed),
            self.estimate.load(Ordering::Relaxed),
        )
    }

    /// Ask the build to stop at its next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Non-blocking completion check
    pub fn poll(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        match self.done.try_recv() {
            Ok(result) => {
                self.result = Some(result);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.result = Some(Err(self.thread_lost()));
                true
            }
        }
    }

    /// Block until the build finishes
    pub fn wait(mut self) -> Result<(), HashDbError> {
        let result = match self.result.take() {
            Some(result) => result,
            None => self.done.recv().unwrap_or_else(|_| Err(self.thread_lost())),
        };
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        result
    }

    fn thread_lost(&self) -> HashDbError {
        HashDbError::IndexUnavailable {
            set: self.set_name.clone(),
            reason: "indexing thread exited without reporting a result".to_string(),
        }
    }
}
