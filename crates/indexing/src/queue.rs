//! Per-project buffer between scanning and indexing.
//!
//! Every provider scan writes through its own [`Sink`]; all sinks feed one
//! deduplicated set. [`IndexingQueue::flush`] swaps that set out as a
//! [`FlushBatch`] for the single indexing consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fnv::FnvHashSet;
use parking_lot::{Condvar, Mutex};

use crate::error::{IndexingError, Result};
use crate::types::{FileId, ProjectKey};

/// Files handed to the indexing phase by one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushBatch {
    pub reason: String,
    pub file_ids: Vec<FileId>,
}

#[derive(Debug)]
struct QueueState {
    files: FnvHashSet<FileId>,
    pending: VecDeque<FlushBatch>,
    open_sinks: usize,
    allow_flushing: bool,
}

#[derive(Debug)]
pub struct IndexingQueue {
    project: ProjectKey,
    cancelled: AtomicBool,
    state: Mutex<QueueState>,
    sinks_closed: Condvar,
}

impl IndexingQueue {
    pub fn new(project: ProjectKey) -> Arc<Self> {
        Arc::new(Self {
            project,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(QueueState {
                files: FnvHashSet::default(),
                pending: VecDeque::new(),
                open_sinks: 0,
                allow_flushing: true,
            }),
            sinks_closed: Condvar::new(),
        })
    }

    /// Opens a single-writer handle for the scan of `provider_id`.
    pub fn sink(self: &Arc<Self>, provider_id: impl Into<String>) -> Sink {
        self.state.lock().open_sinks += 1;
        Sink {
            queue: Arc::clone(self),
            provider_id: provider_id.into(),
            added: 0,
            closed: false,
        }
    }

    /// Moves the accumulated files into a pending batch.
    ///
    /// Returns `false` when flushing is disallowed or nothing was queued.
    pub fn flush(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        if !state.allow_flushing {
            log::warn!(
                "indexing queue flush refused project={} reason={} queued={}",
                self.project,
                reason,
                state.files.len()
            );
            return false;
        }
        if state.files.is_empty() {
            return false;
        }
        let mut file_ids: Vec<FileId> = std::mem::take(&mut state.files).into_iter().collect();
        file_ids.sort_unstable();
        log::debug!(
            "indexing queue flushed project={} files={} reason={}",
            self.project,
            file_ids.len(),
            reason
        );
        state.pending.push_back(FlushBatch {
            reason: reason.to_string(),
            file_ids,
        });
        true
    }

    pub fn take_batch(&self) -> Option<FlushBatch> {
        self.state.lock().pending.pop_front()
    }

    /// Raises cancellation for every sink and blocks until all of them closed.
    pub fn cancel_all_and_wait(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        while state.open_sinks > 0 {
            self.sinks_closed.wait(&mut state);
        }
    }

    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_allow_flushing(&self, allow: bool) {
        self.state.lock().allow_flushing = allow;
    }

    /// Files waiting in the set or in pending batches.
    pub fn queued_len(&self) -> usize {
        let state = self.state.lock();
        state.files.len()
            + state
                .pending
                .iter()
                .map(|batch| batch.file_ids.len())
                .sum::<usize>()
    }

    pub fn open_sinks(&self) -> usize {
        self.state.lock().open_sinks
    }

    /// Removes everything queued, flushed or not.
    pub fn drain_all(&self) -> Vec<FileId> {
        let mut state = self.state.lock();
        let mut file_ids: Vec<FileId> = std::mem::take(&mut state.files).into_iter().collect();
        for batch in state.pending.drain(..) {
            file_ids.extend(batch.file_ids);
        }
        file_ids.sort_unstable();
        file_ids.dedup();
        file_ids
    }
}

/// Append-only handle bound to one provider's scan. Closing is idempotent
/// and happens on drop.
#[derive(Debug)]
pub struct Sink {
    queue: Arc<IndexingQueue>,
    provider_id: String,
    added: usize,
    closed: bool,
}

impl Sink {
    pub fn add(&mut self, file_id: FileId) -> Result<()> {
        if self.queue.is_cancelled() {
            return Err(IndexingError::Cancelled);
        }
        if self.closed {
            return Err(IndexingError::Internal(format!(
                "sink of {} already closed",
                self.provider_id
            )));
        }
        self.queue.state.lock().files.insert(file_id);
        self.added += 1;
        Ok(())
    }

    pub fn added(&self) -> usize {
        self.added
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.queue.state.lock();
        state.open_sinks -= 1;
        if state.open_sinks == 0 {
            self.queue.sinks_closed.notify_all();
        }
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        self.close();
    }
}
