//! Indexing/commit phase.
//!
//! The phase is the single sequential consumer of a project's flushed
//! batches. For every file it claims the stamp, takes a dirty ticket, asks
//! the stamp store whether work is needed, loads content and runs every
//! extractor. Each commit batch is made durable in a fixed order: extractor
//! commits, stamp releases, stamp flush, and only then dirty-queue removal.

use crate::cancel::CancellationToken;
use crate::dirty::{DirtyFileQueue, DirtyTicket};
use crate::error::{IndexingError, Result};
use crate::provider::ProviderRegistry;
use crate::queue::FlushBatch;
use crate::stamp::{ClaimToken, IndexingStamp, StampStore};
use crate::types::{Changed, FileId, ProjectKey};

/// Failure reported by a content indexer for one file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct IndexError(pub String);

impl IndexError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Reads file content at processing time. `Ok(None)` means the file is gone.
pub trait ContentLoader: Send + Sync {
    fn load(&self, file_id: FileId) -> std::io::Result<Option<Vec<u8>>>;
}

/// One index extractor. Its storage engine is external; the scheduler only
/// decides when `index` runs and when `commit` must make it durable.
pub trait ContentIndexer: Send + Sync {
    fn name(&self) -> String;

    fn version(&self) -> u32;

    /// Authoritative freshness check, consulted when the stamp store can not
    /// decide.
    fn needs_update(&self, _file_id: FileId, _content: Option<&[u8]>) -> bool {
        true
    }

    fn index(&self, file_id: FileId, content: Option<&[u8]>) -> std::result::Result<(), IndexError>;

    fn commit(&self) -> std::result::Result<(), IndexError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexingReport {
    pub indexed: usize,
    pub skipped_fresh: usize,
    pub failed: usize,
    pub stale_claims: usize,
    pub committed_batches: usize,
    pub requeued: usize,
    pub cancelled: bool,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct Processed {
    file_id: FileId,
    /// `None` when the stored stamp already covered the file.
    token: Option<ClaimToken>,
    ticket: DirtyTicket,
}

pub struct IndexingPhase<'a> {
    project: &'a ProjectKey,
    registry: &'a ProviderRegistry,
    stamps: &'a StampStore,
    dirty: &'a DirtyFileQueue,
    candidate: IndexingStamp,
    commit_batch_size: usize,
}

impl<'a> IndexingPhase<'a> {
    pub fn new(
        project: &'a ProjectKey,
        registry: &'a ProviderRegistry,
        stamps: &'a StampStore,
        dirty: &'a DirtyFileQueue,
        candidate: IndexingStamp,
        commit_batch_size: usize,
    ) -> Self {
        Self {
            project,
            registry,
            stamps,
            dirty,
            candidate,
            commit_batch_size: commit_batch_size.max(1),
        }
    }

    /// Indexes `batch`. Only storage corruption is returned as an error;
    /// file-level failures and cancellation are counted in the report.
    pub fn run(&self, batch: FlushBatch, cancel: &CancellationToken) -> Result<IndexingReport> {
        let mut report = IndexingReport::default();
        let mut processed = Vec::with_capacity(self.commit_batch_size);

        for (position, &file_id) in batch.file_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                self.commit(&mut processed, &mut report)?;
                let rest = batch.file_ids[position..].to_vec();
                report.requeued = rest.len();
                report.cancelled = true;
                self.dirty.add_all(rest);
                log::debug!(
                    "indexing cancelled project={} requeued={}",
                    self.project,
                    report.requeued
                );
                return Ok(report);
            }

            if let Some(entry) = self.process(file_id, &mut report) {
                processed.push(entry);
            }
            if processed.len() >= self.commit_batch_size {
                self.commit(&mut processed, &mut report)?;
            }
        }

        self.commit(&mut processed, &mut report)?;
        log::info!(
            "indexing batch finished project={} reason={} indexed={} fresh={} failed={}",
            self.project,
            batch.reason,
            report.indexed,
            report.skipped_fresh,
            report.failed
        );
        Ok(report)
    }

    fn process(&self, file_id: FileId, report: &mut IndexingReport) -> Option<Processed> {
        let token = self.stamps.acquire(file_id);
        let ticket = self.dirty.ticket(file_id);
        let changed = self.stamps.is_changed(file_id, &self.candidate);
        if changed == Changed::No {
            self.stamps.abandon(file_id, token);
            report.skipped_fresh += 1;
            return Some(Processed {
                file_id,
                token: None,
                ticket,
            });
        }

        let content = match self.registry.content_loader().load(file_id) {
            Ok(content) => content,
            Err(error) => {
                self.fail(file_id, token, format!("load failed: {error}"), report);
                return None;
            }
        };
        let content = content.as_deref();
        let extractors = self.registry.extractors();

        if changed == Changed::Unknown
            && !extractors
                .iter()
                .any(|extractor| extractor.needs_update(file_id, content))
        {
            report.skipped_fresh += 1;
            return Some(Processed {
                file_id,
                token: Some(token),
                ticket,
            });
        }

        for extractor in extractors {
            if let Err(error) = extractor.index(file_id, content) {
                self.fail(file_id, token, format!("{}: {}", extractor.name(), error), report);
                return None;
            }
        }
        report.indexed += 1;
        Some(Processed {
            file_id,
            token: Some(token),
            ticket,
        })
    }

    fn fail(
        &self,
        file_id: FileId,
        token: ClaimToken,
        reason: String,
        report: &mut IndexingReport,
    ) {
        self.dirty.add_all([file_id]);
        self.stamps.abandon(file_id, token);
        let error = IndexingError::IndexWrite { file_id, reason };
        log::warn!("indexing project={} {}", self.project, error);
        report.failed += 1;
        report.last_error = Some(error.to_string());
    }

    fn commit(&self, processed: &mut Vec<Processed>, report: &mut IndexingReport) -> Result<()> {
        if processed.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(processed);

        for extractor in self.registry.extractors() {
            if let Err(error) = extractor.commit() {
                self.dirty.add_all(entries.iter().map(|entry| entry.file_id));
                for entry in &entries {
                    if let Some(token) = entry.token {
                        self.stamps.abandon(entry.file_id, token);
                    }
                }
                let reason = format!("commit of {} failed: {}", extractor.name(), error);
                log::warn!(
                    "indexing project={} files={} {}",
                    self.project,
                    entries.len(),
                    reason
                );
                report.failed += entries.len();
                report.last_error = Some(reason);
                return Ok(());
            }
        }

        let stamp = IndexingStamp::new(self.stamps.current_generation(), self.candidate.mask);
        let mut tickets = Vec::with_capacity(entries.len());
        for entry in &entries {
            match entry.token {
                Some(token) => {
                    if self.stamps.release(entry.file_id, token, stamp)? {
                        tickets.push(entry.ticket);
                    } else {
                        report.stale_claims += 1;
                    }
                }
                None => tickets.push(entry.ticket),
            }
        }
        self.stamps.flush()?;
        self.dirty.remove_committed(&tickets);
        report.committed_batches += 1;
        Ok(())
    }
}
