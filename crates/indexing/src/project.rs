//! Scheduler of one open project.
//!
//! Owns the project's dirty file queue, indexing queue and executor. Every
//! task scans into the indexing queue and then drives the indexing phase
//! over the flushed batches. A partial task always includes the files of
//! the dirty queue; a project that owes a full scan upgrades partial tasks
//! until one full scan completed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::cancel::CancellationToken;
use crate::config::IndexingConfig;
use crate::dirty::{DirtyFileQueue, DirtyQueueSnapshot};
use crate::error::{IndexingError, Result};
use crate::executor::{
    ScanExecutor, ScanKind, ScanRequest, ScanTask, ScanTaskRunner, TaskHandle, TaskSummary,
};
use crate::indexer::IndexingPhase;
use crate::provider::{FileListProvider, ProviderRef, ProviderRegistry};
use crate::queue::IndexingQueue;
use crate::service::MachineState;
use crate::session::{ScanningSession, SessionState};
use crate::status::{ProjectProgress, ProjectState, ProjectStatus};
use crate::tumbler::RescanDecision;
use crate::types::{FileId, OriginKind, ProjectKey, RootsChangedScope};

/// Pause reason held while the tumbler is off.
pub(crate) const INDEXING_OFF: &str = "indexing off";

/// Receives storage failures that only a machine-wide rebuild can repair.
pub(crate) trait StorageEscalation: Send + Sync {
    fn storage_corrupted(&self, project: &ProjectKey, reason: &str);
}

struct ProjectCore {
    key: ProjectKey,
    machine: Arc<MachineState>,
    providers: RwLock<Vec<ProviderRef>>,
    dirty: Arc<DirtyFileQueue>,
    queue: Arc<IndexingQueue>,
    progress: ProjectProgress,
    /// Reason of an owed full scan.
    full_scan_needed: Mutex<Option<String>>,
    full_scan_requests: AtomicU64,
    escalation: Weak<dyn StorageEscalation>,
}

impl ProjectCore {
    fn require_full_scan(&self, reason: &str) {
        self.full_scan_requests.fetch_add(1, Ordering::SeqCst);
        {
            let mut needed = self.full_scan_needed.lock();
            if needed.is_none() {
                *needed = Some(reason.to_string());
            }
        }
        if let Err(error) = self.dirty.require_full_scan(reason) {
            log::warn!(
                "failed to persist full scan requirement project={} error={}",
                self.key,
                error
            );
        }
    }

    fn full_scan_completed(&self, requests_at_start: u64) {
        if self.full_scan_requests.load(Ordering::SeqCst) != requests_at_start {
            return;
        }
        *self.full_scan_needed.lock() = None;
        if let Err(error) = self.dirty.clear_full_scan_required() {
            log::warn!(
                "failed to clear full scan requirement project={} error={}",
                self.key,
                error
            );
        }
        self.machine.stamps.set_dirty_queue_complete(true);
    }

    fn config(&self) -> &IndexingConfig {
        &self.machine.config
    }

    fn scan_and_index(
        &self,
        kind: ScanKind,
        reason: &str,
        providers: Vec<ProviderRef>,
        registry: &ProviderRegistry,
        cancel: &CancellationToken,
    ) -> Result<TaskSummary> {
        let mut session = ScanningSession::new(self.config().scanning_parallelism);
        session.collect_providers(providers)?;
        self.queue.resume();
        let report = session.scan(&self.queue, cancel)?;

        let mut summary = TaskSummary {
            files_scanned: report.files_emitted,
            provider_failures: report.provider_failures.len(),
            ..TaskSummary::default()
        };
        self.progress
            .provider_failures
            .fetch_add(summary.provider_failures, Ordering::Relaxed);
        if let Some(failure) = report.provider_failures.last() {
            self.progress
                .record_error(format!("{}: {}", failure.provider, failure.reason));
        }
        match report.state {
            SessionState::Cancelled => return Err(IndexingError::Cancelled),
            SessionState::Failed => {
                return Err(IndexingError::Internal(format!(
                    "{} scan session {} failed",
                    kind.as_str(),
                    report.session_id
                )))
            }
            _ => {}
        }

        self.progress.set_state(ProjectState::Indexing);
        self.queue.flush(reason);
        let phase = IndexingPhase::new(
            &self.key,
            registry,
            &self.machine.stamps,
            &self.dirty,
            self.machine.candidate(),
            self.config().commit_batch_size,
        );
        while let Some(batch) = self.queue.take_batch() {
            let report = phase.run(batch, cancel)?;
            summary.files_indexed += report.indexed;
            summary.index_failures += report.failed;
            self.progress
                .files_indexed
                .fetch_add(report.indexed, Ordering::Relaxed);
            self.progress
                .index_failures
                .fetch_add(report.failed, Ordering::Relaxed);
            if let Some(error) = report.last_error {
                self.progress.record_error(error);
            }
            if report.cancelled {
                return Err(IndexingError::Cancelled);
            }
        }
        Ok(summary)
    }
}

impl ScanTaskRunner for ProjectCore {
    /// Moves the orphans recorded since the last visit into the dirty queue.
    fn prepare(&self, task: &ScanTask) -> Result<()> {
        let orphans = &self.machine.orphans;
        let consumed = orphans.consume(&self.key, self.dirty.orphan_cursor());
        if consumed.overflowed && task.kind == ScanKind::Partial {
            self.require_full_scan("orphan queue overflowed");
        }
        if !consumed.file_ids.is_empty() {
            log::debug!(
                "orphans consumed project={} files={} cursor={}",
                self.key,
                consumed.file_ids.len(),
                consumed.cursor
            );
            self.dirty.add_all(consumed.file_ids);
        }
        self.dirty.set_orphan_cursor(consumed.cursor);
        orphans.acknowledge(&self.key, consumed.cursor);
        Ok(())
    }

    fn run(&self, task: &ScanTask, cancel: &CancellationToken) -> Result<TaskSummary> {
        let requests_at_start = self.full_scan_requests.load(Ordering::SeqCst);
        let owed = self.full_scan_needed.lock().clone();
        let (kind, reason) = match (task.kind, owed) {
            (ScanKind::Full, _) => (ScanKind::Full, task.reason.clone()),
            (ScanKind::Partial, Some(owed)) => {
                (ScanKind::Full, format!("{}; owed full scan: {owed}", task.reason))
            }
            (ScanKind::Partial, None) => (ScanKind::Partial, task.reason.clone()),
        };

        let registry = self.machine.registry();
        let mut providers = match kind {
            ScanKind::Full => registry.list_providers(&self.providers.read()),
            ScanKind::Partial => task.providers.clone(),
        };
        let dirty_ids = self.dirty.snapshot();
        if !dirty_ids.is_empty() {
            providers.push(Arc::new(FileListProvider::new(
                format!("{}:dirty", self.key),
                OriginKind::Content,
                dirty_ids,
            )));
        }

        self.progress.set_state(ProjectState::Scanning);
        let result = self.scan_and_index(kind, &reason, providers, &registry, cancel);
        self.progress.set_state(ProjectState::Idle);
        self.progress.finish_scan();

        match &result {
            Ok(summary) => {
                let counter = match kind {
                    ScanKind::Full => {
                        self.full_scan_completed(requests_at_start);
                        &self.progress.full_scans
                    }
                    ScanKind::Partial => &self.progress.partial_scans,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "indexing scan finished project={} kind={} files={} indexed={} failures={}",
                    self.key,
                    kind.as_str(),
                    summary.files_scanned,
                    summary.files_indexed,
                    summary.index_failures
                );
            }
            Err(error) => {
                let leftover = self.queue.drain_all();
                self.dirty.add_all(leftover);
                if kind == ScanKind::Full {
                    self.require_full_scan(&reason);
                }
                if error.is_cancellation() {
                    log::debug!("indexing scan cancelled project={}", self.key);
                } else {
                    self.progress.record_error(error.to_string());
                    if error.is_storage_corruption() {
                        if let Some(escalation) = self.escalation.upgrade() {
                            escalation.storage_corrupted(&self.key, &error.to_string());
                        }
                    }
                }
            }
        }
        if let Err(error) = self.dirty.persist() {
            log::warn!(
                "dirty queue persist failed project={} error={}",
                self.key,
                error
            );
        }
        result
    }
}

/// Why a project open must full-scan, if it must.
fn open_scan_reason(
    snapshot: &DirtyQueueSnapshot,
    dirty: &DirtyFileQueue,
    config: &IndexingConfig,
) -> Option<String> {
    if snapshot.stale {
        return Some("dirty queue stale".to_string());
    }
    if !snapshot.persisted {
        return Some("first open".to_string());
    }
    if let Some(reason) = dirty.full_scan_required() {
        return Some(format!("full scan required: {reason}"));
    }
    if !config.allow_skipping_full_scan {
        return Some("project opened".to_string());
    }
    None
}

pub struct ProjectScheduler {
    core: Arc<ProjectCore>,
    executor: ScanExecutor,
}

impl ProjectScheduler {
    /// Loads the project's dirty queue and schedules its opening scan.
    pub(crate) fn open(
        key: ProjectKey,
        providers: Vec<ProviderRef>,
        machine: Arc<MachineState>,
        escalation: Weak<dyn StorageEscalation>,
        indexing_off: bool,
    ) -> Self {
        let dirty = Arc::new(DirtyFileQueue::new(
            machine.root.dirty_queue_path(&key),
            machine.vfs_epoch,
        ));
        let snapshot = dirty.load(machine.vfs_epoch);
        let full_reason = open_scan_reason(&snapshot, &dirty, &machine.config);

        let core = Arc::new(ProjectCore {
            queue: IndexingQueue::new(key.clone()),
            key,
            machine: machine.clone(),
            providers: RwLock::new(providers),
            dirty,
            progress: ProjectProgress::default(),
            full_scan_needed: Mutex::new(None),
            full_scan_requests: AtomicU64::new(0),
            escalation,
        });
        if let Some(reason) = full_reason.as_deref() {
            core.require_full_scan(reason);
        }

        let runner: Arc<dyn ScanTaskRunner> = core.clone();
        let executor = ScanExecutor::start(
            format!("project:{}", core.key),
            runner,
            machine.scan_lock.clone(),
        );
        if indexing_off {
            executor.pause(INDEXING_OFF);
            core.progress.set_state(ProjectState::Off);
        }

        log::info!(
            "project opened project={} dirty={} stale={} full_scan={}",
            core.key,
            snapshot.file_ids.len(),
            snapshot.stale,
            full_reason.as_deref().unwrap_or("no")
        );
        let request = match full_reason {
            Some(reason) => ScanRequest::full(reason),
            None => ScanRequest::partial(Vec::new(), "project opened"),
        };
        executor.submit(request);
        Self { core, executor }
    }

    pub fn key(&self) -> &ProjectKey {
        &self.core.key
    }

    pub fn submit(&self, request: ScanRequest) -> TaskHandle {
        self.executor.submit(request)
    }

    pub fn on_roots_changed(&self, scope: RootsChangedScope) -> TaskHandle {
        match scope {
            RootsChangedScope::Total => self.submit(ScanRequest::full("roots changed")),
            RootsChangedScope::Partial(providers) => {
                let names: Vec<String> = providers.iter().map(|p| p.debug_name()).collect();
                self.submit(ScanRequest::partial(
                    providers,
                    format!("roots changed {}", names.join(",")),
                ))
            }
        }
    }

    pub fn set_providers(&self, providers: Vec<ProviderRef>) {
        *self.core.providers.write() = providers;
    }

    /// Records changed files and schedules their reindexing.
    pub(crate) fn mark_dirty(&self, file_ids: &[FileId]) {
        self.core.dirty.add_all(file_ids.iter().copied());
        self.submit(ScanRequest::partial(Vec::new(), "files changed"));
    }

    pub(crate) fn require_full_scan(&self, reason: &str) {
        self.core.require_full_scan(reason);
    }

    pub fn pause(&self, reason: &str) {
        self.executor.pause(reason);
    }

    pub fn resume(&self, reason: &str) {
        self.executor.resume(reason);
    }

    /// Stops all work until [`ProjectScheduler::resume_indexing`].
    pub(crate) fn suspend(&self) {
        self.executor.pause(INDEXING_OFF);
        self.executor.cancel_all_tasks_and_wait();
        self.core.queue.cancel_all_and_wait();
        let leftover = self.core.queue.drain_all();
        self.core.dirty.add_all(leftover);
        self.core.progress.set_state(ProjectState::Off);
    }

    pub(crate) fn resume_indexing(&self, decision: &RescanDecision) {
        self.core.queue.resume();
        let request = match decision {
            RescanDecision::Full { reason } => {
                self.core.require_full_scan(reason);
                ScanRequest::full(reason.clone())
            }
            RescanDecision::Partial => ScanRequest::partial(Vec::new(), "indexing turned on"),
        };
        self.submit(request);
        self.core.progress.set_state(ProjectState::Idle);
        self.executor.resume(INDEXING_OFF);
    }

    pub fn dirty_files(&self) -> Vec<FileId> {
        self.core.dirty.snapshot()
    }

    pub fn owes_full_scan(&self) -> bool {
        self.core.full_scan_needed.lock().is_some()
    }

    pub(crate) fn persist(&self) -> Result<bool> {
        self.core.dirty.persist()
    }

    pub fn status(&self) -> ProjectStatus {
        let mut status = ProjectStatus::capture(
            &self.core.progress,
            self.core.dirty.len(),
            self.core.queue.queued_len(),
        );
        if status.state == ProjectState::Idle && self.executor.is_paused() {
            status.state = ProjectState::Paused;
        }
        if status.state == ProjectState::Idle && self.executor.is_busy() {
            status.state = ProjectState::Scanning;
        }
        status
    }

    pub fn is_busy(&self) -> bool {
        self.executor.is_busy()
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.executor.wait_idle(timeout)
    }

    /// Stops the executor and persists the dirty queue with the orphan
    /// cursor at `orphan_cursor`.
    pub(crate) fn close(&self, orphan_cursor: u64) -> Result<()> {
        self.executor.shutdown();
        let leftover = self.core.queue.drain_all();
        self.core.dirty.add_all(leftover);
        self.core.dirty.set_orphan_cursor(orphan_cursor);
        self.core
            .machine
            .orphans
            .acknowledge(&self.core.key, orphan_cursor);
        self.core.dirty.persist()?;
        log::info!(
            "project closed project={} dirty={}",
            self.core.key,
            self.core.dirty.len()
        );
        Ok(())
    }
}
