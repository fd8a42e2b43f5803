//! One enumeration pass over a project's file-set providers.
//!
//! A session is single use: [`ScanningSession::scan`] consumes it. Workers
//! of a bounded rayon pool pull providers from a crossbeam channel and push
//! every newly seen file into the project's [`IndexingQueue`]. A failing or
//! panicking provider only loses its own contribution.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::unbounded;
use fnv::FnvHashSet;
use parking_lot::Mutex;

use crate::cancel::CancellationToken;
use crate::error::{panic_message, IndexingError, Result};
use crate::provider::ProviderRef;
use crate::queue::IndexingQueue;
use crate::types::{FileId, OriginKind};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    CollectingProviders,
    Scanning,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::CollectingProviders => "collecting_providers",
            Self::Scanning => "scanning",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub session_id: u64,
    pub state: SessionState,
    pub providers: usize,
    pub files_emitted: usize,
    pub duplicates_skipped: usize,
    pub provider_failures: Vec<ProviderFailure>,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct ScanShared {
    seen: Mutex<FnvHashSet<FileId>>,
    emitted: AtomicUsize,
    duplicates: AtomicUsize,
    cancelled: AtomicBool,
    failures: Mutex<Vec<ProviderFailure>>,
    queue_failure: Mutex<Option<String>>,
}

pub struct ScanningSession {
    id: u64,
    state: SessionState,
    parallelism: usize,
    providers: Vec<ProviderRef>,
}

impl ScanningSession {
    pub fn new(parallelism: usize) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            state: SessionState::Created,
            parallelism: parallelism.max(1),
            providers: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Fixes the provider list. SDK roots go last; the relative order of
    /// everything else is kept.
    pub fn collect_providers(&mut self, mut providers: Vec<ProviderRef>) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(IndexingError::Internal(format!(
                "session {} cannot collect providers in state {}",
                self.id,
                self.state.as_str()
            )));
        }
        self.state = SessionState::CollectingProviders;
        providers.sort_by_key(|provider| provider.origin() == OriginKind::Sdk);
        self.providers = providers;
        Ok(())
    }

    pub fn providers(&self) -> &[ProviderRef] {
        &self.providers
    }

    pub fn scan(
        mut self,
        queue: &Arc<IndexingQueue>,
        cancel: &CancellationToken,
    ) -> Result<ScanReport> {
        if self.state != SessionState::CollectingProviders {
            return Err(IndexingError::Internal(format!(
                "session {} cannot scan in state {}",
                self.id,
                self.state.as_str()
            )));
        }
        self.state = SessionState::Scanning;
        let started = Instant::now();
        let workers = self.parallelism.min(self.providers.len()).max(1);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("indexing-scan-{index}"))
            .build()
            .map_err(|error| IndexingError::Internal(format!("scan pool: {error}")))?;

        let (provider_tx, provider_rx) = unbounded::<ProviderRef>();
        for provider in &self.providers {
            // The receiver is alive until the scope below ends.
            let _ = provider_tx.send(provider.clone());
        }
        drop(provider_tx);

        let shared = ScanShared::default();
        pool.scope(|scope| {
            for _ in 0..workers {
                let provider_rx = provider_rx.clone();
                let shared = &shared;
                scope.spawn(move |_| {
                    while let Ok(provider) = provider_rx.recv() {
                        if cancel.is_cancelled() || shared.cancelled.load(Ordering::SeqCst) {
                            shared.cancelled.store(true, Ordering::SeqCst);
                            break;
                        }
                        scan_provider(&provider, queue, cancel, shared);
                    }
                });
            }
        });

        if cancel.is_cancelled() {
            shared.cancelled.store(true, Ordering::SeqCst);
        }
        let failures = std::mem::take(&mut *shared.failures.lock());
        let queue_failure = shared.queue_failure.lock().take();
        self.state = if let Some(reason) = queue_failure {
            log::error!("scan session {} failed: {}", self.id, reason);
            SessionState::Failed
        } else if shared.cancelled.load(Ordering::SeqCst) {
            SessionState::Cancelled
        } else if !self.providers.is_empty() && failures.len() == self.providers.len() {
            SessionState::Failed
        } else {
            SessionState::Completed
        };

        let report = ScanReport {
            session_id: self.id,
            state: self.state,
            providers: self.providers.len(),
            files_emitted: shared.emitted.load(Ordering::SeqCst),
            duplicates_skipped: shared.duplicates.load(Ordering::SeqCst),
            provider_failures: failures,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        log::info!(
            "scan session finished id={} state={} providers={} files={} duplicates={} failures={} elapsed_ms={}",
            report.session_id,
            report.state.as_str(),
            report.providers,
            report.files_emitted,
            report.duplicates_skipped,
            report.provider_failures.len(),
            report.elapsed_ms
        );
        Ok(report)
    }
}

fn scan_provider(
    provider: &ProviderRef,
    queue: &Arc<IndexingQueue>,
    cancel: &CancellationToken,
    shared: &ScanShared,
) {
    let name = provider.debug_name();
    let mut sink = queue.sink(name.clone());
    let result = catch_unwind(AssertUnwindSafe(|| {
        provider.iterate(
            &mut |file_id| {
                cancel.check()?;
                if !shared.seen.lock().insert(file_id) {
                    shared.duplicates.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                if let Err(error) = sink.add(file_id) {
                    if !error.is_cancellation() {
                        *shared.queue_failure.lock() = Some(error.to_string());
                    }
                    return Err(error);
                }
                shared.emitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            cancel,
        )
    }));
    let added = sink.added();
    sink.close();

    let reason = match result {
        Ok(Ok(())) => {
            log::debug!("provider scanned name={} files={}", name, added);
            return;
        }
        Ok(Err(error)) if error.is_cancellation() => {
            log::debug!("provider cancelled name={} files={}", name, added);
            shared.cancelled.store(true, Ordering::SeqCst);
            return;
        }
        Ok(Err(error)) => error.to_string(),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    log::warn!("provider failed name={} files={} reason={}", name, added, reason);
    shared.failures.lock().push(ProviderFailure {
        provider: name,
        reason,
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::provider::{FileListProvider, FileSetProvider, FileVisitor};
    use crate::types::ProjectKey;

    pub(crate) fn list(name: &str, origin: OriginKind, raw: &[i32]) -> ProviderRef {
        Arc::new(FileListProvider::new(
            name,
            origin,
            raw.iter().copied().map(FileId::new).collect(),
        ))
    }

    struct ExplodingProvider {
        panic: bool,
    }

    impl FileSetProvider for ExplodingProvider {
        fn iterate(
            &self,
            visitor: &mut FileVisitor<'_>,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            visitor(FileId::new(100))?;
            if self.panic {
                panic!("provider exploded");
            }
            Err(IndexingError::Provider {
                provider: self.debug_name(),
                reason: "permission denied".to_string(),
            })
        }

        fn debug_name(&self) -> String {
            format!("exploding-{}", self.panic)
        }

        fn origin(&self) -> OriginKind {
            OriginKind::Library
        }
    }

    struct CancellingProvider {
        cancel: CancellationToken,
    }

    impl FileSetProvider for CancellingProvider {
        fn iterate(&self, visitor: &mut FileVisitor<'_>, cancel: &CancellationToken) -> Result<()> {
            visitor(FileId::new(1))?;
            self.cancel.cancel();
            cancel.check()?;
            visitor(FileId::new(2))
        }

        fn debug_name(&self) -> String {
            "cancelling".to_string()
        }

        fn origin(&self) -> OriginKind {
            OriginKind::Content
        }
    }

    fn queued(queue: &IndexingQueue) -> Vec<FileId> {
        queue.flush("test");
        queue
            .take_batch()
            .map(|batch| batch.file_ids)
            .unwrap_or_default()
    }

    #[test]
    fn sdk_providers_are_scheduled_last() {
        let mut session = ScanningSession::new(2);
        session
            .collect_providers(vec![
                list("jdk", OriginKind::Sdk, &[]),
                list("src", OriginKind::Content, &[]),
                list("deps", OriginKind::Library, &[]),
                list("tests", OriginKind::Content, &[]),
            ])
            .expect("collect");
        let names: Vec<String> = session.providers().iter().map(|p| p.debug_name()).collect();
        assert_eq!(names, vec!["src", "deps", "tests", "jdk"]);
    }

    #[test]
    fn file_reachable_from_two_providers_is_emitted_once() {
        let queue = IndexingQueue::new(ProjectKey::new("p"));
        let mut session = ScanningSession::new(4);
        session
            .collect_providers(vec![
                list("src", OriginKind::Content, &[1, 42]),
                list("symlinked-lib", OriginKind::Library, &[42, 7]),
            ])
            .expect("collect");

        let report = session.scan(&queue, &CancellationToken::noop()).expect("scan");
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.files_emitted, 3);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(
            queued(&queue),
            vec![FileId::new(1), FileId::new(7), FileId::new(42)]
        );
    }

    #[test]
    fn provider_failures_are_isolated() {
        let queue = IndexingQueue::new(ProjectKey::new("p"));
        let mut session = ScanningSession::new(3);
        session
            .collect_providers(vec![
                Arc::new(ExplodingProvider { panic: false }),
                Arc::new(ExplodingProvider { panic: true }),
                list("src", OriginKind::Content, &[5]),
            ])
            .expect("collect");

        let report = session.scan(&queue, &CancellationToken::noop()).expect("scan");
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.provider_failures.len(), 2);
        assert!(report
            .provider_failures
            .iter()
            .any(|failure| failure.reason.contains("provider exploded")));
        assert_eq!(queued(&queue), vec![FileId::new(5), FileId::new(100)]);
        assert_eq!(queue.open_sinks(), 0);
    }

    #[test]
    fn all_providers_failing_fails_the_session() {
        let queue = IndexingQueue::new(ProjectKey::new("p"));
        let mut session = ScanningSession::new(1);
        session
            .collect_providers(vec![Arc::new(ExplodingProvider { panic: false })])
            .expect("collect");
        let report = session.scan(&queue, &CancellationToken::noop()).expect("scan");
        assert_eq!(report.state, SessionState::Failed);
    }

    #[test]
    fn cancellation_keeps_files_already_pushed() {
        let queue = IndexingQueue::new(ProjectKey::new("p"));
        let cancel = CancellationToken::new();
        let mut session = ScanningSession::new(1);
        session
            .collect_providers(vec![
                Arc::new(CancellingProvider {
                    cancel: cancel.clone(),
                }),
                list("after", OriginKind::Sdk, &[9]),
            ])
            .expect("collect");

        let report = session.scan(&queue, &cancel).expect("scan");
        assert_eq!(report.state, SessionState::Cancelled);
        assert!(report.provider_failures.is_empty());
        assert_eq!(queued(&queue), vec![FileId::new(1)]);
    }

    #[test]
    fn sessions_are_single_use_and_ordered() {
        let mut first = ScanningSession::new(1);
        let second = ScanningSession::new(1);
        assert!(second.id() > first.id());
        first.collect_providers(Vec::new()).expect("collect");
        assert!(first.collect_providers(Vec::new()).is_err());
        assert!(ScanningSession::new(1)
            .scan(&IndexingQueue::new(ProjectKey::new("p")), &CancellationToken::noop())
            .is_err());
    }
}
