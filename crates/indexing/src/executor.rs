//! Single-flight scan/index scheduler of one project.
//!
//! Requests are coalesced into at most one pending task while at most one
//! task runs. A task only starts after taking the machine-wide scan lock,
//! which is held for its start-up section ([`ScanTaskRunner::prepare`]) and
//! released before the body runs.

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancellationToken;
use crate::error::{panic_message, Result};
use crate::provider::ProviderRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    Full,
    Partial,
}

impl ScanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
        }
    }
}

#[derive(Clone)]
pub enum ScanRequest {
    Full { reason: String },
    Partial { providers: Vec<ProviderRef>, reason: String },
}

impl ScanRequest {
    pub fn full(reason: impl Into<String>) -> Self {
        Self::Full {
            reason: reason.into(),
        }
    }

    pub fn partial(providers: Vec<ProviderRef>, reason: impl Into<String>) -> Self {
        Self::Partial {
            providers,
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for ScanRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { reason } => f.debug_struct("Full").field("reason", reason).finish(),
            Self::Partial { providers, reason } => f
                .debug_struct("Partial")
                .field("providers", &provider_names(providers))
                .field("reason", reason)
                .finish(),
        }
    }
}

/// The coalesced unit of work handed to the runner.
#[derive(Clone)]
pub struct ScanTask {
    pub id: u64,
    pub kind: ScanKind,
    pub reason: String,
    /// Providers of a partial scan; empty for full scans.
    pub providers: Vec<ProviderRef>,
}

impl fmt::Debug for ScanTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanTask")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("reason", &self.reason)
            .field("providers", &provider_names(&self.providers))
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSummary {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub provider_failures: usize,
    pub index_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(TaskSummary),
    Cancelled,
    Failed(String),
    /// The executor shut down before the task started.
    Discarded,
}

/// Body of the tasks an executor runs.
pub trait ScanTaskRunner: Send + Sync {
    /// Runs while the shared scan lock is held.
    fn prepare(&self, _task: &ScanTask) -> Result<()> {
        Ok(())
    }

    fn run(&self, task: &ScanTask, cancel: &CancellationToken) -> Result<TaskSummary>;
}

#[derive(Debug, Default)]
struct HandleSlot {
    outcome: Mutex<Option<TaskOutcome>>,
    resolved: Condvar,
}

impl HandleSlot {
    fn resolve(&self, outcome: TaskOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.resolved.notify_all();
        }
    }
}

/// Completion of a submitted request. Requests absorbed into another task
/// resolve with that task's outcome.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    slot: Arc<HandleSlot>,
}

impl TaskHandle {
    pub fn wait(&self) -> TaskOutcome {
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            self.slot.resolved.wait(&mut outcome);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.slot.outcome.lock();
        while outcome.is_none() {
            if self
                .slot
                .resolved
                .wait_until(&mut outcome, deadline)
                .timed_out()
            {
                break;
            }
        }
        outcome.clone()
    }

    pub fn try_outcome(&self) -> Option<TaskOutcome> {
        self.slot.outcome.lock().clone()
    }
}

struct PendingTask {
    kind: ScanKind,
    reasons: Vec<String>,
    providers: Vec<ProviderRef>,
    handles: Vec<Arc<HandleSlot>>,
}

impl PendingTask {
    fn reason(&self) -> String {
        self.reasons.join("; ")
    }
}

struct RunningTask {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ExecutorState {
    pending: Option<PendingTask>,
    running: Option<RunningTask>,
    pause_reasons: BTreeSet<String>,
    shutdown: bool,
}

struct ExecutorInner {
    name: String,
    state: Mutex<ExecutorState>,
    changed: Condvar,
    scan_lock: Arc<Mutex<()>>,
    runner: Arc<dyn ScanTaskRunner>,
    next_task_id: AtomicU64,
}

pub struct ScanExecutor {
    inner: Arc<ExecutorInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanExecutor {
    pub fn start(
        name: impl Into<String>,
        runner: Arc<dyn ScanTaskRunner>,
        scan_lock: Arc<Mutex<()>>,
    ) -> Self {
        let inner = Arc::new(ExecutorInner {
            name: name.into(),
            state: Mutex::new(ExecutorState::default()),
            changed: Condvar::new(),
            scan_lock,
            runner,
            next_task_id: AtomicU64::new(1),
        });
        let worker_inner = inner.clone();
        let worker = thread::Builder::new()
            .name(format!("indexing-executor-{}", inner.name))
            .spawn(move || worker_loop(&worker_inner));
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(error) => {
                log::error!(
                    "failed to spawn indexing executor name={}: {}",
                    inner.name,
                    error
                );
                inner.state.lock().shutdown = true;
                None
            }
        };
        Self {
            inner,
            worker: Mutex::new(worker),
        }
    }

    /// Queues `request`, coalescing it with the pending task.
    pub fn submit(&self, request: ScanRequest) -> TaskHandle {
        let slot = Arc::new(HandleSlot::default());
        let handle = TaskHandle { slot: slot.clone() };
        let mut state = self.inner.state.lock();
        if state.shutdown {
            slot.resolve(TaskOutcome::Discarded);
            return handle;
        }

        let pending = state.pending.take();
        state.pending = Some(match (request, pending) {
            (ScanRequest::Full { reason }, pending) => {
                let mut handles = pending.map(|task| task.handles).unwrap_or_default();
                handles.push(slot);
                PendingTask {
                    kind: ScanKind::Full,
                    reasons: vec![reason],
                    providers: Vec::new(),
                    handles,
                }
            }
            (ScanRequest::Partial { providers, reason }, None) => PendingTask {
                kind: ScanKind::Partial,
                reasons: vec![reason],
                providers: union_providers(Vec::new(), providers),
                handles: vec![slot],
            },
            (ScanRequest::Partial { providers, reason }, Some(mut task)) => {
                if task.kind == ScanKind::Partial {
                    task.providers =
                        union_providers(std::mem::take(&mut task.providers), providers);
                    task.reasons.push(reason);
                }
                task.handles.push(slot);
                task
            }
        });
        if let Some(task) = state.pending.as_ref() {
            log::debug!(
                "scan request queued executor={} kind={} reason={} coalesced={}",
                self.inner.name,
                task.kind.as_str(),
                task.reason(),
                task.handles.len()
            );
        }
        self.inner.changed.notify_all();
        handle
    }

    pub fn pause(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::debug!("executor paused name={} reason={}", self.inner.name, reason);
        self.inner.state.lock().pause_reasons.insert(reason);
    }

    pub fn resume(&self, reason: &str) {
        let mut state = self.inner.state.lock();
        if state.pause_reasons.remove(reason) {
            log::debug!("executor resumed name={} reason={}", self.inner.name, reason);
            self.inner.changed.notify_all();
        }
    }

    pub fn pause_reasons(&self) -> Vec<String> {
        self.inner.state.lock().pause_reasons.iter().cloned().collect()
    }

    pub fn is_paused(&self) -> bool {
        !self.inner.state.lock().pause_reasons.is_empty()
    }

    /// Cancels the running task and blocks until it stopped. The pending
    /// task stays queued.
    pub fn cancel_all_tasks_and_wait(&self) {
        let mut state = self.inner.state.lock();
        if let Some(running) = state.running.as_ref() {
            log::debug!(
                "cancelling task executor={} task={}",
                self.inner.name,
                running.id
            );
            running.cancel.cancel();
        }
        while state.running.is_some() {
            self.inner.changed.wait(&mut state);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    pub fn is_busy(&self) -> bool {
        let state = self.inner.state.lock();
        state.running.is_some() || state.pending.is_some()
    }

    /// Waits until nothing runs and nothing runnable is pending.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            let runnable = state.pending.is_some() && state.pause_reasons.is_empty();
            if state.running.is_none() && !runnable {
                return true;
            }
            if self
                .inner
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return false;
            }
        }
    }

    /// Stops the worker; a pending task resolves as discarded.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            if let Some(running) = state.running.as_ref() {
                running.cancel.cancel();
            }
            self.inner.changed.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("executor worker panicked name={}", self.inner.name);
            }
        }
    }
}

impl Drop for ScanExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &ExecutorInner) {
    loop {
        let (task, cancel, handles) = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    if let Some(task) = state.pending.take() {
                        for handle in task.handles {
                            handle.resolve(TaskOutcome::Discarded);
                        }
                    }
                    return;
                }
                if state.pause_reasons.is_empty() && state.pending.is_some() {
                    break;
                }
                inner.changed.wait(&mut state);
            }
            let Some(pending) = state.pending.take() else {
                continue;
            };
            let task = ScanTask {
                id: inner.next_task_id.fetch_add(1, Ordering::SeqCst),
                kind: pending.kind,
                reason: pending.reason(),
                providers: pending.providers,
            };
            let cancel = CancellationToken::new();
            state.running = Some(RunningTask {
                id: task.id,
                cancel: cancel.clone(),
            });
            (task, cancel, pending.handles)
        };

        let outcome = run_task(inner, &task, &cancel);
        for handle in handles {
            handle.resolve(outcome.clone());
        }

        let mut state = inner.state.lock();
        state.running = None;
        inner.changed.notify_all();
    }
}

fn run_task(inner: &ExecutorInner, task: &ScanTask, cancel: &CancellationToken) -> TaskOutcome {
    let started = Instant::now();
    log::info!(
        "scan task started executor={} task={} kind={} reason={}",
        inner.name,
        task.id,
        task.kind.as_str(),
        task.reason
    );
    let result = catch_unwind(AssertUnwindSafe(|| {
        {
            let _scan_guard = inner.scan_lock.lock();
            cancel.check()?;
            inner.runner.prepare(task)?;
        }
        inner.runner.run(task, cancel)
    }));

    let outcome = match result {
        Ok(Ok(summary)) => TaskOutcome::Completed(summary),
        Ok(Err(error)) if error.is_cancellation() => TaskOutcome::Cancelled,
        Ok(Err(error)) => {
            log::error!(
                "scan task failed executor={} task={} error={}",
                inner.name,
                task.id,
                error
            );
            TaskOutcome::Failed(error.to_string())
        }
        Err(payload) => {
            let message = format!("panicked: {}", panic_message(payload.as_ref()));
            log::error!(
                "scan task failed executor={} task={} error={}",
                inner.name,
                task.id,
                message
            );
            TaskOutcome::Failed(message)
        }
    };
    log::info!(
        "scan task finished executor={} task={} outcome={:?} elapsed_ms={}",
        inner.name,
        task.id,
        outcome,
        started.elapsed().as_millis()
    );
    outcome
}

fn union_providers(mut existing: Vec<ProviderRef>, incoming: Vec<ProviderRef>) -> Vec<ProviderRef> {
    let mut names: Vec<String> = existing.iter().map(|provider| provider.debug_name()).collect();
    for provider in incoming {
        let name = provider.debug_name();
        if !names.contains(&name) {
            names.push(name);
            existing.push(provider);
        }
    }
    existing
}

fn provider_names(providers: &[ProviderRef]) -> Vec<String> {
    providers.iter().map(|provider| provider.debug_name()).collect()
}
