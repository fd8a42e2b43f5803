//! Machine-level root of the scheduler.
//!
//! [`IndexingService`] owns the state every project shares: the stamp
//! store, the orphan queue, the version bookkeeping and the tumbler. It
//! opens and closes [`ProjectScheduler`]s, routes change notifications and
//! implements the operator actions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::{load_or_create_config, IndexingConfig};
use crate::dirty::mark_full_scan_required;
use crate::error::{IndexingError, Result};
use crate::executor::{ScanRequest, TaskHandle};
use crate::layout::IndexRoot;
use crate::orphan::OrphanQueue;
use crate::persist::{spawn_flush_worker, FlushWorkerHandle};
use crate::project::{ProjectScheduler, StorageEscalation};
use crate::provider::{ProviderRef, ProviderRegistry};
use crate::stamp::{IndexingStamp, StampStore, VersionMask};
use crate::status::ProjectStatus;
use crate::tumbler::{RescanDecision, Tumbler, TumblerState, TumblerTarget};
use crate::types::{FileId, ProjectKey, RootsChangedScope, VfsEpoch};
use crate::version::{
    load_versions, save_versions, IndexIdRegistry, PersistedVersions, VersionSnapshot,
};

/// Outcome of an operator action. Empty `problems` means success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionReport {
    pub problems: Vec<String>,
}

impl ActionReport {
    pub fn is_success(&self) -> bool {
        self.problems.is_empty()
    }

    fn push(&mut self, problem: impl Into<String>) {
        self.problems.push(problem.into());
    }
}

#[derive(Debug)]
struct VersionState {
    index_ids: IndexIdRegistry,
    persisted: Option<PersistedVersions>,
    candidate: IndexingStamp,
}

/// Storage and settings shared by all projects.
pub(crate) struct MachineState {
    pub(crate) root: IndexRoot,
    pub(crate) config: IndexingConfig,
    pub(crate) vfs_epoch: VfsEpoch,
    pub(crate) stamps: Arc<StampStore>,
    pub(crate) orphans: OrphanQueue,
    pub(crate) scan_lock: Arc<Mutex<()>>,
    registry: RwLock<Arc<ProviderRegistry>>,
    versions: Mutex<VersionState>,
}

impl MachineState {
    pub(crate) fn registry(&self) -> Arc<ProviderRegistry> {
        self.registry.read().clone()
    }

    /// Stamp a file needs to count as fresh for every registered extractor.
    pub(crate) fn candidate(&self) -> IndexingStamp {
        self.versions.lock().candidate
    }

    /// Brings slots and generations in line with the registry and persists
    /// them. Returns what changed since the persisted snapshot.
    fn reconcile_versions(&self) -> Result<Vec<String>> {
        let registry = self.registry();
        let current = registry.version_snapshot();
        let names = registry.extractor_names();
        let mut versions = self.versions.lock();

        for name in &names {
            versions.index_ids.slot_for(name)?;
        }
        versions.index_ids.save()?;

        let previous = versions.persisted.clone();
        let changes = match previous.as_ref() {
            Some(previous) => current.diff(&previous.snapshot),
            None => vec!["no recorded index versions".to_string()],
        };
        let mut generations = previous
            .as_ref()
            .map(|previous| previous.generations.clone())
            .unwrap_or_default();
        let bumped = generations.reconcile(
            previous.as_ref().map(|previous| &previous.snapshot),
            &current,
            || self.stamps.advance_generation(),
        );
        if !bumped.is_empty() {
            log::info!("index generations advanced extractors={}", bumped.join(","));
            self.stamps.flush()?;
        }

        let persisted = PersistedVersions {
            snapshot: current,
            generations,
        };
        save_versions(&self.root.versions_path(), &persisted)?;
        versions.candidate = IndexingStamp::new(
            persisted
                .generations
                .required_generation(names.iter().map(String::as_str)),
            versions.index_ids.mask_of(names.iter().map(String::as_str)),
        );
        versions.persisted = Some(persisted);
        Ok(changes)
    }

    fn forget_versions(&self) {
        self.versions.lock().persisted = None;
    }
}

struct ServiceShared {
    machine: Arc<MachineState>,
    tumbler: Tumbler,
    projects: RwLock<BTreeMap<ProjectKey, Arc<ProjectScheduler>>>,
    recovery: Mutex<()>,
    self_ref: Weak<ServiceShared>,
}

impl ServiceShared {
    /// Copy of the open projects, so no lock is held while they block.
    fn open_projects(&self) -> Vec<Arc<ProjectScheduler>> {
        self.projects.read().values().cloned().collect()
    }

    fn escalation(&self) -> Weak<dyn StorageEscalation> {
        self.self_ref.clone()
    }

    /// Records a full-scan requirement for every project, open or not.
    fn require_full_scan_everywhere(&self, reason: &str) -> Result<()> {
        for project in self.open_projects() {
            project.require_full_scan(reason);
        }
        for path in self.machine.root.dirty_queue_paths() {
            mark_full_scan_required(&path, reason)?;
        }
        Ok(())
    }

    fn recover_storage(&self, reason: &str) -> Result<()> {
        let _recovery = self.recovery.lock();
        let machine = &self.machine;
        machine.root.write_corruption_marker(reason)?;
        if let Some(problem) = machine.stamps.reload()? {
            log::error!("stamp store recreated during recovery: {}", problem);
        }
        machine.stamps.invalidate_all(reason);
        machine.stamps.set_dirty_queue_complete(false);
        machine.stamps.flush()?;
        self.require_full_scan_everywhere(reason)?;
        machine.root.clear_corruption_marker()?;

        for project in self.open_projects() {
            project.submit(ScanRequest::full(format!("storage recovered: {reason}")));
        }
        Ok(())
    }

    /// Persists dirty queues, the orphan queue and pending stamps.
    fn persist_all(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for project in self.open_projects() {
            if let Err(error) = project.persist() {
                problems.push(format!("dirty queue of {}: {error}", project.key()));
            }
        }
        if let Err(error) = self.machine.orphans.persist() {
            problems.push(format!("orphan queue: {error}"));
        }
        if let Err(error) = self.machine.stamps.flush() {
            problems.push(format!("stamp store: {error}"));
        }
        problems
    }
}

impl StorageEscalation for ServiceShared {
    fn storage_corrupted(&self, project: &ProjectKey, reason: &str) {
        log::error!(
            "index storage corrupted, rebuilding project={} reason={}",
            project,
            reason
        );
        if let Err(error) = self.recover_storage(reason) {
            log::error!("index storage recovery failed: {}", error);
        }
    }
}

impl TumblerTarget for ServiceShared {
    fn suspend(&self, _reason: &str) {
        for project in self.open_projects() {
            project.suspend();
        }
    }

    fn version_snapshot(&self) -> VersionSnapshot {
        self.machine.registry().version_snapshot()
    }

    fn release_storage(&self) -> Result<()> {
        let problems = self.persist_all();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(IndexingError::Internal(problems.join("; ")))
        }
    }

    fn reload_storage(&self) -> Result<()> {
        let machine = &self.machine;
        let recreated = machine.stamps.reload()?;
        machine.root.begin_session()?;
        machine.reconcile_versions()?;
        match recreated {
            Some(problem) => Err(IndexingError::corruption(machine.stamps.path(), problem)),
            None => Ok(()),
        }
    }

    fn resume(&self, decision: &RescanDecision) {
        if let RescanDecision::Full { reason } = decision {
            if let Err(error) = self.require_full_scan_everywhere(reason) {
                log::warn!("failed to record full scan requirement: {}", error);
            }
        }
        for project in self.open_projects() {
            project.resume_indexing(decision);
        }
    }
}

/// Entry point the host embeds: one instance per index root.
pub struct IndexingService {
    shared: Arc<ServiceShared>,
    flush_worker: Mutex<Option<FlushWorkerHandle>>,
}

impl IndexingService {
    /// Opens the index root at `root_dir`, creating `indexing.json` with
    /// defaults when it does not exist.
    pub fn open(
        root_dir: impl AsRef<Path>,
        registry: ProviderRegistry,
        vfs_epoch: VfsEpoch,
    ) -> Result<Self> {
        let config = load_or_create_config(root_dir.as_ref())?;
        Self::open_with_config(root_dir, registry, vfs_epoch, config)
    }

    pub fn open_with_config(
        root_dir: impl AsRef<Path>,
        registry: ProviderRegistry,
        vfs_epoch: VfsEpoch,
        config: IndexingConfig,
    ) -> Result<Self> {
        let started = Instant::now();
        let machine = Arc::new(open_machine(
            root_dir.as_ref().to_path_buf(),
            registry,
            vfs_epoch,
            config.normalized(),
        )?);
        let shared = Arc::new_cyclic(|self_ref| ServiceShared {
            tumbler: Tumbler::new(machine.root.clone()),
            machine: machine.clone(),
            projects: RwLock::new(BTreeMap::new()),
            recovery: Mutex::new(()),
            self_ref: self_ref.clone(),
        });

        let worker_shared = shared.clone();
        let flush_worker = spawn_flush_worker(
            Duration::from_millis(machine.config.flush_interval_ms),
            move || {
                for problem in worker_shared.persist_all() {
                    log::warn!("indexing background persist failed: {}", problem);
                }
            },
        );

        log::info!(
            "indexing service opened root={} vfs_epoch={} parallelism={} elapsed_ms={}",
            machine.root.dir().display(),
            vfs_epoch.0,
            machine.config.scanning_parallelism,
            started.elapsed().as_millis()
        );
        Ok(Self {
            shared,
            flush_worker: Mutex::new(Some(flush_worker)),
        })
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.shared.machine.config
    }

    pub fn root(&self) -> &IndexRoot {
        &self.shared.machine.root
    }

    pub fn open_project(&self, key: ProjectKey, providers: Vec<ProviderRef>) -> Result<()> {
        let mut projects = self.shared.projects.write();
        if projects.contains_key(&key) {
            return Err(IndexingError::InvalidInput(format!(
                "project {key} is already open"
            )));
        }
        let indexing_off = self.shared.tumbler.state() != TumblerState::On;
        let project = ProjectScheduler::open(
            key.clone(),
            providers,
            self.shared.machine.clone(),
            self.shared.escalation(),
            indexing_off,
        );
        projects.insert(key, Arc::new(project));
        Ok(())
    }

    /// Stops the project's work and persists its dirty files. Changes seen
    /// after this call go to the orphan queue.
    pub fn close_project(&self, key: &ProjectKey) -> Result<()> {
        let (project, cursor) = {
            let mut projects = self.shared.projects.write();
            let project = projects
                .remove(key)
                .ok_or_else(|| IndexingError::InvalidInput(format!("project {key} is not open")))?;
            (project, self.shared.machine.orphans.end_position())
        };
        project.close(cursor)
    }

    pub fn project_keys(&self) -> Vec<ProjectKey> {
        self.shared.projects.read().keys().cloned().collect()
    }

    /// Marks `file_ids` dirty in every open project and records them for the
    /// closed ones. Stamp invalidations are durable when this returns.
    pub fn on_files_changed(&self, file_ids: &[FileId]) -> Result<()> {
        if file_ids.is_empty() {
            return Ok(());
        }
        let machine = &self.shared.machine;
        let result = {
            let projects = self.shared.projects.read();
            // Stamps go first so a worker ticketing the file never sees it fresh.
            let invalidated = file_ids
                .iter()
                .try_for_each(|&file_id| machine.stamps.invalidate(file_id))
                .and_then(|()| machine.stamps.flush());
            for project in projects.values() {
                project.mark_dirty(file_ids);
            }
            machine.orphans.append(file_ids);
            invalidated
        };
        log::debug!("files changed count={}", file_ids.len());
        if let Err(error) = &result {
            if error.is_storage_corruption() {
                self.shared.storage_corrupted(&ProjectKey::new("*"), &error.to_string());
            }
        }
        result
    }

    pub fn on_roots_changed(
        &self,
        key: &ProjectKey,
        scope: RootsChangedScope,
    ) -> Result<TaskHandle> {
        let project = self.project(key)?;
        log::info!("roots changed project={} scope={:?}", key, scope);
        Ok(project.on_roots_changed(scope))
    }

    pub fn set_project_providers(
        &self,
        key: &ProjectKey,
        providers: Vec<ProviderRef>,
    ) -> Result<()> {
        self.project(key)?.set_providers(providers);
        Ok(())
    }

    pub fn turn_off(&self, reason: &str) {
        self.shared.tumbler.turn_off(reason, self.shared.as_ref());
    }

    pub fn turn_on(&self) -> Result<Option<RescanDecision>> {
        self.shared.tumbler.turn_on(self.shared.as_ref())
    }

    pub fn tumbler_state(&self) -> TumblerState {
        self.shared.tumbler.state()
    }

    /// Replaces the registry, e.g. after a plugin changed its extractors.
    /// Only allowed while indexing is off.
    pub fn set_registry(&self, registry: ProviderRegistry) -> Result<()> {
        if self.shared.tumbler.state() != TumblerState::Off {
            return Err(IndexingError::InvalidInput(
                "the registry can only change while indexing is off".to_string(),
            ));
        }
        *self.shared.machine.registry.write() = Arc::new(registry);
        Ok(())
    }

    /// Marks indexes inconsistent: every stamp is forgotten and every
    /// project owes a full scan, now and after a crash.
    pub fn require_invalidation(&self, reason: &str) -> Result<()> {
        let machine = &self.shared.machine;
        self.shared.tumbler.require_invalidation(reason)?;
        machine.stamps.invalidate_all(reason);
        machine.stamps.flush()?;
        self.shared.require_full_scan_everywhere(reason)
    }

    /// Operator action: forget all stamps and rebuild every index.
    pub fn reindex(&self) -> ActionReport {
        let mut report = ActionReport::default();
        if let Err(error) = self.require_invalidation("reindex requested") {
            report.push(format!("invalidation failed: {error}"));
        }
        self.turn_off("reindex requested");
        match self.turn_on() {
            Ok(Some(RescanDecision::Full { .. })) => {}
            Ok(Some(RescanDecision::Partial)) => {
                report.push("reindex did not schedule a full rescan")
            }
            Ok(None) => report.push("indexing stays off: another component turned it off"),
            Err(error) => report.push(error.to_string()),
        }
        report
    }

    /// Operator action: full scan of every open project, keeping stamps.
    pub fn rescan(&self) -> ActionReport {
        let mut report = ActionReport::default();
        if self.shared.tumbler.state() != TumblerState::On {
            report.push("indexing is off; the rescan runs when it is turned on");
        }
        for project in self.shared.open_projects() {
            project.submit(ScanRequest::full("rescan requested"));
        }
        report
    }

    /// Operator action: delete index storage and rebuild from scratch.
    pub fn drop_indexes(&self) -> ActionReport {
        let mut report = ActionReport::default();
        self.turn_off("drop indexes");
        match self.shared.tumbler.drop_indexes() {
            Ok(problems) => {
                for problem in problems {
                    report.push(problem);
                }
                if let Err(error) = self.shared.machine.stamps.reset() {
                    report.push(format!("stamp store reset failed: {error}"));
                }
                self.shared.machine.orphans.clear();
                self.shared.machine.forget_versions();
            }
            Err(error) => report.push(error.to_string()),
        }
        match self.turn_on() {
            Ok(Some(_)) => {}
            Ok(None) => report.push("indexing stays off: another component turned it off"),
            Err(error) => report.push(error.to_string()),
        }
        log::info!("drop indexes finished problems={}", report.problems.len());
        report
    }

    /// Pauses every open project's executor under `reason`.
    pub fn pause(&self, reason: &str) {
        for project in self.shared.open_projects() {
            project.pause(reason);
        }
    }

    pub fn resume(&self, reason: &str) {
        for project in self.shared.open_projects() {
            project.resume(reason);
        }
    }

    pub fn status(&self, key: &ProjectKey) -> Option<ProjectStatus> {
        self.shared
            .projects
            .read()
            .get(key)
            .map(|project| project.status())
    }

    pub fn is_busy(&self) -> bool {
        self.shared
            .open_projects()
            .iter()
            .any(|project| project.status().is_busy())
    }

    /// Waits until no open project has running or runnable work.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.shared.open_projects().iter().all(|project| {
            project.wait_idle(deadline.saturating_duration_since(Instant::now()))
        })
    }

    /// Whether the stored stamp of `file_id` covers every registered extractor.
    pub fn is_fresh(&self, file_id: FileId) -> bool {
        let machine = &self.shared.machine;
        let candidate = machine.candidate();
        machine
            .stamps
            .read(file_id)
            .is_some_and(|stamp| stamp.covers(&candidate))
    }

    pub fn dirty_files(&self, key: &ProjectKey) -> Result<Vec<FileId>> {
        Ok(self.project(key)?.dirty_files())
    }

    /// Closes every project and persists all state. Idempotent.
    pub fn shutdown(&self) -> ActionReport {
        let mut report = ActionReport::default();
        let keys = self.project_keys();
        for key in keys {
            if let Err(error) = self.close_project(&key) {
                report.push(format!("closing {key}: {error}"));
            }
        }
        if let Some(mut worker) = self.flush_worker.lock().take() {
            worker.stop();
        }
        for problem in self.shared.persist_all() {
            report.push(problem);
        }
        if report.is_success() {
            if let Err(error) = self.shared.machine.root.end_session() {
                report.push(format!("session marker: {error}"));
            }
        }
        report
    }

    fn project(&self, key: &ProjectKey) -> Result<Arc<ProjectScheduler>> {
        self.shared
            .projects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| IndexingError::InvalidInput(format!("project {key} is not open")))
    }
}

impl Drop for IndexingService {
    fn drop(&mut self) {
        let report = self.shutdown();
        for problem in report.problems {
            log::warn!("indexing shutdown problem: {}", problem);
        }
    }
}

/// Loads the machine-level storage and settles whatever the previous run
/// left behind: a corruption marker, recreated storage, version changes or
/// an unclean shutdown.
fn open_machine(
    root_dir: PathBuf,
    registry: ProviderRegistry,
    vfs_epoch: VfsEpoch,
    config: IndexingConfig,
) -> Result<MachineState> {
    let root = IndexRoot::new(root_dir)?;
    let mut invalidations = Vec::new();
    let mut full_scans = Vec::new();

    if let Some(marker) = root.corruption_marker() {
        invalidations.push(format!("corruption marker: {marker}"));
    }
    let (stamps, recreated) = StampStore::open_or_recreate(&root.stamps_path())?;
    if let Some(reason) = recreated {
        invalidations.push(format!("stamp store recreated: {reason}"));
    }
    let (index_ids, ids_problem) = IndexIdRegistry::load(root.index_ids_path());
    if let Some(reason) = ids_problem {
        invalidations.push(format!("index id registry discarded: {reason}"));
    }
    let persisted = match load_versions(&root.versions_path()) {
        Ok(persisted) => persisted,
        Err(error) => {
            full_scans.push(error.to_string());
            None
        }
    };
    let (orphans, orphan_problem) = OrphanQueue::load(
        root.orphans_path(),
        config.orphan_trim_threshold,
        config.orphan_max_entries,
    );
    if let Some(reason) = orphan_problem {
        log::warn!("orphan queue lost, closed projects will full-scan: {}", reason);
    }
    let unclean = root.begin_session()?;
    if unclean {
        full_scans.push("previous session did not shut down cleanly".to_string());
    }

    let machine = MachineState {
        root,
        config,
        vfs_epoch,
        stamps: Arc::new(stamps),
        orphans,
        scan_lock: Arc::new(Mutex::new(())),
        registry: RwLock::new(Arc::new(registry)),
        versions: Mutex::new(VersionState {
            index_ids,
            persisted,
            candidate: IndexingStamp::new(0, VersionMask::EMPTY),
        }),
    };
    full_scans.extend(machine.reconcile_versions()?);

    let stamps = &machine.stamps;
    if !invalidations.is_empty() {
        let reason = invalidations.join("; ");
        stamps.invalidate_all(&reason);
        stamps.flush()?;
        full_scans.push(reason);
    }
    stamps.set_dirty_queue_complete(!unclean && invalidations.is_empty());

    if !full_scans.is_empty() {
        let reason = full_scans.join("; ");
        log::info!("full rescan required reason={}", reason);
        for path in machine.root.dirty_queue_paths() {
            mark_full_scan_required(&path, &reason)?;
        }
    }
    machine.root.clear_corruption_marker()?;

    let names = machine.registry().extractor_names();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    for dropped in machine.root.drop_unregistered_extractors(&names) {
        log::info!("dropped storage of unregistered extractor name={}", dropped);
    }
    Ok(machine)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dirty::DirtyFileQueue;
    use crate::indexer::tests::{MemoryLoader, RecordingIndexer};
    use crate::provider::{DirectoryProvider, PathTable};
    use crate::session::tests::list;
    use crate::status::ProjectState;
    use crate::types::OriginKind;
    use std::fs;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    const WAIT: Duration = Duration::from_secs(10);

    pub(crate) fn machine(registry: ProviderRegistry) -> (TempDir, Arc<MachineState>) {
        let dir = tempdir().expect("tempdir");
        let config = IndexingConfig {
            scanning_parallelism: 2,
            ..IndexingConfig::default()
        };
        let machine = open_machine(dir.path().to_path_buf(), registry, VfsEpoch(1), config)
            .expect("machine");
        (dir, Arc::new(machine))
    }

    fn registry(indexer: &Arc<RecordingIndexer>) -> ProviderRegistry {
        ProviderRegistry::builder(MemoryLoader::with_files(&[1, 2, 3, 4, 5, 6]))
            .extractor(indexer.clone())
            .contributor("rust")
            .build()
            .expect("registry")
    }

    fn service(dir: &Path, indexer: &Arc<RecordingIndexer>) -> IndexingService {
        let config = IndexingConfig {
            scanning_parallelism: 2,
            flush_interval_ms: 60_000,
            ..IndexingConfig::default()
        };
        IndexingService::open_with_config(dir, registry(indexer), VfsEpoch(1), config)
            .expect("service")
    }

    fn app() -> ProjectKey {
        ProjectKey::new("app")
    }

    fn content(raw: &[i32]) -> Vec<ProviderRef> {
        vec![list("app:content", OriginKind::Content, raw)]
    }

    #[test]
    fn changed_file_is_reindexed_and_marked_fresh() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2, 3])).expect("open");
        assert!(service.wait_idle(WAIT));
        assert!(service.is_fresh(FileId::new(2)));

        service.on_files_changed(&[FileId::new(2)]).expect("changed");
        assert!(!service.is_fresh(FileId::new(2)));
        assert!(service.wait_idle(WAIT));
        assert!(service.is_fresh(FileId::new(2)));
        assert!(!service.is_busy());

        let indexed = indexer.indexed.lock().clone();
        assert_eq!(indexed.iter().filter(|id| **id == FileId::new(2)).count(), 2);
    }

    #[test]
    fn unchanged_off_on_cycle_rescans_dirty_files_only() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2, 3])).expect("open");
        assert!(service.wait_idle(WAIT));

        service.turn_off("plugin reload");
        assert_eq!(service.status(&app()).expect("status").state, ProjectState::Off);
        service.on_files_changed(&[FileId::new(3)]).expect("changed");
        let before = indexer.indexed.lock().len();

        let decision = service.turn_on().expect("turn on");
        assert_eq!(decision, Some(RescanDecision::Partial));
        assert!(service.wait_idle(WAIT));
        assert_eq!(indexer.indexed.lock()[before..].to_vec(), vec![FileId::new(3)]);
        assert_eq!(service.status(&app()).expect("status").full_scans, 1);
    }

    #[test]
    fn extractor_version_bump_while_off_triggers_full_rescan() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2, 3])).expect("open");
        assert!(service.wait_idle(WAIT));

        service.turn_off("plugin update");
        let upgraded = Arc::new(RecordingIndexer::new("symbols", 2));
        service.set_registry(registry(&upgraded)).expect("registry");
        let decision = service.turn_on().expect("turn on").expect("outermost");
        assert!(decision.is_full(), "{decision:?}");

        assert!(service.wait_idle(WAIT));
        assert_eq!(upgraded.indexed(), vec![FileId::new(1), FileId::new(2), FileId::new(3)]);
        assert!(service.is_fresh(FileId::new(1)));
        assert_eq!(service.status(&app()).expect("status").full_scans, 2);
    }

    #[test]
    fn closed_project_picks_up_orphans_on_reopen() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2, 3])).expect("open");
        assert!(service.wait_idle(WAIT));
        service.close_project(&app()).expect("close");

        service.on_files_changed(&[FileId::new(1)]).expect("changed");
        let before = indexer.indexed.lock().len();
        service.open_project(app(), content(&[1, 2, 3])).expect("reopen");
        assert!(service.wait_idle(WAIT));

        let status = service.status(&app()).expect("status");
        assert_eq!(status.partial_scans, 1);
        assert_eq!(status.full_scans, 0);
        assert_eq!(indexer.indexed.lock()[before..].to_vec(), vec![FileId::new(1)]);
    }

    #[test]
    fn dirty_files_survive_a_restart() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        {
            let service = service(dir.path(), &indexer);
            service.open_project(app(), content(&[1, 2])).expect("open");
            assert!(service.wait_idle(WAIT));
            service.pause("test");
            service.on_files_changed(&[FileId::new(2)]).expect("changed");
            assert!(service.shutdown().is_success());
        }

        let root = IndexRoot::new(dir.path()).expect("root");
        let queue = DirtyFileQueue::new(root.dirty_queue_path(&app()), VfsEpoch(1));
        assert_eq!(queue.load(VfsEpoch(1)).file_ids, vec![FileId::new(2)]);

        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2])).expect("open");
        assert!(service.wait_idle(WAIT));
        assert!(service.is_fresh(FileId::new(2)));
        assert_eq!(service.status(&app()).expect("status").partial_scans, 1);
    }

    #[test]
    fn failed_file_is_retried_after_reopen() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        indexer.failing.lock().push(FileId::new(2));
        {
            let service = service(dir.path(), &indexer);
            service.open_project(app(), content(&[1, 2, 3])).expect("open");
            assert!(service.wait_idle(WAIT));
            assert_eq!(service.dirty_files(&app()).expect("dirty"), vec![FileId::new(2)]);
            assert!(!service.is_fresh(FileId::new(2)));
            assert!(service.shutdown().is_success());
        }

        indexer.failing.lock().clear();
        let before = indexer.indexed.lock().len();
        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2, 3])).expect("reopen");
        assert!(service.wait_idle(WAIT));

        let status = service.status(&app()).expect("status");
        assert_eq!(status.partial_scans, 1);
        assert_eq!(status.full_scans, 0);
        assert_eq!(indexer.indexed.lock()[before..].to_vec(), vec![FileId::new(2)]);
        assert!(service.is_fresh(FileId::new(2)));
        assert!(service.dirty_files(&app()).expect("dirty").is_empty());
    }

    #[test]
    fn failed_file_is_retried_after_turn_on() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        indexer.failing.lock().push(FileId::new(3));
        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2, 3])).expect("open");
        assert!(service.wait_idle(WAIT));
        assert!(!service.is_fresh(FileId::new(3)));

        service.turn_off("plugin reload");
        indexer.failing.lock().clear();
        let before = indexer.indexed.lock().len();
        let decision = service.turn_on().expect("turn on");
        assert_eq!(decision, Some(RescanDecision::Partial));
        assert!(service.wait_idle(WAIT));

        assert_eq!(indexer.indexed.lock()[before..].to_vec(), vec![FileId::new(3)]);
        assert!(service.is_fresh(FileId::new(3)));
        assert!(service.dirty_files(&app()).expect("dirty").is_empty());
    }

    #[test]
    fn changes_during_running_scans_are_never_lost() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        *indexer.hook.lock() = Some(Box::new(|_| thread::sleep(Duration::from_millis(1))));
        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2, 3, 4, 5, 6])).expect("open");

        for round in 0..40 {
            let file_id = FileId::new(round % 6 + 1);
            service.on_files_changed(&[file_id]).expect("changed");
            let dirty = service.dirty_files(&app()).expect("dirty");
            assert!(dirty.contains(&file_id) || service.is_fresh(file_id));
        }
        assert!(service.wait_idle(WAIT));

        for raw in 1..=6 {
            assert!(service.is_fresh(FileId::new(raw)), "file {raw} left stale");
        }
        assert!(service.dirty_files(&app()).expect("dirty").is_empty());
    }

    #[test]
    fn unclean_shutdown_forces_full_scans() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        {
            let service = service(dir.path(), &indexer);
            service.open_project(app(), content(&[1, 2])).expect("open");
            assert!(service.wait_idle(WAIT));
        }
        fs::write(dir.path().join("session.marker"), b"1").expect("simulate crash");

        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2])).expect("open");
        assert!(service.wait_idle(WAIT));
        assert_eq!(service.status(&app()).expect("status").full_scans, 1);
    }

    #[test]
    fn leftover_corruption_marker_invalidates_stamps() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        {
            let service = service(dir.path(), &indexer);
            service.open_project(app(), content(&[1, 2])).expect("open");
            assert!(service.wait_idle(WAIT));
            service.root().write_corruption_marker("died while off").expect("marker");
        }

        let service = service(dir.path(), &indexer);
        assert!(service.root().corruption_marker().is_none());
        assert!(!service.is_fresh(FileId::new(1)));
        service.open_project(app(), content(&[1, 2])).expect("open");
        assert!(service.wait_idle(WAIT));
        assert_eq!(service.status(&app()).expect("status").full_scans, 1);
        assert!(service.is_fresh(FileId::new(1)));
    }

    #[test]
    fn reindex_and_drop_indexes_rebuild_everything() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2])).expect("open");
        assert!(service.wait_idle(WAIT));

        let report = service.reindex();
        assert!(report.is_success(), "{:?}", report.problems);
        assert!(service.wait_idle(WAIT));
        assert_eq!(service.status(&app()).expect("status").full_scans, 2);
        assert!(service.is_fresh(FileId::new(1)));

        let report = service.drop_indexes();
        assert!(report.is_success(), "{:?}", report.problems);
        assert!(service.wait_idle(WAIT));
        assert_eq!(service.status(&app()).expect("status").full_scans, 3);
        assert!(service.is_fresh(FileId::new(2)));
        assert!(dir.path().join("index_ids.bin").exists());
    }

    #[test]
    fn rescan_keeps_fresh_stamps() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        let service = service(dir.path(), &indexer);
        service.open_project(app(), content(&[1, 2])).expect("open");
        assert!(service.wait_idle(WAIT));
        let before = indexer.indexed.lock().len();

        assert!(service.rescan().is_success());
        assert!(service.wait_idle(WAIT));
        assert_eq!(service.status(&app()).expect("status").full_scans, 2);
        assert_eq!(indexer.indexed.lock().len(), before);
    }

    #[test]
    fn registry_changes_need_indexing_off() {
        let dir = tempdir().expect("tempdir");
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        let service = service(dir.path(), &indexer);
        assert!(service.set_registry(registry(&indexer)).is_err());
        assert!(service.open_project(app(), Vec::new()).is_ok());
        assert!(service.open_project(app(), Vec::new()).is_err());
        assert!(service.close_project(&ProjectKey::new("other")).is_err());
    }

    #[test]
    fn directory_roots_are_indexed_end_to_end() {
        let dir = tempdir().expect("tempdir");
        let workspace = tempdir().expect("workspace");
        fs::create_dir_all(workspace.path().join("src")).expect("src");
        fs::write(workspace.path().join("src").join("main.rs"), "fn main() {}").expect("main");
        fs::write(workspace.path().join("README.md"), "# app").expect("readme");

        let paths = Arc::new(PathTable::new());
        let indexer = Arc::new(RecordingIndexer::new("symbols", 1));
        let registry = ProviderRegistry::builder(paths.clone())
            .extractor(indexer.clone())
            .build()
            .expect("registry");
        let service = IndexingService::open(dir.path(), registry, VfsEpoch(1)).expect("service");
        assert!(dir.path().join("indexing.json").exists());

        let provider: ProviderRef = Arc::new(DirectoryProvider::new(
            workspace.path(),
            OriginKind::Content,
            paths.clone(),
        ));
        service.open_project(app(), vec![provider]).expect("open");
        assert!(service.wait_idle(WAIT));

        assert_eq!(indexer.indexed().len(), 2);
        let main = paths.intern(&workspace.path().join("src").join("main.rs"));
        assert!(service.is_fresh(main));
    }
}
