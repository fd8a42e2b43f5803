//! Persistent per-project set of files known to need reprocessing.
//!
//! On disk the queue is a flat little-endian file: `u64 vfs_epoch` followed
//! by `i32` file ids. The orphan-queue cursor of the project lives in a
//! sidecar `<name>.cursor` file holding one `u64`. A `<name>.full` file,
//! holding a reason, means the project must full-scan on its next open.
//!
//! In memory every id carries a change sequence number. The indexing phase
//! takes a [`DirtyTicket`] before it reads content, and
//! [`DirtyFileQueue::remove_committed`] only drops ids whose sequence did not
//! move since, so a change arriving mid-indexing survives for the next scan.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::layout::write_atomically;
use crate::types::{FileId, VfsEpoch};

const EPOCH_LEN: usize = 8;
const ID_LEN: usize = 4;

/// Result of [`DirtyFileQueue::load`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirtyQueueSnapshot {
    pub file_ids: Vec<FileId>,
    /// The stored ids came from another VFS epoch or the file was damaged;
    /// the caller must fall back to a full scan.
    pub stale: bool,
    /// A queue file existed; `false` on the first open of a project.
    pub persisted: bool,
    pub orphan_cursor: u64,
}

/// Observed change sequence of one dirty id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyTicket {
    file_id: FileId,
    sequence: u64,
}

impl DirtyTicket {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }
}

#[derive(Debug, Default)]
struct DirtyState {
    entries: FnvHashMap<FileId, u64>,
    next_sequence: u64,
    vfs_epoch: VfsEpoch,
    orphan_cursor: u64,
    modifications: u64,
    persisted_modifications: u64,
}

impl DirtyState {
    fn touch(&mut self) {
        self.modifications += 1;
    }
}

#[derive(Debug)]
pub struct DirtyFileQueue {
    path: PathBuf,
    state: Mutex<DirtyState>,
}

impl DirtyFileQueue {
    pub fn new(path: impl Into<PathBuf>, vfs_epoch: VfsEpoch) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(DirtyState {
                vfs_epoch,
                ..DirtyState::default()
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted queue recorded under `vfs_epoch` and merges the
    /// ids into the in-memory set.
    ///
    /// Never fails: a missing or unreadable file means "no dirty files".
    pub fn load(&self, vfs_epoch: VfsEpoch) -> DirtyQueueSnapshot {
        let snapshot = read_queue_file(&self.path, vfs_epoch);
        let mut state = self.state.lock();
        state.vfs_epoch = vfs_epoch;
        state.orphan_cursor = snapshot.orphan_cursor;
        for &file_id in &snapshot.file_ids {
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            state.entries.insert(file_id, sequence);
        }
        if snapshot.stale || !snapshot.persisted {
            // Rewrite under the current epoch on the next persist.
            state.touch();
        }
        snapshot
    }

    /// Writes `file_ids` and the current orphan cursor under `vfs_epoch`.
    pub fn store(&self, file_ids: &[FileId], vfs_epoch: VfsEpoch) -> Result<()> {
        let cursor = self.state.lock().orphan_cursor;
        let mut bytes = Vec::with_capacity(EPOCH_LEN + file_ids.len() * ID_LEN);
        bytes.extend_from_slice(&vfs_epoch.0.to_le_bytes());
        for file_id in file_ids {
            bytes.extend_from_slice(&file_id.get().to_le_bytes());
        }
        write_atomically(&self.path, &bytes)?;
        write_atomically(&cursor_path(&self.path), &cursor.to_le_bytes())
    }

    /// Stores the in-memory contents if they changed since the last persist.
    pub fn persist(&self) -> Result<bool> {
        let (ids, epoch, modifications) = {
            let state = self.state.lock();
            if state.modifications == state.persisted_modifications {
                return Ok(false);
            }
            let mut ids: Vec<FileId> = state.entries.keys().copied().collect();
            ids.sort_unstable();
            (ids, state.vfs_epoch, state.modifications)
        };
        self.store(&ids, epoch)?;
        let mut state = self.state.lock();
        state.persisted_modifications = state.persisted_modifications.max(modifications);
        log::debug!(
            "dirty queue persisted path={} files={}",
            self.path.display(),
            ids.len()
        );
        Ok(true)
    }

    pub fn add_all(&self, file_ids: impl IntoIterator<Item = FileId>) {
        let mut state = self.state.lock();
        let mut added = false;
        for file_id in file_ids {
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            state.entries.insert(file_id, sequence);
            added = true;
        }
        if added {
            state.touch();
        }
    }

    pub fn ticket(&self, file_id: FileId) -> DirtyTicket {
        let sequence = self
            .state
            .lock()
            .entries
            .get(&file_id)
            .copied()
            .unwrap_or(0);
        DirtyTicket { file_id, sequence }
    }

    /// Drops ids whose stamps were durably written; ids dirtied again after
    /// their ticket was taken stay queued. Returns the number removed.
    pub fn remove_committed(&self, tickets: &[DirtyTicket]) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        for ticket in tickets {
            if state.entries.get(&ticket.file_id) == Some(&ticket.sequence) {
                state.entries.remove(&ticket.file_id);
                removed += 1;
            }
        }
        if removed > 0 {
            state.touch();
        }
        removed
    }

    pub fn contains(&self, file_id: FileId) -> bool {
        self.state.lock().entries.contains_key(&file_id)
    }

    /// Sorted copy of the current contents.
    pub fn snapshot(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self.state.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        if !state.entries.is_empty() {
            state.entries.clear();
            state.touch();
        }
    }

    pub fn orphan_cursor(&self) -> u64 {
        self.state.lock().orphan_cursor
    }

    pub fn set_orphan_cursor(&self, cursor: u64) {
        let mut state = self.state.lock();
        if state.orphan_cursor != cursor {
            state.orphan_cursor = cursor;
            state.touch();
        }
    }

    pub fn vfs_epoch(&self) -> VfsEpoch {
        self.state.lock().vfs_epoch
    }

    pub fn require_full_scan(&self, reason: &str) -> Result<()> {
        mark_full_scan_required(&self.path, reason)
    }

    /// Reason of a pending full-scan requirement, if any.
    pub fn full_scan_required(&self) -> Option<String> {
        match std::fs::read(full_scan_path(&self.path)) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(error) if error.kind() == ErrorKind::NotFound => None,
            Err(error) => Some(format!("unreadable full scan marker: {error}")),
        }
    }

    pub fn clear_full_scan_required(&self) -> Result<()> {
        match std::fs::remove_file(full_scan_path(&self.path)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Persists a full-scan requirement for the queue at `queue_path`, which may
/// belong to a project that is not open.
pub fn mark_full_scan_required(queue_path: &Path, reason: &str) -> Result<()> {
    write_atomically(&full_scan_path(queue_path), reason.as_bytes())
}

fn cursor_path(path: &Path) -> PathBuf {
    path.with_extension("cursor")
}

fn full_scan_path(path: &Path) -> PathBuf {
    path.with_extension("full")
}

fn read_queue_file(path: &Path, current: VfsEpoch) -> DirtyQueueSnapshot {
    let orphan_cursor = read_cursor(&cursor_path(path));
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return DirtyQueueSnapshot {
                orphan_cursor,
                ..DirtyQueueSnapshot::default()
            };
        }
        Err(error) => {
            log::warn!("dirty queue {} unreadable: {}", path.display(), error);
            return DirtyQueueSnapshot {
                orphan_cursor,
                ..DirtyQueueSnapshot::default()
            };
        }
    };

    let stale = |reason: &str| {
        log::info!(
            "dirty queue stale path={} reason={}",
            path.display(),
            reason
        );
        DirtyQueueSnapshot {
            file_ids: Vec::new(),
            stale: true,
            persisted: true,
            orphan_cursor,
        }
    };

    if bytes.len() < EPOCH_LEN || (bytes.len() - EPOCH_LEN) % ID_LEN != 0 {
        return stale("truncated");
    }
    let mut raw_epoch = [0u8; EPOCH_LEN];
    raw_epoch.copy_from_slice(&bytes[..EPOCH_LEN]);
    let stored = u64::from_le_bytes(raw_epoch);
    if stored != current.0 {
        return stale(&format!("epoch {} != {}", stored, current.0));
    }

    let mut file_ids: Vec<FileId> = bytes[EPOCH_LEN..]
        .chunks_exact(ID_LEN)
        .map(|chunk| FileId::new(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .filter(|file_id| file_id.is_valid())
        .collect();
    file_ids.sort_unstable();
    file_ids.dedup();

    DirtyQueueSnapshot {
        file_ids,
        stale: false,
        persisted: true,
        orphan_cursor,
    }
}

fn read_cursor(path: &Path) -> u64 {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == 8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes);
            u64::from_le_bytes(raw)
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn ids(raw: &[i32]) -> Vec<FileId> {
        raw.iter().copied().map(FileId::new).collect()
    }

    #[test]
    fn same_epoch_loads_ids() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("p.dirty");
        DirtyFileQueue::new(&path, VfsEpoch(7))
            .store(&ids(&[3, 9, 12]), VfsEpoch(7))
            .expect("store");

        let queue = DirtyFileQueue::new(&path, VfsEpoch(7));
        let snapshot = queue.load(VfsEpoch(7));
        assert_eq!(snapshot.file_ids, ids(&[3, 9, 12]));
        assert!(!snapshot.stale);
        assert!(snapshot.persisted);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn epoch_mismatch_is_stale_and_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("p.dirty");
        DirtyFileQueue::new(&path, VfsEpoch(7))
            .store(&ids(&[3, 9, 12]), VfsEpoch(7))
            .expect("store");

        let queue = DirtyFileQueue::new(&path, VfsEpoch(8));
        let snapshot = queue.load(VfsEpoch(8));
        assert!(snapshot.file_ids.is_empty());
        assert!(snapshot.stale);
        assert!(queue.is_empty());
    }

    #[test]
    fn missing_file_is_empty_not_stale() {
        let dir = tempdir().expect("tempdir");
        let queue = DirtyFileQueue::new(dir.path().join("none.dirty"), VfsEpoch(1));
        let snapshot = queue.load(VfsEpoch(1));
        assert_eq!(snapshot, DirtyQueueSnapshot::default());

        assert!(queue.persist().expect("first persist"));
        assert!(queue.load(VfsEpoch(1)).persisted);
    }

    #[test]
    fn trailing_partial_id_is_stale() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("p.dirty");
        let mut bytes = 7u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&3i32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2]);
        std::fs::write(&path, bytes).expect("write");

        let snapshot = DirtyFileQueue::new(&path, VfsEpoch(7)).load(VfsEpoch(7));
        assert!(snapshot.stale);
        assert!(snapshot.file_ids.is_empty());
    }

    #[test]
    fn change_after_ticket_is_retained() {
        let dir = tempdir().expect("tempdir");
        let queue = DirtyFileQueue::new(dir.path().join("p.dirty"), VfsEpoch(1));
        queue.add_all(ids(&[1, 2]));

        let first = queue.ticket(FileId::new(1));
        let second = queue.ticket(FileId::new(2));
        queue.add_all(ids(&[2]));

        assert_eq!(queue.remove_committed(&[first, second]), 1);
        assert_eq!(queue.snapshot(), ids(&[2]));
    }

    #[test]
    fn ticket_of_clean_file_never_removes_later_dirt() {
        let dir = tempdir().expect("tempdir");
        let queue = DirtyFileQueue::new(dir.path().join("p.dirty"), VfsEpoch(1));
        let ticket = queue.ticket(FileId::new(5));
        queue.add_all(ids(&[5]));
        assert_eq!(queue.remove_committed(&[ticket]), 0);
        assert!(queue.contains(FileId::new(5)));
    }

    #[test]
    fn persist_writes_only_when_modified_and_keeps_cursor() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("p.dirty");
        let queue = DirtyFileQueue::new(&path, VfsEpoch(3));
        assert!(!queue.persist().expect("persist empty"));

        queue.add_all(ids(&[10, 4]));
        queue.set_orphan_cursor(17);
        assert!(queue.persist().expect("persist"));
        assert!(!queue.persist().expect("persist again"));

        let reloaded = DirtyFileQueue::new(&path, VfsEpoch(3));
        let snapshot = reloaded.load(VfsEpoch(3));
        assert_eq!(snapshot.file_ids, ids(&[4, 10]));
        assert_eq!(snapshot.orphan_cursor, 17);
    }

    #[test]
    fn full_scan_requirement_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("p.dirty");
        mark_full_scan_required(&path, "extractor symbols changed").expect("mark");

        let queue = DirtyFileQueue::new(&path, VfsEpoch(1));
        assert_eq!(
            queue.full_scan_required().as_deref(),
            Some("extractor symbols changed")
        );
        queue.clear_full_scan_required().expect("clear");
        queue.clear_full_scan_required().expect("clear twice");
        assert_eq!(queue.full_scan_required(), None);
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let dir = tempdir().expect("tempdir");
        let queue = Arc::new(DirtyFileQueue::new(dir.path().join("p.dirty"), VfsEpoch(1)));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for n in 0..250 {
                        queue.add_all([FileId::new(worker * 250 + n)]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(queue.len(), 1000);
    }
}
