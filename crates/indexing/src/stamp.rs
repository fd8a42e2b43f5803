//! Stamp store: persistent "last indexed at generation X" marker per file.
//!
//! Records live in 64 lock stripes keyed by file id, so a worker hashing or
//! indexing one file never blocks readers of unrelated files. A stamp is
//! written only after the index data it vouches for was committed.
//!
//! ## File format
//!
//! ```text
//! header:  b"IXST" | u32 format | u64 epoch | u64 generation      (24 bytes)
//! record:  u64 record_epoch | u64 generation | u64 version mask   (24 bytes)
//! ```
//!
//! The record of file id `n` lives at `header + n * 24`. An all-zero record
//! is absent. Records whose epoch differs from the header epoch read as
//! absent, which makes [`StampStore::invalidate_all`] O(1).

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fnv::{FnvHashMap, FnvHashSet};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::error::{IndexingError, Result};
use crate::types::{Changed, FileId};

/// Stamp file format version - increment when changing the layout.
pub const STAMP_FORMAT_VERSION: u32 = 1;

const STAMP_MAGIC: &[u8; 4] = b"IXST";
const HEADER_LEN: usize = 24;
const RECORD_LEN: usize = 24;
const STRIPES: usize = 64;

/// Bit set over the persistent mask slots of the registered extractors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VersionMask(u64);

impl VersionMask {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn with_slot(self, slot: u8) -> Self {
        Self(self.0 | (1u64 << (slot % 64)))
    }

    pub fn contains_slot(self, slot: u8) -> bool {
        self.0 & (1u64 << (slot % 64)) != 0
    }

    pub fn is_superset_of(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Per-file freshness marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexingStamp {
    pub generation: u64,
    pub mask: VersionMask,
}

impl IndexingStamp {
    pub const fn new(generation: u64, mask: VersionMask) -> Self {
        Self { generation, mask }
    }

    /// Whether this stored stamp satisfies the freshness `candidate`.
    pub fn covers(&self, candidate: &IndexingStamp) -> bool {
        self.generation >= candidate.generation && self.mask.is_superset_of(candidate.mask)
    }
}

/// Proof of a claim on one file, returned by [`StampStore::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(u64);

#[derive(Debug, Clone, Copy)]
struct StoredRecord {
    epoch: u64,
    stamp: IndexingStamp,
}

#[derive(Debug, Default)]
struct Stripe {
    records: FnvHashMap<FileId, StoredRecord>,
    claims: FnvHashMap<FileId, ClaimToken>,
}

#[derive(Debug)]
pub struct StampStore {
    path: PathBuf,
    stripes: Box<[RwLock<Stripe>]>,
    epoch: AtomicU64,
    generation: AtomicU64,
    next_token: AtomicU64,
    dirty_queue_complete: AtomicBool,
    header_dirty: AtomicBool,
    /// Ids whose record changed since the last flush.
    pending: Mutex<FnvHashSet<FileId>>,
    file: Mutex<File>,
    /// Set after the first I/O failure; the instance refuses further writes.
    broken: Mutex<Option<String>>,
}

impl StampStore {
    /// Opens the stamp file, creating it when missing.
    ///
    /// Returns `StorageCorruption` when the file exists but cannot be trusted.
    pub fn open(path: &Path) -> Result<Self> {
        let loaded = load_file(path)?;
        let store = Self {
            path: path.to_path_buf(),
            stripes: (0..STRIPES).map(|_| RwLock::new(Stripe::default())).collect(),
            epoch: AtomicU64::new(loaded.epoch),
            generation: AtomicU64::new(loaded.generation),
            next_token: AtomicU64::new(0),
            dirty_queue_complete: AtomicBool::new(false),
            header_dirty: AtomicBool::new(false),
            pending: Mutex::new(FnvHashSet::default()),
            file: Mutex::new(loaded.file),
            broken: Mutex::new(None),
        };
        store.install(loaded.records);
        Ok(store)
    }

    /// Opens the stamp file, recreating it from scratch when it is unusable.
    ///
    /// Returns the reason of the recreation when the old file was unusable.
    pub fn open_or_recreate(path: &Path) -> Result<(Self, Option<String>)> {
        match Self::open(path) {
            Ok(store) => Ok((store, None)),
            Err(IndexingError::StorageCorruption { reason, .. }) => {
                log::error!(
                    "stamp store {} unusable, recreating: {}",
                    path.display(),
                    reason
                );
                remove_if_exists(path)?;
                Ok((Self::open(path)?, Some(reason)))
            }
            Err(error) => Err(error),
        }
    }

    /// Re-reads the backing file in place, recreating it when it is
    /// unusable, and clears the broken state. Outstanding claims are voided.
    ///
    /// Returns the reason when the file had to be recreated.
    pub fn reload(&self) -> Result<Option<String>> {
        let mut file = self.file.lock();
        let (loaded, problem) = match load_file(&self.path) {
            Ok(loaded) => (loaded, None),
            Err(IndexingError::StorageCorruption { reason, .. }) => {
                log::error!(
                    "stamp store {} unusable on reload, recreating: {}",
                    self.path.display(),
                    reason
                );
                remove_if_exists(&self.path)?;
                (load_file(&self.path)?, Some(reason))
            }
            Err(error) => return Err(error),
        };

        self.pending.lock().clear();
        self.epoch.store(loaded.epoch, Ordering::SeqCst);
        self.generation.fetch_max(loaded.generation, Ordering::SeqCst);
        self.header_dirty
            .store(self.current_generation() != loaded.generation, Ordering::SeqCst);
        *file = loaded.file;
        *self.broken.lock() = None;
        self.install(loaded.records);
        Ok(problem)
    }

    fn install(&self, records: Vec<(FileId, StoredRecord)>) {
        for stripe in self.stripes.iter() {
            let mut stripe = stripe.write();
            stripe.records.clear();
            stripe.claims.clear();
        }
        let count = records.len();
        for (file_id, record) in records {
            self.stripes[stripe_of(file_id)]
                .write()
                .records
                .insert(file_id, record);
        }
        log::debug!(
            "stamp store loaded path={} epoch={} generation={} records={}",
            self.path.display(),
            self.epoch.load(Ordering::SeqCst),
            self.current_generation(),
            count
        );
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Starts a new generation; stamps written afterwards carry it.
    pub fn advance_generation(&self) -> u64 {
        self.header_dirty.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Marks whether the dirty file queue is known to be complete. Only then
    /// does [`StampStore::is_changed`] answer `Yes`/`No`.
    pub fn set_dirty_queue_complete(&self, complete: bool) {
        self.dirty_queue_complete.store(complete, Ordering::SeqCst);
    }

    pub fn is_dirty_queue_complete(&self) -> bool {
        self.dirty_queue_complete.load(Ordering::SeqCst)
    }

    pub fn read(&self, file_id: FileId) -> Option<IndexingStamp> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let stripe = self.stripes[stripe_of(file_id)].read();
        stripe
            .records
            .get(&file_id)
            .filter(|record| record.epoch == epoch)
            .map(|record| record.stamp)
    }

    pub fn write(&self, file_id: FileId, stamp: IndexingStamp) -> Result<()> {
        self.ensure_writable(file_id)?;
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.stripes[stripe_of(file_id)]
            .write()
            .records
            .insert(file_id, StoredRecord { epoch, stamp });
        self.pending.lock().insert(file_id);
        Ok(())
    }

    pub fn is_changed(&self, file_id: FileId, candidate: &IndexingStamp) -> Changed {
        if !self.is_dirty_queue_complete() {
            return Changed::Unknown;
        }
        match self.read(file_id) {
            Some(stored) if stored.covers(candidate) => Changed::No,
            _ => Changed::Yes,
        }
    }

    /// Forgets the stamp of one file after a structural change and voids any
    /// outstanding claim on it.
    pub fn invalidate(&self, file_id: FileId) -> Result<()> {
        self.ensure_writable(file_id)?;
        {
            let mut stripe = self.stripes[stripe_of(file_id)].write();
            stripe.records.remove(&file_id);
            stripe.claims.remove(&file_id);
        }
        self.pending.lock().insert(file_id);
        Ok(())
    }

    /// Makes every stamp read as absent without touching per-file storage.
    pub fn invalidate_all(&self, reason: &str) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.header_dirty.store(true, Ordering::SeqCst);
        log::info!(
            "stamp store invalidated path={} epoch={} reason={}",
            self.path.display(),
            epoch,
            reason
        );
    }

    /// Claims a file. A later claim voids this one.
    pub fn acquire(&self, file_id: FileId) -> ClaimToken {
        let token = ClaimToken(self.next_token.fetch_add(1, Ordering::SeqCst) + 1);
        self.stripes[stripe_of(file_id)]
            .write()
            .claims
            .insert(file_id, token);
        token
    }

    /// Commits `stamp` if `token` is still the current claim of the file.
    pub fn release(
        &self,
        file_id: FileId,
        token: ClaimToken,
        stamp: IndexingStamp,
    ) -> Result<bool> {
        self.ensure_writable(file_id)?;
        let epoch = self.epoch.load(Ordering::SeqCst);
        {
            let mut stripe = self.stripes[stripe_of(file_id)].write();
            if stripe.claims.get(&file_id) != Some(&token) {
                return Ok(false);
            }
            stripe.claims.remove(&file_id);
            stripe
                .records
                .insert(file_id, StoredRecord { epoch, stamp });
        }
        self.pending.lock().insert(file_id);
        Ok(true)
    }

    /// Drops a claim without writing a stamp.
    pub fn abandon(&self, file_id: FileId, token: ClaimToken) {
        let mut stripe = self.stripes[stripe_of(file_id)].write();
        if stripe.claims.get(&file_id) == Some(&token) {
            stripe.claims.remove(&file_id);
        }
    }

    /// Durably writes every record changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        self.ensure_not_broken()?;
        let pending: Vec<FileId> = {
            let mut guard = self.pending.lock();
            let mut ids: Vec<FileId> = guard.drain().collect();
            ids.sort_unstable();
            ids
        };
        let header_dirty = self.header_dirty.swap(false, Ordering::SeqCst);
        if pending.is_empty() && !header_dirty {
            return Ok(());
        }

        let mut file = self.file.lock();
        let result = self.write_records(&mut file, &pending, header_dirty);
        if let Err(error) = result {
            let reason = error.to_string();
            log::error!(
                "stamp store flush failed path={} error={}",
                self.path.display(),
                reason
            );
            *self.broken.lock() = Some(reason.clone());
            self.pending.lock().extend(pending);
            return Err(IndexingError::corruption(&self.path, reason));
        }
        Ok(())
    }

    fn write_records(
        &self,
        file: &mut File,
        pending: &[FileId],
        header: bool,
    ) -> std::io::Result<()> {
        if header {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&encode_header(
                self.epoch.load(Ordering::SeqCst),
                self.generation.load(Ordering::SeqCst),
            ))?;
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        for &file_id in pending {
            let bytes = {
                let stripe = self.stripes[stripe_of(file_id)].read();
                match stripe.records.get(&file_id).filter(|record| record.epoch == epoch) {
                    Some(record) => encode_record(record),
                    None => [0u8; RECORD_LEN],
                }
            };
            let offset = HEADER_LEN as u64 + file_id.get() as u64 * RECORD_LEN as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&bytes)?;
        }
        file.sync_data()
    }

    /// Clears every record and claim, used when indexes are dropped.
    pub fn reset(&self) -> Result<()> {
        let mut file = self.file.lock();
        for stripe in self.stripes.iter() {
            let mut stripe = stripe.write();
            stripe.records.clear();
            stripe.claims.clear();
        }
        self.pending.lock().clear();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.load(Ordering::SeqCst);
        self.header_dirty.store(false, Ordering::SeqCst);

        let rewrite = (|| -> std::io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&encode_header(epoch, generation))?;
            file.sync_all()
        })();
        match rewrite {
            Ok(()) => {
                *self.broken.lock() = None;
                Ok(())
            }
            Err(error) => {
                *self.broken.lock() = Some(error.to_string());
                Err(IndexingError::corruption(&self.path, error.to_string()))
            }
        }
    }

    pub fn broken_reason(&self) -> Option<String> {
        self.broken.lock().clone()
    }

    fn ensure_not_broken(&self) -> Result<()> {
        match self.broken.lock().as_ref() {
            Some(reason) => Err(IndexingError::corruption(&self.path, reason.clone())),
            None => Ok(()),
        }
    }

    fn ensure_writable(&self, file_id: FileId) -> Result<()> {
        if !file_id.is_valid() {
            return Err(IndexingError::InvalidInput(format!(
                "invalid file id {file_id}"
            )));
        }
        self.ensure_not_broken()
    }
}

struct LoadedFile {
    file: File,
    epoch: u64,
    generation: u64,
    records: Vec<(FileId, StoredRecord)>,
}

/// Opens `path` (creating an empty store when missing) and decodes the
/// records of the current epoch through a read-only mapping.
fn load_file(path: &Path) -> Result<LoadedFile> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            file.write_all(&encode_header(1, 1))?;
            file.sync_all()?;
            return Ok(LoadedFile {
                file,
                epoch: 1,
                generation: 1,
                records: Vec::new(),
            });
        }
        Err(error) => return Err(IndexingError::corruption(path, error.to_string())),
    };

    let len = file
        .metadata()
        .map_err(|error| IndexingError::corruption(path, error.to_string()))?
        .len() as usize;
    if len < HEADER_LEN {
        return Err(IndexingError::corruption(path, "truncated header"));
    }

    // SAFETY: the mapping is read-only and dropped before any write to the file.
    let map = unsafe { Mmap::map(&file) }
        .map_err(|error| IndexingError::corruption(path, error.to_string()))?;
    let (epoch, generation) = parse_header(path, &map)?;

    let records = map[HEADER_LEN..]
        .chunks_exact(RECORD_LEN)
        .enumerate()
        .filter(|(_, chunk)| read_u64(chunk, 0) == epoch)
        .map(|(raw_id, chunk)| {
            let record = StoredRecord {
                epoch,
                stamp: IndexingStamp::new(
                    read_u64(chunk, 8),
                    VersionMask::from_bits(read_u64(chunk, 16)),
                ),
            };
            (FileId::new(raw_id as i32), record)
        })
        .collect();
    drop(map);

    Ok(LoadedFile {
        file,
        epoch,
        generation,
        records,
    })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

fn stripe_of(file_id: FileId) -> usize {
    file_id.get().unsigned_abs() as usize % STRIPES
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<(u64, u64)> {
    if &bytes[0..4] != STAMP_MAGIC {
        return Err(IndexingError::corruption(path, "bad magic"));
    }
    let format = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if format != STAMP_FORMAT_VERSION {
        return Err(IndexingError::corruption(
            path,
            format!("unsupported format {format}"),
        ));
    }
    let epoch = read_u64(bytes, 8);
    if epoch == 0 {
        return Err(IndexingError::corruption(path, "zero epoch"));
    }
    Ok((epoch, read_u64(bytes, 16)))
}

fn encode_header(epoch: u64, generation: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(STAMP_MAGIC);
    header[4..8].copy_from_slice(&STAMP_FORMAT_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&epoch.to_le_bytes());
    header[16..24].copy_from_slice(&generation.to_le_bytes());
    header
}

fn encode_record(record: &StoredRecord) -> [u8; RECORD_LEN] {
    let mut bytes = [0u8; RECORD_LEN];
    bytes[0..8].copy_from_slice(&record.epoch.to_le_bytes());
    bytes[8..16].copy_from_slice(&record.stamp.generation.to_le_bytes());
    bytes[16..24].copy_from_slice(&record.stamp.mask.bits().to_le_bytes());
    bytes
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    fn stamp(generation: u64, bits: u64) -> IndexingStamp {
        IndexingStamp::new(generation, VersionMask::from_bits(bits))
    }

    #[test]
    fn write_read_and_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stamps.dat");
        {
            let store = StampStore::open(&path).expect("open");
            store.write(FileId::new(3), stamp(5, 0b11)).expect("write");
            store.write(FileId::new(70), stamp(6, 0b1)).expect("write");
            store.flush().expect("flush");
        }
        let store = StampStore::open(&path).expect("reopen");
        assert_eq!(store.read(FileId::new(3)), Some(stamp(5, 0b11)));
        assert_eq!(store.read(FileId::new(70)), Some(stamp(6, 0b1)));
        assert_eq!(store.read(FileId::new(4)), None);
    }

    #[test]
    fn invalidate_all_hides_records_and_persists() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stamps.dat");
        {
            let store = StampStore::open(&path).expect("open");
            store.write(FileId::new(1), stamp(1, 1)).expect("write");
            store.flush().expect("flush");
            store.invalidate_all("extractor added");
            assert_eq!(store.read(FileId::new(1)), None);
            store.flush().expect("flush header");
        }
        let store = StampStore::open(&path).expect("reopen");
        assert_eq!(store.read(FileId::new(1)), None);
    }

    #[test]
    fn invalidate_single_file_persists_absence() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stamps.dat");
        {
            let store = StampStore::open(&path).expect("open");
            store.write(FileId::new(2), stamp(1, 1)).expect("write");
            store.flush().expect("flush");
            store.invalidate(FileId::new(2)).expect("invalidate");
            store.flush().expect("flush");
        }
        let store = StampStore::open(&path).expect("reopen");
        assert_eq!(store.read(FileId::new(2)), None);
    }

    #[test]
    fn is_changed_is_unknown_until_queue_complete() {
        let dir = tempdir().expect("tempdir");
        let store = StampStore::open(&dir.path().join("stamps.dat")).expect("open");
        let candidate = stamp(2, 0b11);
        store.write(FileId::new(1), stamp(3, 0b111)).expect("write");
        store.write(FileId::new(2), stamp(1, 0b11)).expect("write");
        store.write(FileId::new(3), stamp(3, 0b01)).expect("write");

        assert_eq!(store.is_changed(FileId::new(1), &candidate), Changed::Unknown);

        store.set_dirty_queue_complete(true);
        assert_eq!(store.is_changed(FileId::new(1), &candidate), Changed::No);
        assert_eq!(store.is_changed(FileId::new(2), &candidate), Changed::Yes);
        assert_eq!(store.is_changed(FileId::new(3), &candidate), Changed::Yes);
        assert_eq!(store.is_changed(FileId::new(4), &candidate), Changed::Yes);
    }

    #[test]
    fn stale_claim_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = StampStore::open(&dir.path().join("stamps.dat")).expect("open");
        let file = FileId::new(9);
        let first = store.acquire(file);
        let second = store.acquire(file);

        assert!(!store.release(file, first, stamp(1, 1)).expect("release"));
        assert_eq!(store.read(file), None);
        assert!(store.release(file, second, stamp(2, 1)).expect("release"));
        assert_eq!(store.read(file), Some(stamp(2, 1)));
        assert!(!store.release(file, second, stamp(3, 1)).expect("release twice"));
    }

    #[test]
    fn invalidate_voids_outstanding_claim() {
        let dir = tempdir().expect("tempdir");
        let store = StampStore::open(&dir.path().join("stamps.dat")).expect("open");
        let file = FileId::new(4);
        let token = store.acquire(file);
        store.invalidate(file).expect("invalidate");
        assert!(!store.release(file, token, stamp(1, 1)).expect("release"));
        assert_eq!(store.read(file), None);
    }

    #[test]
    fn concurrent_claims_commit_at_most_once() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(StampStore::open(&dir.path().join("stamps.dat")).expect("open"));
        let file = FileId::new(42);
        let workers = 8;
        let acquired = Arc::new(Barrier::new(workers));

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let store = store.clone();
                let acquired = acquired.clone();
                thread::spawn(move || {
                    let token = store.acquire(file);
                    acquired.wait();
                    store
                        .release(file, token, stamp(worker as u64 + 1, 1))
                        .expect("release")
                })
            })
            .collect();

        let committed = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|committed| *committed)
            .count();
        assert_eq!(committed, 1);
        assert!(store.read(file).is_some());
    }

    #[test]
    fn corrupt_header_is_reported_and_recreated() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stamps.dat");
        std::fs::write(&path, vec![0xAB; 40]).expect("write garbage");

        let error = StampStore::open(&path).expect_err("must fail");
        assert!(error.is_storage_corruption());

        let (store, reason) = StampStore::open_or_recreate(&path).expect("recreate");
        assert_eq!(reason.as_deref(), Some("bad magic"));
        assert_eq!(store.read(FileId::new(0)), None);
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = StampStore::open(&dir.path().join("stamps.dat")).expect("open");
        let error = store.write(FileId::new(-1), stamp(1, 1)).expect_err("invalid");
        assert!(matches!(error, IndexingError::InvalidInput(_)));
    }

    #[test]
    fn reset_clears_records_and_keeps_generation() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stamps.dat");
        let store = StampStore::open(&path).expect("open");
        let generation = store.advance_generation();
        store.write(FileId::new(1), stamp(generation, 1)).expect("write");
        store.flush().expect("flush");

        store.reset().expect("reset");
        assert_eq!(store.read(FileId::new(1)), None);
        assert_eq!(store.current_generation(), generation);
        drop(store);

        let store = StampStore::open(&path).expect("reopen");
        assert_eq!(store.read(FileId::new(1)), None);
    }

    #[test]
    fn reload_picks_up_a_replaced_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stamps.dat");
        let store = StampStore::open(&path).expect("open");
        let generation = store.advance_generation();
        store.write(FileId::new(1), stamp(generation, 1)).expect("write");
        store.flush().expect("flush");

        std::fs::remove_file(&path).expect("remove");
        assert_eq!(store.reload().expect("reload"), None);
        assert_eq!(store.read(FileId::new(1)), None);
        assert!(store.current_generation() >= generation);

        std::fs::write(&path, b"garbage").expect("garbage");
        assert_eq!(store.reload().expect("reload").as_deref(), Some("truncated header"));
        store.write(FileId::new(2), stamp(generation, 1)).expect("write after reload");
        store.flush().expect("flush after reload");
    }

    #[test]
    fn mask_superset() {
        let mask = VersionMask::EMPTY.with_slot(0).with_slot(5);
        assert!(mask.contains_slot(5));
        assert!(!mask.contains_slot(1));
        assert!(mask.is_superset_of(VersionMask::EMPTY.with_slot(5)));
        assert!(!VersionMask::EMPTY.with_slot(5).is_superset_of(mask));
    }
}
