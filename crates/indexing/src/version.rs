//! Registered extractor versions and the persistent slot registry.
//!
//! Two snapshots compare equal iff no full rescan is required. Every
//! extractor also owns a fixed bit of the stamp [`VersionMask`] and a
//! "changed at generation" entry; a stored stamp is fresh for an extractor
//! only when its generation is at least that entry.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::error::{IndexingError, Result};
use crate::layout::write_atomically;
use crate::stamp::VersionMask;

/// `versions.bin` format version - increment when changing [`VersionsFile`].
pub const VERSIONS_FORMAT_VERSION: u32 = 1;
/// `index_ids.bin` format version.
pub const INDEX_IDS_FORMAT_VERSION: u32 = 1;
pub const MAX_EXTRACTORS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SnapshotEntry {
    Extractor { name: String, version: u32 },
    Contributor { name: String },
    SetProvider { name: String },
}

impl SnapshotEntry {
    pub fn extractor(name: impl Into<String>, version: u32) -> Self {
        Self::Extractor {
            name: name.into(),
            version,
        }
    }

    pub fn contributor(name: impl Into<String>) -> Self {
        Self::Contributor { name: name.into() }
    }

    pub fn set_provider(name: impl Into<String>) -> Self {
        Self::SetProvider { name: name.into() }
    }

    fn describe(&self) -> String {
        match self {
            Self::Extractor { name, version } => format!("extractor {name} v{version}"),
            Self::Contributor { name } => format!("contributor {name}"),
            Self::SetProvider { name } => format!("set provider {name}"),
        }
    }
}

/// Sorted, hashable description of everything the indexes depend on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VersionSnapshot {
    entries: Vec<SnapshotEntry>,
}

impl VersionSnapshot {
    pub fn new(entries: impl IntoIterator<Item = SnapshotEntry>) -> Self {
        let mut entries: Vec<SnapshotEntry> = entries.into_iter().collect();
        entries.sort();
        entries.dedup();
        Self { entries }
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn extractor_version(&self, extractor: &str) -> Option<u32> {
        self.entries.iter().find_map(|entry| match entry {
            SnapshotEntry::Extractor { name, version } if name == extractor => Some(*version),
            _ => None,
        })
    }

    pub fn extractors(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().filter_map(|entry| match entry {
            SnapshotEntry::Extractor { name, version } => Some((name.as_str(), *version)),
            _ => None,
        })
    }

    /// Human-readable differences from `previous` to `self`.
    pub fn diff(&self, previous: &VersionSnapshot) -> Vec<String> {
        let mut reasons = Vec::new();
        for entry in &self.entries {
            if previous.entries.binary_search(entry).is_ok() {
                continue;
            }
            match entry {
                SnapshotEntry::Extractor { name, version } => {
                    match previous.extractor_version(name) {
                        Some(old) => reasons.push(format!(
                            "extractor {name} version changed {old} -> {version}"
                        )),
                        None => reasons.push(format!("{} added", entry.describe())),
                    }
                }
                _ => reasons.push(format!("{} added", entry.describe())),
            }
        }
        for entry in &previous.entries {
            if self.entries.binary_search(entry).is_ok() {
                continue;
            }
            if let SnapshotEntry::Extractor { name, .. } = entry {
                if self.extractor_version(name).is_some() {
                    continue;
                }
            }
            reasons.push(format!("{} removed", entry.describe()));
        }
        reasons
    }
}

/// Per-extractor generation at which its output last changed meaning.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationTable {
    changed_at: BTreeMap<String, u64>,
}

impl GenerationTable {
    pub fn changed_at(&self, extractor: &str) -> Option<u64> {
        self.changed_at.get(extractor).copied()
    }

    /// Bumps the entry of every extractor that is new or changed version
    /// since `previous`, and forgets removed extractors.
    pub fn reconcile(
        &mut self,
        previous: Option<&VersionSnapshot>,
        current: &VersionSnapshot,
        mut next_generation: impl FnMut() -> u64,
    ) -> Vec<String> {
        let mut bumped = Vec::new();
        for (name, version) in current.extractors() {
            let unchanged = previous.and_then(|snapshot| snapshot.extractor_version(name))
                == Some(version)
                && self.changed_at.contains_key(name);
            if !unchanged {
                self.changed_at.insert(name.to_string(), next_generation());
                bumped.push(name.to_string());
            }
        }
        self.changed_at
            .retain(|name, _| current.extractor_version(name).is_some());
        bumped
    }

    /// Generation a stamp must reach to be fresh for all `extractors`.
    pub fn required_generation<'a>(&self, extractors: impl IntoIterator<Item = &'a str>) -> u64 {
        extractors
            .into_iter()
            .filter_map(|name| self.changed_at(name))
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VersionsFile {
    format: u32,
    snapshot: VersionSnapshot,
    generations: GenerationTable,
}

/// Contents of `versions.bin`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistedVersions {
    pub snapshot: VersionSnapshot,
    pub generations: GenerationTable,
}

/// Returns `Ok(None)` on first run and `StorageCorruption` for a damaged file.
pub fn load_versions(path: &Path) -> Result<Option<PersistedVersions>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(IndexingError::corruption(path, error.to_string())),
    };
    let file: VersionsFile = postcard::from_bytes(&bytes)
        .map_err(|error| IndexingError::corruption(path, error.to_string()))?;
    if file.format != VERSIONS_FORMAT_VERSION {
        return Err(IndexingError::corruption(
            path,
            format!("unsupported format {}", file.format),
        ));
    }
    Ok(Some(PersistedVersions {
        snapshot: file.snapshot,
        generations: file.generations,
    }))
}

pub fn save_versions(path: &Path, versions: &PersistedVersions) -> Result<()> {
    let file = VersionsFile {
        format: VERSIONS_FORMAT_VERSION,
        snapshot: versions.snapshot.clone(),
        generations: versions.generations.clone(),
    };
    let bytes = postcard::to_allocvec(&file)?;
    write_atomically(path, &bytes)
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexIdsFile {
    format: u32,
    slots: Vec<(String, u8)>,
}

/// Assigns every extractor name a permanent bit of the stamp mask. Slots
/// are never reused, so a stale stamp bit can not vouch for a new extractor.
#[derive(Debug)]
pub struct IndexIdRegistry {
    path: PathBuf,
    slots: BTreeMap<String, u8>,
}

impl IndexIdRegistry {
    /// Loads the registry; a damaged file is replaced by an empty registry
    /// and its problem returned.
    pub fn load(path: impl Into<PathBuf>) -> (Self, Option<String>) {
        let path = path.into();
        let loaded = match std::fs::read(&path) {
            Ok(bytes) => postcard::from_bytes::<IndexIdsFile>(&bytes)
                .map_err(|error| error.to_string())
                .and_then(|file| {
                    if file.format == INDEX_IDS_FORMAT_VERSION {
                        Ok(file.slots.into_iter().collect())
                    } else {
                        Err(format!("unsupported format {}", file.format))
                    }
                }),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(error) => Err(error.to_string()),
        };
        match loaded {
            Ok(slots) => (Self { path, slots }, None),
            Err(reason) => {
                log::warn!("index id registry {} discarded: {}", path.display(), reason);
                (
                    Self {
                        path,
                        slots: BTreeMap::new(),
                    },
                    Some(reason),
                )
            }
        }
    }

    pub fn slot(&self, extractor: &str) -> Option<u8> {
        self.slots.get(extractor).copied()
    }

    /// Returns the slot of `extractor`, assigning the next free one if needed.
    pub fn slot_for(&mut self, extractor: &str) -> Result<u8> {
        if let Some(slot) = self.slot(extractor) {
            return Ok(slot);
        }
        let next = self
            .slots
            .values()
            .map(|slot| *slot as usize + 1)
            .max()
            .unwrap_or(0);
        if next >= MAX_EXTRACTORS {
            return Err(IndexingError::ConfigIncompatibility(format!(
                "no free index slot for extractor {extractor}"
            )));
        }
        self.slots.insert(extractor.to_string(), next as u8);
        Ok(next as u8)
    }

    pub fn mask_of<'a>(&self, extractors: impl IntoIterator<Item = &'a str>) -> VersionMask {
        extractors
            .into_iter()
            .filter_map(|name| self.slot(name))
            .fold(VersionMask::EMPTY, VersionMask::with_slot)
    }

    pub fn save(&self) -> Result<()> {
        let file = IndexIdsFile {
            format: INDEX_IDS_FORMAT_VERSION,
            slots: self
                .slots
                .iter()
                .map(|(name, slot)| (name.clone(), *slot))
                .collect(),
        };
        write_atomically(&self.path, &postcard::to_allocvec(&file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot(symbols_version: u32) -> VersionSnapshot {
        VersionSnapshot::new([
            SnapshotEntry::set_provider("project-roots"),
            SnapshotEntry::extractor("symbols", symbols_version),
            SnapshotEntry::contributor("rust"),
            SnapshotEntry::extractor("text", 1),
        ])
    }

    #[test]
    fn order_of_registration_does_not_matter() {
        let reversed = VersionSnapshot::new(snapshot(1).entries().iter().rev().cloned());
        assert_eq!(reversed, snapshot(1));
        assert_eq!(reversed.fingerprint(), snapshot(1).fingerprint());
    }

    #[test]
    fn diff_names_version_bumps_and_removals() {
        let previous = snapshot(1);
        let mut entries = snapshot(2).entries().to_vec();
        entries.retain(|entry| entry != &SnapshotEntry::contributor("rust"));
        let current = VersionSnapshot::new(entries);

        let reasons = current.diff(&previous);
        assert_eq!(
            reasons,
            vec![
                "extractor symbols version changed 1 -> 2".to_string(),
                "contributor rust removed".to_string(),
            ]
        );
        assert!(snapshot(1).diff(&snapshot(1)).is_empty());
    }

    #[test]
    fn reconcile_bumps_only_changed_extractors() {
        let mut table = GenerationTable::default();
        let mut generation = 0;
        let mut next = || {
            generation += 1;
            generation
        };
        let bumped = table.reconcile(None, &snapshot(1), &mut next);
        assert_eq!(bumped, vec!["symbols".to_string(), "text".to_string()]);

        let bumped = table.reconcile(Some(&snapshot(1)), &snapshot(2), &mut next);
        assert_eq!(bumped, vec!["symbols".to_string()]);
        assert_eq!(table.changed_at("symbols"), Some(3));
        assert_eq!(table.changed_at("text"), Some(2));
        assert_eq!(table.required_generation(["symbols", "text"]), 3);
    }

    #[test]
    fn versions_file_round_trip_and_corruption() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("versions.bin");
        assert_eq!(load_versions(&path).expect("missing"), None);

        let mut generations = GenerationTable::default();
        generations.reconcile(None, &snapshot(1), || 4);
        let versions = PersistedVersions {
            snapshot: snapshot(1),
            generations,
        };
        save_versions(&path, &versions).expect("save");
        assert_eq!(load_versions(&path).expect("load"), Some(versions));

        std::fs::write(&path, [0xFF, 0xFF]).expect("garbage");
        assert!(load_versions(&path).expect_err("corrupt").is_storage_corruption());
    }

    #[test]
    fn slots_are_permanent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index_ids.bin");
        {
            let (mut registry, problem) = IndexIdRegistry::load(&path);
            assert_eq!(problem, None);
            assert_eq!(registry.slot_for("symbols").expect("slot"), 0);
            assert_eq!(registry.slot_for("text").expect("slot"), 1);
            assert_eq!(registry.slot_for("symbols").expect("slot"), 0);
            registry.save().expect("save");
        }
        let (mut registry, _) = IndexIdRegistry::load(&path);
        assert_eq!(registry.slot("text"), Some(1));
        assert_eq!(registry.slot_for("stubs").expect("slot"), 2);
        assert_eq!(registry.mask_of(["symbols", "stubs"]).bits(), 0b101);
    }
}
