//! On-disk layout of the machine-level index root.
//!
//! ```text
//! <root>/
//!   indexing.json        settings (kept by drop_indexes)
//!   index_ids.bin        extractor name -> mask slot (kept by drop_indexes)
//!   versions.bin         last persisted VersionSnapshot
//!   corruption.marker    presence means "indexes are inconsistent"
//!   session.marker       present while a service runs (kept by drop_indexes)
//!   stamps.dat           per-file IndexingStamp records
//!   orphans.bin          machine-wide orphan queue
//!   dirty/<project>.dirty / .cursor
//!   indexes/<extractor>/ storage owned by the content indexers
//! ```

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::config::INDEXING_CONFIG_FILENAME;
use crate::error::{IndexingError, Result};
use crate::types::ProjectKey;

pub const CORRUPTION_MARKER_NAME: &str = "corruption.marker";
pub const SESSION_MARKER_NAME: &str = "session.marker";
pub const INDEX_IDS_FILENAME: &str = "index_ids.bin";
pub const VERSIONS_FILENAME: &str = "versions.bin";
pub const STAMPS_FILENAME: &str = "stamps.dat";
pub const ORPHANS_FILENAME: &str = "orphans.bin";
pub const DIRTY_DIRNAME: &str = "dirty";
pub const INDEXES_DIRNAME: &str = "indexes";

/// Files that survive [`IndexRoot::drop_indexes`].
const DROP_ALLOW_LIST: &[&str] = &[
    INDEX_IDS_FILENAME,
    INDEXING_CONFIG_FILENAME,
    SESSION_MARKER_NAME,
];

#[derive(Debug, Clone)]
pub struct IndexRoot {
    dir: PathBuf,
}

impl IndexRoot {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|error| {
            IndexingError::Internal(format!(
                "failed to create index root {}: {error}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn corruption_marker_path(&self) -> PathBuf {
        self.dir.join(CORRUPTION_MARKER_NAME)
    }

    pub fn session_marker_path(&self) -> PathBuf {
        self.dir.join(SESSION_MARKER_NAME)
    }

    pub fn index_ids_path(&self) -> PathBuf {
        self.dir.join(INDEX_IDS_FILENAME)
    }

    pub fn versions_path(&self) -> PathBuf {
        self.dir.join(VERSIONS_FILENAME)
    }

    pub fn stamps_path(&self) -> PathBuf {
        self.dir.join(STAMPS_FILENAME)
    }

    pub fn orphans_path(&self) -> PathBuf {
        self.dir.join(ORPHANS_FILENAME)
    }

    pub fn dirty_queue_path(&self, project: &ProjectKey) -> PathBuf {
        self.dir
            .join(DIRTY_DIRNAME)
            .join(format!("{}.dirty", project.file_stem()))
    }

    /// Queue files of every project that ever persisted dirty state.
    pub fn dirty_queue_paths(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.dir.join(DIRTY_DIRNAME)) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "dirty"))
            .collect();
        paths.sort();
        paths
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.dir.join(INDEXES_DIRNAME)
    }

    pub fn extractor_dir(&self, extractor: &str) -> PathBuf {
        self.indexes_dir().join(extractor)
    }

    /// Persists the corruption marker. Its reason is advisory only.
    pub fn write_corruption_marker(&self, reason: &str) -> Result<()> {
        write_atomically(&self.corruption_marker_path(), reason.as_bytes())
    }

    /// Returns the marker reason if the marker exists.
    ///
    /// An unreadable marker still counts as present.
    pub fn corruption_marker(&self) -> Option<String> {
        let path = self.corruption_marker_path();
        match fs::read(&path) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(error) if error.kind() == ErrorKind::NotFound => None,
            Err(error) => {
                log::warn!(
                    "corruption marker {} unreadable: {}",
                    path.display(),
                    error
                );
                Some(format!("unreadable marker: {error}"))
            }
        }
    }

    pub fn clear_corruption_marker(&self) -> Result<()> {
        match fs::remove_file(self.corruption_marker_path()) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Records that a service owns this root. Returns `true` when the
    /// previous owner never removed its marker.
    pub fn begin_session(&self) -> Result<bool> {
        let unclean = self.session_marker_path().exists();
        write_atomically(&self.session_marker_path(), std::process::id().to_string().as_bytes())?;
        Ok(unclean)
    }

    pub fn end_session(&self) -> Result<()> {
        match fs::remove_file(self.session_marker_path()) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Deletes every entry of the index root except the allow-list.
    ///
    /// Returns the entries that could not be removed.
    pub fn drop_indexes(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) => {
                problems.push(format!(
                    "failed to list index root {}: {error}",
                    self.dir.display()
                ));
                return problems;
            }
        };

        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if DROP_ALLOW_LIST.contains(&name.as_str()) {
                continue;
            }
            let path = entry.path();
            let removed = match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => fs::remove_dir_all(&path),
                _ => fs::remove_file(&path),
            };
            if let Err(error) = removed {
                problems.push(format!("failed to delete {}: {error}", path.display()));
            }
        }
        problems
    }

    /// Removes storage directories of extractors that are no longer registered.
    pub fn drop_unregistered_extractors(&self, registered: &[&str]) -> Vec<String> {
        let mut dropped = Vec::new();
        let Ok(entries) = fs::read_dir(self.indexes_dir()) else {
            return dropped;
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if registered.contains(&name.as_str()) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => dropped.push(name),
                Err(error) => log::warn!(
                    "failed to drop unregistered index {}: {}",
                    entry.path().display(),
                    error
                ),
            }
        }
        dropped
    }
}

/// Writes `bytes` to `path` through a temp file in the same directory and a
/// rename, so readers see either the old or the new content.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| IndexingError::InvalidInput(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|error| {
        IndexingError::Internal(format!(
            "failed to finalize {}: {}",
            path.display(),
            error.error
        ))
    })?;
    Ok(())
}
