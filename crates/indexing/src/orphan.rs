//! Machine-wide record of files dirtied while their project was closed.
//!
//! Entries are addressed by absolute positions: the first retained entry
//! sits at `first_position`, and a project remembers the position it has
//! consumed up to. Projects acknowledge their cursor so that a trim only
//! drops entries everyone has seen; a hard cap drops the oldest entries
//! regardless, and projects left behind are told to full-scan.

use std::collections::{BTreeMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layout::write_atomically;
use crate::types::{FileId, ProjectKey};

/// Orphan file format version - increment when changing [`OrphanFile`].
pub const ORPHAN_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct OrphanFile {
    format: u32,
    first_position: u64,
    entries: Vec<FileId>,
    cursors: Vec<(ProjectKey, u64)>,
}

/// Result of [`OrphanQueue::consume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanConsumption {
    pub file_ids: Vec<FileId>,
    /// Position to resume from on the next consume.
    pub cursor: u64,
    /// Entries the project never saw were discarded; only a full scan can
    /// restore its freshness.
    pub overflowed: bool,
}

#[derive(Debug, Default)]
struct OrphanState {
    first_position: u64,
    entries: VecDeque<FileId>,
    cursors: BTreeMap<ProjectKey, u64>,
    untrimmed: usize,
    modifications: u64,
    persisted_modifications: u64,
}

impl OrphanState {
    fn end_position(&self) -> u64 {
        self.first_position + self.entries.len() as u64
    }
}

#[derive(Debug)]
pub struct OrphanQueue {
    path: PathBuf,
    trim_threshold: usize,
    max_entries: usize,
    state: Mutex<OrphanState>,
}

impl OrphanQueue {
    pub fn new(path: impl Into<PathBuf>, trim_threshold: usize, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            trim_threshold: trim_threshold.max(1),
            max_entries: max_entries.max(1),
            state: Mutex::new(OrphanState::default()),
        }
    }

    /// Loads the persisted queue. A missing file yields an empty queue; a
    /// damaged one yields an empty queue and the reason, and no project
    /// cursor survives it.
    pub fn load(
        path: impl Into<PathBuf>,
        trim_threshold: usize,
        max_entries: usize,
    ) -> (Self, Option<String>) {
        let queue = Self::new(path, trim_threshold, max_entries);
        let problem = match read_orphan_file(&queue.path) {
            Ok(Some(file)) => {
                let mut state = queue.state.lock();
                state.first_position = file.first_position;
                state.entries = file.entries.into();
                state.cursors = file.cursors.into_iter().collect();
                None
            }
            Ok(None) => None,
            Err(reason) => {
                log::warn!(
                    "orphan queue {} discarded: {}",
                    queue.path.display(),
                    reason
                );
                Some(reason)
            }
        };
        (queue, problem)
    }

    pub fn append(&self, file_ids: &[FileId]) {
        if file_ids.is_empty() {
            return;
        }
        let needs_trim = {
            let mut state = self.state.lock();
            state.entries.extend(file_ids.iter().copied());
            state.untrimmed += file_ids.len();
            state.modifications += 1;
            state.untrimmed >= self.trim_threshold || state.entries.len() > self.max_entries
        };
        if needs_trim {
            self.trim();
        }
    }

    /// Returns the entries at or after `cursor`.
    ///
    /// A project the queue has no acknowledged cursor for, or whose cursor
    /// points outside the retained range, gets `overflowed`.
    pub fn consume(&self, project: &ProjectKey, cursor: u64) -> OrphanConsumption {
        let state = self.state.lock();
        let end = state.end_position();
        let known = state.cursors.contains_key(project);
        if !known || cursor < state.first_position || cursor > end {
            return OrphanConsumption {
                file_ids: Vec::new(),
                cursor: end,
                overflowed: true,
            };
        }
        let skip = (cursor - state.first_position) as usize;
        let mut file_ids: Vec<FileId> = state.entries.iter().skip(skip).copied().collect();
        file_ids.sort_unstable();
        file_ids.dedup();
        OrphanConsumption {
            file_ids,
            cursor: end,
            overflowed: false,
        }
    }

    /// Records that `project` has seen everything before `cursor`.
    pub fn acknowledge(&self, project: &ProjectKey, cursor: u64) {
        let mut state = self.state.lock();
        let end = state.end_position();
        let cursor = cursor.min(end);
        if state.cursors.get(project) != Some(&cursor) {
            state.cursors.insert(project.clone(), cursor);
            state.modifications += 1;
        }
    }

    pub fn end_position(&self) -> u64 {
        self.state.lock().end_position()
    }

    pub fn untrimmed_size(&self) -> usize {
        self.state.lock().untrimmed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries every known project has consumed, then enforces the cap.
    pub fn trim(&self) {
        let mut state = self.state.lock();
        let end = state.end_position();
        let min_cursor = state.cursors.values().copied().min().unwrap_or(end);
        let consumed = min_cursor.saturating_sub(state.first_position) as usize;
        let consumed = consumed.min(state.entries.len());
        state.entries.drain(..consumed);
        state.first_position += consumed as u64;

        let overflow = state.entries.len().saturating_sub(self.max_entries);
        if overflow > 0 {
            state.entries.drain(..overflow);
            state.first_position += overflow as u64;
            log::warn!(
                "orphan queue overflow dropped={} first_position={}",
                overflow,
                state.first_position
            );
        }

        state.untrimmed = 0;
        state.modifications += 1;
        log::debug!(
            "orphan queue trimmed consumed={} retained={}",
            consumed,
            state.entries.len()
        );
    }

    /// Writes the queue if it changed since the last persist.
    pub fn persist(&self) -> Result<bool> {
        let (file, modifications) = {
            let state = self.state.lock();
            if state.modifications == state.persisted_modifications {
                return Ok(false);
            }
            let file = OrphanFile {
                format: ORPHAN_FORMAT_VERSION,
                first_position: state.first_position,
                entries: state.entries.iter().copied().collect(),
                cursors: state
                    .cursors
                    .iter()
                    .map(|(project, cursor)| (project.clone(), *cursor))
                    .collect(),
            };
            (file, state.modifications)
        };
        let bytes = postcard::to_allocvec(&file)?;
        write_atomically(&self.path, &bytes)?;
        let mut state = self.state.lock();
        state.persisted_modifications = state.persisted_modifications.max(modifications);
        Ok(true)
    }

    /// Forgets every entry and cursor.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let end = state.end_position();
        state.entries.clear();
        state.first_position = end;
        state.cursors.clear();
        state.untrimmed = 0;
        state.modifications += 1;
    }
}

fn read_orphan_file(path: &Path) -> std::result::Result<Option<OrphanFile>, String> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.to_string()),
    };
    let file: OrphanFile = postcard::from_bytes(&bytes).map_err(|error| error.to_string())?;
    if file.format != ORPHAN_FORMAT_VERSION {
        return Err(format!("unsupported format {}", file.format));
    }
    Ok(Some(file))
}
