use std::path::Path;
use std::thread::available_parallelism;

use serde::{Deserialize, Serialize};

use crate::error::{IndexingError, Result};
use crate::layout::write_atomically;

pub const INDEXING_CONFIG_FILENAME: &str = "indexing.json";

/// Scheduler settings, stored next to the index data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Number of scanning workers per session.
    pub scanning_parallelism: usize,
    /// Files indexed between two durable commits.
    pub commit_batch_size: usize,
    /// Period of the background dirty-queue persistence.
    pub flush_interval_ms: u64,
    /// Untrimmed orphan appends that trigger a trim.
    pub orphan_trim_threshold: usize,
    /// Upper bound of retained orphan entries.
    pub orphan_max_entries: usize,
    /// Lets a project open run a partial scan of its persisted dirty files
    /// instead of a full scan when no corruption or version change applies.
    pub allow_skipping_full_scan: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            scanning_parallelism: available_parallelism().map(|n| n.get()).unwrap_or(4),
            commit_batch_size: 256,
            flush_interval_ms: 5_000,
            orphan_trim_threshold: 10_000,
            orphan_max_entries: 100_000,
            allow_skipping_full_scan: true,
        }
    }
}

impl IndexingConfig {
    /// Clamps values that would stall the scheduler.
    pub fn normalized(mut self) -> Self {
        self.scanning_parallelism = self.scanning_parallelism.max(1);
        self.commit_batch_size = self.commit_batch_size.max(1);
        self.flush_interval_ms = self.flush_interval_ms.max(10);
        self.orphan_max_entries = self.orphan_max_entries.max(1);
        self
    }
}

pub fn load_or_create_config(dir: &Path) -> Result<IndexingConfig> {
    std::fs::create_dir_all(dir).map_err(|error| {
        IndexingError::Internal(format!(
            "failed to create index directory {}: {error}",
            dir.display()
        ))
    })?;

    let path = dir.join(INDEXING_CONFIG_FILENAME);
    if !path.exists() {
        let config = IndexingConfig::default();
        write_config(dir, &config)?;
        return Ok(config);
    }

    let data = std::fs::read_to_string(&path).map_err(|error| {
        IndexingError::Internal(format!(
            "failed to read indexing config {}: {error}",
            path.display()
        ))
    })?;
    let config: IndexingConfig = serde_json::from_str(&data).map_err(|error| {
        IndexingError::InvalidInput(format!(
            "failed to parse indexing config {}: {error}",
            path.display()
        ))
    })?;
    Ok(config.normalized())
}

pub fn write_config(dir: &Path, config: &IndexingConfig) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(config)?;
    write_atomically(&dir.join(INDEXING_CONFIG_FILENAME), &serialized)
}
