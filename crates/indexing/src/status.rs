//! Project scheduler state and counters.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// What a project scheduler is currently doing.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum ProjectState {
    Idle = 0,
    Scanning = 1,
    Indexing = 2,
    Paused = 3,
    Off = 4,
}

impl ProjectState {
    /// Loads the state from an atomic.
    pub fn load(atomic: &AtomicU8) -> Self {
        match atomic.load(Ordering::Relaxed) {
            1 => Self::Scanning,
            2 => Self::Indexing,
            3 => Self::Paused,
            4 => Self::Off,
            _ => Self::Idle,
        }
    }

    pub fn store(self, atomic: &AtomicU8) {
        atomic.store(self as u8, Ordering::Relaxed);
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Indexing => "indexing",
            Self::Paused => "paused",
            Self::Off => "off",
        }
    }
}

/// Live counters of one project, updated by its scan tasks.
#[derive(Debug, Default)]
pub struct ProjectProgress {
    pub state: AtomicU8,
    pub full_scans: AtomicUsize,
    pub partial_scans: AtomicUsize,
    pub files_indexed: AtomicUsize,
    pub provider_failures: AtomicUsize,
    pub index_failures: AtomicUsize,
    pub last_scan_finished_at: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl ProjectProgress {
    pub fn state(&self) -> ProjectState {
        ProjectState::load(&self.state)
    }

    pub fn set_state(&self, state: ProjectState) {
        state.store(&self.state);
    }

    pub fn record_error(&self, error: impl Into<String>) {
        *self.last_error.lock() = Some(error.into());
    }

    pub fn finish_scan(&self) {
        self.last_scan_finished_at
            .store(unix_now_secs(), Ordering::Relaxed);
    }
}

/// Point-in-time view of a project, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectStatus {
    pub state: ProjectState,
    pub dirty_files: usize,
    pub queued_files: usize,
    pub full_scans: usize,
    pub partial_scans: usize,
    pub files_indexed: usize,
    pub provider_failures: usize,
    pub index_failures: usize,
    pub last_scan_finished_at: Option<u64>,
    pub last_error: Option<String>,
}

impl ProjectStatus {
    pub(crate) fn capture(
        progress: &ProjectProgress,
        dirty_files: usize,
        queued_files: usize,
    ) -> Self {
        Self {
            state: progress.state(),
            dirty_files,
            queued_files,
            full_scans: progress.full_scans.load(Ordering::Relaxed),
            partial_scans: progress.partial_scans.load(Ordering::Relaxed),
            files_indexed: progress.files_indexed.load(Ordering::Relaxed),
            provider_failures: progress.provider_failures.load(Ordering::Relaxed),
            index_failures: progress.index_failures.load(Ordering::Relaxed),
            last_scan_finished_at: zero_to_none(
                progress.last_scan_finished_at.load(Ordering::Relaxed),
            ),
            last_error: progress.last_error.lock().clone(),
        }
    }

    /// Indexes are not known to be fresh: work is running or files wait.
    pub fn is_busy(&self) -> bool {
        self.state != ProjectState::Idle || self.dirty_files > 0 || self.queued_files > 0
    }
}

/// Returns the current Unix timestamp in seconds.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0)
}

fn zero_to_none(value: u64) -> Option<u64> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_the_atomic() {
        let progress = ProjectProgress::default();
        assert_eq!(progress.state(), ProjectState::Idle);
        progress.set_state(ProjectState::Indexing);
        assert_eq!(progress.state(), ProjectState::Indexing);
        assert_eq!(progress.state().as_str(), "indexing");
    }

    #[test]
    fn pending_dirt_keeps_an_idle_project_busy() {
        let progress = ProjectProgress::default();
        assert!(!ProjectStatus::capture(&progress, 0, 0).is_busy());
        assert!(ProjectStatus::capture(&progress, 3, 0).is_busy());

        progress.set_state(ProjectState::Off);
        let status = ProjectStatus::capture(&progress, 0, 0);
        assert!(status.is_busy());
        assert_eq!(status.last_scan_finished_at, None);
    }
}
