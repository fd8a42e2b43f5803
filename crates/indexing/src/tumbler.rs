//! Off/on protocol guarding index reconfiguration.
//!
//! `turn_off` nests: only the outermost call suspends work, captures the
//! version snapshot and writes the corruption marker before storage is
//! released. Only the innermost `turn_on` reloads storage and decides
//! between a full rescan and a rescan of the persisted dirty files.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::{IndexingError, Result};
use crate::layout::IndexRoot;
use crate::version::VersionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TumblerState {
    On = 0,
    TurningOff = 1,
    Off = 2,
    TurningOn = 3,
}

impl TumblerState {
    fn load(atomic: &AtomicU8) -> Self {
        match atomic.load(Ordering::SeqCst) {
            1 => Self::TurningOff,
            2 => Self::Off,
            3 => Self::TurningOn,
            _ => Self::On,
        }
    }

    fn store(self, atomic: &AtomicU8) {
        atomic.store(self as u8, Ordering::SeqCst);
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::TurningOff => "turning_off",
            Self::Off => "off",
            Self::TurningOn => "turning_on",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescanDecision {
    Full { reason: String },
    /// Only the persisted dirty files need another look.
    Partial,
}

impl RescanDecision {
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

/// What the tumbler switches off and on.
pub trait TumblerTarget: Send + Sync {
    /// Cancels running work and keeps new work from starting.
    fn suspend(&self, reason: &str);

    fn version_snapshot(&self) -> VersionSnapshot;

    /// Flushes and releases index storage.
    fn release_storage(&self) -> Result<()>;

    /// Reopens storage. An error means it could not be trusted.
    fn reload_storage(&self) -> Result<()>;

    /// Lets work run again, starting with the rescan described by `decision`.
    fn resume(&self, decision: &RescanDecision);
}

#[derive(Debug)]
struct TumblerInner {
    nesting: usize,
    snapshot: Option<VersionSnapshot>,
    off_reasons: Vec<String>,
    release_failed: Option<String>,
}

#[derive(Debug)]
pub struct Tumbler {
    root: IndexRoot,
    inner: Mutex<TumblerInner>,
    /// Readable without `inner`, which is held across suspend and resume.
    state: AtomicU8,
    invalidation_requested: AtomicBool,
}

impl Tumbler {
    pub fn new(root: IndexRoot) -> Self {
        Self {
            root,
            inner: Mutex::new(TumblerInner {
                nesting: 0,
                snapshot: None,
                off_reasons: Vec::new(),
                release_failed: None,
            }),
            state: AtomicU8::new(TumblerState::On as u8),
            invalidation_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TumblerState {
        TumblerState::load(&self.state)
    }

    pub fn nesting(&self) -> usize {
        self.inner.lock().nesting
    }

    pub fn turn_off(&self, reason: &str, target: &dyn TumblerTarget) {
        let mut inner = self.inner.lock();
        inner.nesting += 1;
        inner.off_reasons.push(reason.to_string());
        if inner.nesting > 1 {
            log::debug!(
                "indexing tumbler nested off nesting={} reason={}",
                inner.nesting,
                reason
            );
            return;
        }

        log::info!("indexing tumbler turning off reason={}", reason);
        TumblerState::TurningOff.store(&self.state);
        target.suspend(reason);
        inner.snapshot = Some(target.version_snapshot());

        if let Err(error) = self.root.write_corruption_marker(reason) {
            log::error!("failed to write corruption marker: {}", error);
            self.invalidation_requested.store(true, Ordering::SeqCst);
        }
        inner.release_failed = match target.release_storage() {
            Ok(()) => None,
            Err(error) => {
                log::error!("failed to release index storage: {}", error);
                Some(error.to_string())
            }
        };
        TumblerState::Off.store(&self.state);
    }

    /// Returns the rescan decision when this call switched indexing back on,
    /// `None` for an inner call of a nested region.
    pub fn turn_on(&self, target: &dyn TumblerTarget) -> Result<Option<RescanDecision>> {
        let mut inner = self.inner.lock();
        if inner.nesting == 0 {
            return Err(IndexingError::InvalidInput(
                "indexing tumbler is already on".to_string(),
            ));
        }
        inner.nesting -= 1;
        if inner.nesting > 0 {
            return Ok(None);
        }

        TumblerState::TurningOn.store(&self.state);
        let decision = match target.reload_storage() {
            Err(error) => {
                log::error!("index storage reload failed: {}", error);
                RescanDecision::Full {
                    reason: format!("storage reload failed: {error}"),
                }
            }
            Ok(()) => {
                let decision = self.decide(&inner, &target.version_snapshot());
                if let Err(error) = self.root.clear_corruption_marker() {
                    log::warn!("failed to clear corruption marker: {}", error);
                }
                decision
            }
        };

        inner.snapshot = None;
        inner.off_reasons.clear();
        inner.release_failed = None;
        TumblerState::On.store(&self.state);
        log::info!("indexing tumbler on decision={:?}", decision);
        target.resume(&decision);
        Ok(Some(decision))
    }

    fn decide(&self, inner: &TumblerInner, fresh: &VersionSnapshot) -> RescanDecision {
        let mut reasons = Vec::new();
        if let Some(captured) = inner.snapshot.as_ref() {
            reasons.extend(fresh.diff(captured));
        }
        if self.invalidation_requested.swap(false, Ordering::SeqCst) {
            reasons.push(format!(
                "invalidation requested: {}",
                self.root
                    .corruption_marker()
                    .unwrap_or_else(|| inner.off_reasons.join("; "))
            ));
        }
        if let Some(reason) = inner.release_failed.as_ref() {
            reasons.push(format!("storage release failed: {reason}"));
        }
        if reasons.is_empty() {
            RescanDecision::Partial
        } else {
            RescanDecision::Full {
                reason: reasons.join("; "),
            }
        }
    }

    /// Marks indexes inconsistent; the next `turn_on` performs a full rescan,
    /// and so does the next start if the process dies first. Idempotent.
    pub fn require_invalidation(&self, reason: &str) -> Result<()> {
        let already = self.invalidation_requested.swap(true, Ordering::SeqCst);
        if !already {
            log::info!("index invalidation required reason={}", reason);
        }
        if self.root.corruption_marker().is_none() {
            self.root.write_corruption_marker(reason)?;
        }
        Ok(())
    }

    pub fn invalidation_requested(&self) -> bool {
        self.invalidation_requested.load(Ordering::SeqCst)
    }

    /// Deletes index storage except the allow-list. Only valid while off.
    pub fn drop_indexes(&self) -> Result<Vec<String>> {
        let _inner = self.inner.lock();
        let state = self.state();
        if state != TumblerState::Off {
            return Err(IndexingError::InvalidInput(format!(
                "drop_indexes requires indexing off, state is {}",
                state.as_str()
            )));
        }
        let problems = self.root.drop_indexes();
        self.invalidation_requested.store(true, Ordering::SeqCst);
        log::info!("indexes dropped problems={}", problems.len());
        Ok(problems)
    }
}
