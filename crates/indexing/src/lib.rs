//! Incremental indexing scheduler.
//!
//! This crate keeps content indexes of open projects fresh:
//! - Per-file stamps deciding which files need reindexing
//! - Persistent dirty file queues and an orphan queue for closed projects
//! - Scanning sessions feeding a batched indexing queue
//! - A per-project scan executor with full/partial task merging
//! - An off/on tumbler guarding index reconfiguration and recovery

pub mod cancel;
pub mod config;
pub mod dirty;
pub mod error;
pub mod executor;
pub mod indexer;
pub mod layout;
pub mod orphan;
pub mod persist;
pub mod project;
pub mod provider;
pub mod queue;
pub mod service;
pub mod session;
pub mod stamp;
pub mod status;
pub mod tumbler;
pub mod types;
pub mod version;

// Re-export main types
pub use cancel::CancellationToken;
pub use config::IndexingConfig;
pub use error::{IndexingError, Result};
pub use executor::{ScanKind, ScanRequest, TaskHandle, TaskOutcome, TaskSummary};
pub use indexer::{ContentIndexer, ContentLoader, IndexError};
pub use layout::IndexRoot;
pub use project::ProjectScheduler;
pub use provider::{
    DirectoryProvider, FileIdResolver, FileListProvider, FileSetProvider, PathTable, ProviderRef,
    ProviderRegistry,
};
pub use service::{ActionReport, IndexingService};
pub use stamp::{IndexingStamp, StampStore, VersionMask};
pub use status::{ProjectState, ProjectStatus};
pub use tumbler::{RescanDecision, TumblerState};
pub use types::{Changed, FileId, OriginKind, ProjectKey, RootsChangedScope, VfsEpoch};
