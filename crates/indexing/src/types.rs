//! Core identifiers shared by every indexing component.

use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderRef;

/// Stable handle of a file within one VFS epoch. Paths are never used for
/// tracking because they change on rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(i32);

impl FileId {
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i32 {
        self.0
    }

    /// Valid ids are non-negative; they double as record offsets.
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for FileId {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

/// Creation timestamp of the VFS instance that issued the file ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VfsEpoch(pub u64);

impl fmt::Display for VfsEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a file-set provider's roots come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginKind {
    Content,
    Library,
    Sdk,
    Orphan,
}

impl OriginKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Library => "library",
            Self::Sdk => "sdk",
            Self::Orphan => "orphan",
        }
    }
}

/// Name of a project as known to the machine-level index root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectKey(String);

impl ProjectKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name safe form used for per-project state files. The hash suffix
    /// keeps keys that sanitize to the same prefix apart.
    pub fn file_stem(&self) -> String {
        let prefix: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let mut hasher = FnvHasher::default();
        hasher.write(self.0.as_bytes());
        format!("{prefix}-{:016x}", hasher.finish())
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Answer of the stamp store when asked whether a file changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Changed {
    /// The store cannot be trusted to decide; use the authoritative check.
    Unknown,
    Yes,
    No,
}

/// Extent of a workspace roots change.
#[derive(Clone)]
pub enum RootsChangedScope {
    /// Anything may have changed; rescan everything.
    Total,
    /// Only the files reachable from these providers changed.
    Partial(Vec<ProviderRef>),
}

impl fmt::Debug for RootsChangedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Total => f.write_str("Total"),
            Self::Partial(providers) => f
                .debug_tuple("Partial")
                .field(&providers.iter().map(|p| p.debug_name()).collect::<Vec<_>>())
                .finish(),
        }
    }
}
