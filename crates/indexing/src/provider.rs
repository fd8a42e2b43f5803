//! File-set providers and the extension registry.
//!
//! A provider enumerates the files under one kind of root; the scheduler
//! never assumes thread affinity and may call [`FileSetProvider::iterate`]
//! from any scanning worker.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use ignore::WalkBuilder;
use parking_lot::RwLock;

use crate::cancel::CancellationToken;
use crate::error::{IndexingError, Result};
use crate::indexer::{ContentIndexer, ContentLoader};
use crate::types::{FileId, OriginKind};
use crate::version::{SnapshotEntry, VersionSnapshot};

/// Receives every file a provider enumerates. An error aborts the provider.
pub type FileVisitor<'a> = dyn FnMut(FileId) -> Result<()> + 'a;

pub trait FileSetProvider: Send + Sync {
    fn iterate(&self, visitor: &mut FileVisitor<'_>, cancel: &CancellationToken) -> Result<()>;

    /// Stable name; providers with equal names are interchangeable when
    /// merging scan requests.
    fn debug_name(&self) -> String;

    fn origin(&self) -> OriginKind;
}

pub type ProviderRef = Arc<dyn FileSetProvider>;

/// Maps canonical file identity to a [`FileId`].
pub trait FileIdResolver: Send + Sync {
    fn resolve(&self, path: &Path) -> Option<FileId>;
}

/// In-memory path table that hands out dense ids on first sight.
#[derive(Debug, Default)]
pub struct PathTable {
    next_id: AtomicI32,
    inner: RwLock<PathTableInner>,
}

#[derive(Debug, Default)]
struct PathTableInner {
    ids: FnvHashMap<PathBuf, FileId>,
    paths: FnvHashMap<FileId, PathBuf>,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of `path`, assigning one if the path is new.
    /// Symlinks are resolved so that every alias shares one id.
    pub fn intern(&self, path: &Path) -> FileId {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if let Some(file_id) = self.inner.read().ids.get(&canonical) {
            return *file_id;
        }
        let mut inner = self.inner.write();
        if let Some(file_id) = inner.ids.get(&canonical) {
            return *file_id;
        }
        let file_id = FileId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        inner.ids.insert(canonical.clone(), file_id);
        inner.paths.insert(file_id, canonical);
        file_id
    }

    pub fn path_of(&self, file_id: FileId) -> Option<PathBuf> {
        self.inner.read().paths.get(&file_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileIdResolver for PathTable {
    fn resolve(&self, path: &Path) -> Option<FileId> {
        Some(self.intern(path))
    }
}

impl ContentLoader for PathTable {
    fn load(&self, file_id: FileId) -> std::io::Result<Option<Vec<u8>>> {
        let Some(path) = self.path_of(file_id) else {
            return Ok(None);
        };
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }
}

/// Walks one directory tree, honoring `.ignore`/`.gitignore` files.
pub struct DirectoryProvider {
    root: PathBuf,
    origin: OriginKind,
    resolver: Arc<dyn FileIdResolver>,
    include_hidden: bool,
}

impl DirectoryProvider {
    pub fn new(
        root: impl Into<PathBuf>,
        origin: OriginKind,
        resolver: Arc<dyn FileIdResolver>,
    ) -> Self {
        Self {
            root: root.into(),
            origin,
            resolver,
            include_hidden: false,
        }
    }

    pub fn include_hidden(mut self, include_hidden: bool) -> Self {
        self.include_hidden = include_hidden;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileSetProvider for DirectoryProvider {
    fn iterate(&self, visitor: &mut FileVisitor<'_>, cancel: &CancellationToken) -> Result<()> {
        if !self.root.is_dir() {
            return Err(IndexingError::Provider {
                provider: self.debug_name(),
                reason: format!("root {} is not a directory", self.root.display()),
            });
        }

        let walker = WalkBuilder::new(&self.root)
            .hidden(!self.include_hidden)
            .follow_links(true)
            .parents(false)
            .build();

        for entry in walker {
            cancel.check()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    log::debug!("skipping entry under {}: {}", self.root.display(), error);
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|file_type| file_type.is_file()) {
                continue;
            }
            if let Some(file_id) = self.resolver.resolve(entry.path()) {
                visitor(file_id)?;
            }
        }
        Ok(())
    }

    fn debug_name(&self) -> String {
        format!("{}:{}", self.origin.as_str(), self.root.display())
    }

    fn origin(&self) -> OriginKind {
        self.origin
    }
}

/// Fixed list of ids, used to rescan dirty and orphaned files.
#[derive(Debug, Clone)]
pub struct FileListProvider {
    name: String,
    origin: OriginKind,
    file_ids: Vec<FileId>,
}

impl FileListProvider {
    pub fn new(name: impl Into<String>, origin: OriginKind, file_ids: Vec<FileId>) -> Self {
        Self {
            name: name.into(),
            origin,
            file_ids,
        }
    }

    pub fn len(&self) -> usize {
        self.file_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_ids.is_empty()
    }
}

impl FileSetProvider for FileListProvider {
    fn iterate(&self, visitor: &mut FileVisitor<'_>, cancel: &CancellationToken) -> Result<()> {
        for &file_id in &self.file_ids {
            cancel.check()?;
            visitor(file_id)?;
        }
        Ok(())
    }

    fn debug_name(&self) -> String {
        self.name.clone()
    }

    fn origin(&self) -> OriginKind {
        self.origin
    }
}

/// Extension points, fixed once the registry is built and shared by
/// reference with every scheduler component.
pub struct ProviderRegistry {
    set_providers: Vec<ProviderRef>,
    extractors: Vec<Arc<dyn ContentIndexer>>,
    contributors: Vec<String>,
    content_loader: Arc<dyn ContentLoader>,
}

impl ProviderRegistry {
    pub fn builder(content_loader: Arc<dyn ContentLoader>) -> ProviderRegistryBuilder {
        ProviderRegistryBuilder {
            registry: Self {
                set_providers: Vec::new(),
                extractors: Vec::new(),
                contributors: Vec::new(),
                content_loader,
            },
        }
    }

    /// Providers of `project_providers` followed by the machine-level set
    /// providers, without duplicate names.
    pub fn list_providers(&self, project_providers: &[ProviderRef]) -> Vec<ProviderRef> {
        let mut seen = Vec::new();
        let mut providers = Vec::new();
        for provider in project_providers.iter().chain(self.set_providers.iter()) {
            let name = provider.debug_name();
            if !seen.contains(&name) {
                seen.push(name);
                providers.push(provider.clone());
            }
        }
        providers
    }

    pub fn extractors(&self) -> &[Arc<dyn ContentIndexer>] {
        &self.extractors
    }

    pub fn extractor_names(&self) -> Vec<String> {
        self.extractors.iter().map(|extractor| extractor.name()).collect()
    }

    pub fn content_loader(&self) -> &Arc<dyn ContentLoader> {
        &self.content_loader
    }

    pub fn version_snapshot(&self) -> VersionSnapshot {
        let extractors = self
            .extractors
            .iter()
            .map(|extractor| SnapshotEntry::extractor(extractor.name(), extractor.version()));
        let contributors = self.contributors.iter().map(SnapshotEntry::contributor);
        let providers = self
            .set_providers
            .iter()
            .map(|provider| SnapshotEntry::set_provider(provider.debug_name()));
        VersionSnapshot::new(extractors.chain(contributors).chain(providers))
    }
}

pub struct ProviderRegistryBuilder {
    registry: ProviderRegistry,
}

impl ProviderRegistryBuilder {
    pub fn set_provider(mut self, provider: ProviderRef) -> Self {
        self.registry.set_providers.push(provider);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn ContentIndexer>) -> Self {
        self.registry.extractors.push(extractor);
        self
    }

    pub fn contributor(mut self, name: impl Into<String>) -> Self {
        self.registry.contributors.push(name.into());
        self
    }

    pub fn build(self) -> Result<ProviderRegistry> {
        let mut names = self.registry.extractor_names();
        names.sort();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(IndexingError::InvalidInput(format!(
                "extractor {} registered twice",
                pair[0]
            )));
        }
        Ok(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn collect(provider: &dyn FileSetProvider) -> Result<Vec<FileId>> {
        let mut ids = Vec::new();
        provider.iterate(
            &mut |file_id| {
                ids.push(file_id);
                Ok(())
            },
            &CancellationToken::noop(),
        )?;
        ids.sort_unstable();
        Ok(ids)
    }

    #[test]
    fn directory_provider_honors_ignore_files() {
        let tmp = TempDir::new().expect("tempdir");
        fs::write(tmp.path().join("a.rs"), "fn a() {}").expect("a");
        fs::write(tmp.path().join("b.log"), "noise").expect("b");
        fs::create_dir(tmp.path().join("sub")).expect("sub");
        fs::write(tmp.path().join("sub").join("c.rs"), "fn c() {}").expect("c");
        fs::write(tmp.path().join(".ignore"), "*.log\n").expect("ignore");

        let table = Arc::new(PathTable::new());
        let provider = DirectoryProvider::new(tmp.path(), OriginKind::Content, table.clone());
        let ids = collect(&provider).expect("iterate");

        assert_eq!(ids.len(), 2);
        let mut names: Vec<String> = ids
            .iter()
            .filter_map(|id| table.path_of(*id))
            .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.rs".to_string(), "c.rs".to_string()]);
    }

    #[test]
    fn missing_root_is_a_provider_error() {
        let tmp = TempDir::new().expect("tempdir");
        let provider = DirectoryProvider::new(
            tmp.path().join("gone"),
            OriginKind::Library,
            Arc::new(PathTable::new()),
        );
        let error = collect(&provider).expect_err("must fail");
        assert!(matches!(error, IndexingError::Provider { .. }));
    }

    #[test]
    fn cancelled_walk_stops() {
        let tmp = TempDir::new().expect("tempdir");
        fs::write(tmp.path().join("a.rs"), "").expect("a");
        let provider =
            DirectoryProvider::new(tmp.path(), OriginKind::Content, Arc::new(PathTable::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = provider
            .iterate(&mut |_| Ok(()), &cancel)
            .expect_err("cancelled");
        assert!(error.is_cancellation());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_file_shares_its_id() {
        let tmp = TempDir::new().expect("tempdir");
        let target = tmp.path().join("lib.rs");
        fs::write(&target, "pub fn lib() {}").expect("target");
        let alias = tmp.path().join("alias.rs");
        std::os::unix::fs::symlink(&target, &alias).expect("symlink");

        let table = PathTable::new();
        assert_eq!(table.intern(&target), table.intern(&alias));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn path_table_loads_content_and_reports_deleted_files() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("doc.txt");
        fs::write(&path, "hello").expect("write");
        let table = PathTable::new();
        let file_id = table.intern(&path);

        assert_eq!(table.load(file_id).expect("load"), Some(b"hello".to_vec()));
        fs::remove_file(&path).expect("remove");
        assert_eq!(table.load(file_id).expect("load deleted"), None);
        assert_eq!(table.load(FileId::new(99)).expect("unknown"), None);
    }

    #[test]
    fn file_list_provider_checks_cancellation_per_file() {
        let provider = FileListProvider::new(
            "dirty",
            OriginKind::Content,
            vec![FileId::new(1), FileId::new(2)],
        );
        assert_eq!(collect(&provider).expect("iterate"), vec![FileId::new(1), FileId::new(2)]);

        let cancel = CancellationToken::new();
        let mut seen = 0;
        let result = provider.iterate(
            &mut |_| {
                seen += 1;
                cancel.cancel();
                Ok(())
            },
            &cancel,
        );
        assert!(matches!(result, Err(IndexingError::Cancelled)));
        assert_eq!(seen, 1);
    }
}
