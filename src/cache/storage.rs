//! Storage Backends
//!
//! Byte-level stores underneath the durable tiers.
//!
//! - [`FlatStore`]: small string values in a flat keyed map
//! - [`FileStore`]: one blob per file name in a directory
//!
//! Each has an in-memory implementation for tests and a file-backed one.
//! File-backed writes go to a temp file first and are renamed into place, so
//! a crash never leaves a half-written file behind.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Flat string key-value store
#[async_trait]
pub trait FlatStore: Send + Sync {
    /// Get a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Put a value, replacing any previous one
    async fn put(&self, key: &str, value: String) -> Result<()>;

    /// Delete a value, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All keys currently stored
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Named blob store
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Read a file
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write a file, replacing any previous one
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Delete a file, returning whether it existed
    async fn delete(&self, name: &str) -> Result<bool>;

    /// All file names currently stored
    async fn list(&self) -> Result<Vec<String>>;
}

// =============================================================================
// In-Memory Backends
// =============================================================================

/// In-memory flat store for testing
#[derive(Debug, Default)]
pub struct InMemoryFlatStore {
    entries: DashMap<String, String>,
}

impl InMemoryFlatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FlatStore for InMemoryFlatStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

/// In-memory file store for testing
#[derive(Debug, Default)]
pub struct InMemoryFileStore {
    files: DashMap<String, Vec<u8>>,
    writes: AtomicU64,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Write operations performed
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.get(name).map(|v| v.value().clone()))
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_file_name(name)?;
        self.files.insert(name.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.files.remove(name).is_some())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.files.iter().map(|e| e.key().clone()).collect())
    }
}

// =============================================================================
// Namespaced View
// =============================================================================

/// A prefixed slice of another flat store
///
/// Lets bookkeeping such as the schema marker share a store with cache
/// entries without colliding with them. `keys` lists only this namespace,
/// with the prefix stripped.
pub struct NamespacedFlatStore {
    inner: Arc<dyn FlatStore>,
    prefix: String,
}

impl NamespacedFlatStore {
    pub fn new(inner: Arc<dyn FlatStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl FlatStore for NamespacedFlatStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(&self.scoped(key)).await
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.inner.put(&self.scoped(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(&self.scoped(key)).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .keys()
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}

// =============================================================================
// File-Backed Backends
// =============================================================================

/// Flat store persisted as one JSON object file
///
/// The whole map is held in memory and rewritten atomically on every change.
/// Intended for small values only; large payloads belong in a [`FileStore`].
pub struct JsonFileFlatStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
    /// Serializes snapshot + write so the file never goes backwards
    writer: tokio::sync::Mutex<()>,
}

impl JsonFileFlatStore {
    /// Open a store, loading the file if it exists.
    ///
    /// A file that fails to parse is treated as empty and replaced on the
    /// next write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = non_empty_parent(&path) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Flat store file is corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), entries = entries.len(), "Opened flat store");

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        let bytes = {
            let entries = self.entries.read();
            serde_json::to_vec(&*entries)?
        };
        write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl FlatStore for JsonFileFlatStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        self.persist().await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.entries.write().remove(key).is_some();
        if existed {
            self.persist().await?;
        }
        Ok(existed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// File store over a directory, one file per name
#[derive(Debug, Clone)]
pub struct DirFileStore {
    dir: PathBuf,
}

impl DirFileStore {
    /// Open a directory store, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl FileStore for DirFileStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        validate_file_name(name)?;
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_file_name(name)?;
        write_atomic(&self.dir.join(name), bytes).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_file_name(name)?;
        match tokio::fs::remove_file(self.dir.join(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            // Non-UTF-8 names and in-progress temp files are not ours
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Write `bytes` to `path` via a hidden temp file and a rename
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = non_empty_parent(path).unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Internal(format!("not a file path: {}", path.display())))?;
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn non_empty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn validate_file_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty file name"
    } else if name.starts_with('.') {
        "hidden file names are reserved"
    } else if name.contains(['/', '\\']) {
        "file name contains a path separator"
    } else {
        return Ok(());
    };
    Err(Error::InvalidKey {
        key: name.to_string(),
        reason: reason.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_flat_store() {
        let store = InMemoryFlatStore::new();
        store.put("a", "1".to_string()).await.unwrap();
        store.put("a", "2".to_string()).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.keys().await.unwrap(), vec!["a".to_string()]);
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_namespaced_store_is_isolated() {
        let shared = Arc::new(InMemoryFlatStore::new());
        shared.put("strava:activities:90", "abc".to_string()).await.unwrap();

        let meta = NamespacedFlatStore::new(shared.clone(), "meta/");
        meta.put("cache_schema_version", "3".to_string()).await.unwrap();

        assert_eq!(shared.get("meta/cache_schema_version").await.unwrap().as_deref(), Some("3"));
        assert_eq!(meta.get("strava:activities:90").await.unwrap(), None);
        assert_eq!(meta.keys().await.unwrap(), vec!["cache_schema_version".to_string()]);

        assert!(meta.delete("cache_schema_version").await.unwrap());
        assert_eq!(shared.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_file_store() {
        let store = InMemoryFileStore::new();
        store.write("k-a.entry", b"abc").await.unwrap();

        assert_eq!(store.read("k-a.entry").await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.read("missing").await.unwrap(), None);
        assert_eq!(store.writes(), 1);
        assert!(store.delete("k-a.entry").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_json_file_flat_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entries.json");

        {
            let store = JsonFileFlatStore::open(&path).await.unwrap();
            store.put("strava:activities:90", "abc".to_string()).await.unwrap();
            store.put("score:recovery:2025-01-01", "def".to_string()).await.unwrap();
            store.delete("score:recovery:2025-01-01").await.unwrap();
        }

        let store = JsonFileFlatStore::open(&path).await.unwrap();
        assert_eq!(
            store.get("strava:activities:90").await.unwrap().as_deref(),
            Some("abc")
        );
        assert_eq!(store.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_json_file_flat_store_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entries.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = JsonFileFlatStore::open(&path).await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());

        store.put("a", "1".to_string()).await.unwrap();
        let reopened = JsonFileFlatStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_dir_file_store() {
        let dir = TempDir::new().unwrap();
        let store = DirFileStore::open(dir.path().join("files")).await.unwrap();

        store.write("k-one.entry", b"1").await.unwrap();
        store.write("k-one.entry", b"2").await.unwrap();
        store.write("k-two.entry", b"3").await.unwrap();

        assert_eq!(store.read("k-one.entry").await.unwrap(), Some(b"2".to_vec()));
        let mut names = store.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["k-one.entry", "k-two.entry"]);

        assert!(store.delete("k-one.entry").await.unwrap());
        assert!(!store.delete("k-one.entry").await.unwrap());
        assert_eq!(store.read("k-one.entry").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dir_file_store_ignores_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = DirFileStore::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join(".k-x.entry.abc.tmp"), b"partial")
            .await
            .unwrap();
        store.write("k-x.entry", b"done").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["k-x.entry"]);
    }

    #[tokio::test]
    async fn test_file_names_are_validated() {
        let store = InMemoryFileStore::new();
        assert_matches!(
            store.write("../escape", b"x").await,
            Err(Error::InvalidKey { .. })
        );
        assert_matches!(store.write(".hidden", b"x").await, Err(Error::InvalidKey { .. }));
    }
}
