//! Storage backends for the persistent store.
//!
//! A backend only knows how to load and save whole collections and the
//! schema manifest. Locking, migration and typed access live in
//! [`super::Store`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::StoreError;

/// Manifest file name in the store directory
const MANIFEST_FILE: &str = "manifest.json";

/// Probe file written at open time to detect unwritable storage
const PROBE_FILE: &str = ".probe";

/// Advisory lock file shared by every process using the store directory
const LOCK_FILE: &str = ".lock";

/// Persisted schema description: the version and every collection that
/// has ever been created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaManifest {
    pub version: u32,
    pub collections: BTreeSet<String>,
}

/// One collection as persisted: ordered encoded keys to JSON records, plus
/// the auto-increment counter. `next_id` only grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub next_id: u64,
    pub entries: BTreeMap<String, serde_json::Value>,
}

/// Exclusive write access to a backend. Released on drop.
pub struct StorageLock {
    _guard: Box<dyn Send + Sync>,
}

impl StorageLock {
    fn new(guard: impl Send + Sync + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Verify the storage can be written. Called once per open.
    async fn probe(&self) -> Result<(), StoreError>;

    /// Wait until no other writer holds the storage, in this process or
    /// any other, and hold it until the returned lock is dropped.
    async fn lock(&self) -> Result<StorageLock, StoreError>;

    async fn load_manifest(&self) -> Result<Option<SchemaManifest>, StoreError>;

    async fn save_manifest(&self, manifest: &SchemaManifest) -> Result<(), StoreError>;

    async fn load_table(&self, name: &str) -> Result<Option<RawTable>, StoreError>;

    /// Replace the persisted contents of a collection. Must be all-or-nothing.
    async fn save_table(&self, name: &str, table: &RawTable) -> Result<(), StoreError>;
}

// ============================================================================
// File backend
// ============================================================================

/// JSON-file backend: one file per collection plus a manifest, each written
/// through a temp file and renamed into place.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(classify_io(e)),
        }
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await.map_err(classify_io)?;
        tokio::fs::rename(&tmp, path).await.map_err(classify_io)?;
        Ok(())
    }
}

/// Map I/O failures that will not go away on retry to `Unavailable`.
fn classify_io(e: io::Error) -> StoreError {
    match e.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::StorageFull => {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Io(e),
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn probe(&self) -> Result<(), StoreError> {
        let unavailable = |e: io::Error| {
            StoreError::Unavailable(format!("{}: {}", self.dir.display(), e))
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(unavailable)?;
        let probe = self.dir.join(PROBE_FILE);
        tokio::fs::write(&probe, b"ok").await.map_err(unavailable)?;
        tokio::fs::remove_file(&probe).await.map_err(unavailable)?;
        debug!(dir = %self.dir.display(), "Storage probe succeeded");
        Ok(())
    }

    async fn lock(&self) -> Result<StorageLock, StoreError> {
        let path = self.dir.join(LOCK_FILE);
        let file = tokio::task::spawn_blocking(move || -> io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("lock task failed: {}", e)))?
        .map_err(classify_io)?;
        // Closing the file releases the lock
        Ok(StorageLock::new(file))
    }

    async fn load_manifest(&self) -> Result<Option<SchemaManifest>, StoreError> {
        Self::read_json(&self.dir.join(MANIFEST_FILE)).await
    }

    async fn save_manifest(&self, manifest: &SchemaManifest) -> Result<(), StoreError> {
        Self::write_json(&self.dir.join(MANIFEST_FILE), manifest).await
    }

    async fn load_table(&self, name: &str) -> Result<Option<RawTable>, StoreError> {
        Self::read_json(&self.table_path(name)).await
    }

    async fn save_table(&self, name: &str, table: &RawTable) -> Result<(), StoreError> {
        Self::write_json(&self.table_path(name), table).await
    }
}

// ============================================================================
// Memory backend
// ============================================================================

#[derive(Default)]
struct MemoryState {
    manifest: Option<SchemaManifest>,
    tables: HashMap<String, RawTable>,
}

/// In-process backend. Clones share the same contents, so a second
/// `Store` over a clone behaves like reopening the same database.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    disabled: Arc<AtomicBool>,
    quota_exceeded: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose probe always fails, as when device storage is disabled.
    pub fn disabled() -> Self {
        let backend = Self::default();
        backend.disabled.store(true, Ordering::SeqCst);
        backend
    }

    /// Make every subsequent write fail with `Unavailable`.
    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.quota_exceeded.store(exceeded, Ordering::SeqCst);
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory backend poisoned".to_string()))
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.quota_exceeded.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("quota exceeded".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn probe(&self) -> Result<(), StoreError> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("storage disabled".to_string()));
        }
        Ok(())
    }

    async fn lock(&self) -> Result<StorageLock, StoreError> {
        Ok(StorageLock::new(Arc::clone(&self.writer).lock_owned().await))
    }

    async fn load_manifest(&self) -> Result<Option<SchemaManifest>, StoreError> {
        Ok(self.state()?.manifest.clone())
    }

    async fn save_manifest(&self, manifest: &SchemaManifest) -> Result<(), StoreError> {
        self.check_writable()?;
        self.state()?.manifest = Some(manifest.clone());
        Ok(())
    }

    async fn load_table(&self, name: &str) -> Result<Option<RawTable>, StoreError> {
        Ok(self.state()?.tables.get(name).cloned())
    }

    async fn save_table(&self, name: &str, table: &RawTable) -> Result<(), StoreError> {
        self.check_writable()?;
        self.state()?.tables.insert(name.to_string(), table.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_file_backend_roundtrips_table() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("db"));
        backend.probe().await.unwrap();

        let mut table = RawTable::default();
        table.next_id = 3;
        table
            .entries
            .insert("a".to_string(), serde_json::json!({"x": 1}));
        backend.save_table("outbox", &table).await.unwrap();

        let loaded = backend.load_table("outbox").await.unwrap();
        assert_eq!(loaded, Some(table));
        assert!(!dir.path().join("db/outbox.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_backend_missing_table_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        assert!(backend.load_table("nope").await.unwrap().is_none());
        assert!(backend.load_manifest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_backend_probe_fails_when_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a dir").unwrap();

        let backend = FileBackend::new(blocker.join("db"));
        let err = backend.probe().await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_file_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileBackend::new(dir.path());
        let second = FileBackend::new(dir.path());
        first.probe().await.unwrap();

        let held = first.lock().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), second.lock()).await;
        assert!(blocked.is_err());

        drop(held);
        let acquired = tokio::time::timeout(Duration::from_secs(5), second.lock()).await;
        assert!(acquired.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_memory_backend_quota_exceeded() {
        let backend = MemoryBackend::new();
        backend.set_quota_exceeded(true);
        let err = backend
            .save_table("outbox", &RawTable::default())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        backend.set_quota_exceeded(false);
        backend.save_table("outbox", &RawTable::default()).await.unwrap();
    }
}
