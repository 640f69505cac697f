//! Versioned snapshot storage for the asset proxy.
//!
//! A snapshot is written in one piece: it either appears complete under its
//! version or not at all. The index records which version is live.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AssetError;
use crate::artifacts::record::digest_hex;
use crate::remote::FetchedResponse;

const INDEX_FILE: &str = "index.json";
const ENTRIES_FILE: &str = "entries.json";
const STAGING_PREFIX: &str = ".staging-";

/// Metadata for one cached resource. The body is stored by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub status: u16,
    pub content_type: Option<String>,
    pub digest: String,
}

/// A fully fetched snapshot, ready to be written.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub version: String,
    /// Request key (path and query) to response
    pub resources: BTreeMap<String, FetchedResponse>,
}

impl Snapshot {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            resources: BTreeMap::new(),
        }
    }

    fn split(&self) -> (BTreeMap<String, SnapshotEntry>, HashMap<String, Vec<u8>>) {
        let mut entries = BTreeMap::new();
        let mut blobs = HashMap::new();
        for (key, response) in &self.resources {
            let digest = digest_hex(&response.body);
            entries.insert(
                key.clone(),
                SnapshotEntry {
                    status: response.status,
                    content_type: response.content_type.clone(),
                    digest: digest.clone(),
                },
            );
            blobs.entry(digest).or_insert_with(|| response.body.clone());
        }
        (entries, blobs)
    }
}

#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Versions with a complete snapshot, sorted.
    async fn versions(&self) -> Result<Vec<String>, AssetError>;

    /// Store `snapshot` atomically, replacing any snapshot with the same version.
    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), AssetError>;

    async fn entries(&self, version: &str) -> Result<BTreeMap<String, SnapshotEntry>, AssetError>;

    async fn read_body(&self, version: &str, digest: &str) -> Result<Vec<u8>, AssetError>;

    /// Delete a snapshot. Deleting a missing version is not an error.
    async fn delete_snapshot(&self, version: &str) -> Result<(), AssetError>;

    async fn live_version(&self) -> Result<Option<String>, AssetError>;

    async fn set_live_version(&self, version: &str) -> Result<(), AssetError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotIndex {
    live: Option<String>,
}

// ============================================================================
// Directory storage
// ============================================================================

/// One directory per version under `root`, with bodies stored by digest.
/// Snapshots are built in a staging directory and renamed into place.
pub struct DirSnapshotStorage {
    root: PathBuf,
}

impl DirSnapshotStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn version_dir(&self, version: &str) -> Result<PathBuf, AssetError> {
        validate_name(version)?;
        Ok(self.root.join(version))
    }

    async fn write_staged(&self, staging: &Path, snapshot: &Snapshot) -> Result<(), AssetError> {
        let (entries, blobs) = snapshot.split();
        tokio::fs::create_dir_all(staging).await?;
        for (digest, body) in &blobs {
            tokio::fs::write(staging.join(digest), body).await?;
        }
        // Written last: its presence marks the snapshot complete
        tokio::fs::write(staging.join(ENTRIES_FILE), serde_json::to_vec_pretty(&entries)?).await?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), AssetError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(|c: char| c == '/' || c == '\\' || c.is_control());
    if bad {
        return Err(AssetError::InvalidName(name.to_string()));
    }
    Ok(())
}

async fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl SnapshotStorage for DirSnapshotStorage {
    async fn versions(&self) -> Result<Vec<String>, AssetError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            if tokio::fs::try_exists(entry.path().join(ENTRIES_FILE)).await? {
                versions.push(name);
            }
        }
        versions.sort();
        Ok(versions)
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), AssetError> {
        let target = self.version_dir(&snapshot.version)?;
        let staging = self
            .root
            .join(format!("{}{}", STAGING_PREFIX, snapshot.version));
        remove_dir_if_present(&staging).await?;

        if let Err(e) = self.write_staged(&staging, snapshot).await {
            let _ = remove_dir_if_present(&staging).await;
            return Err(e);
        }

        remove_dir_if_present(&target).await?;
        tokio::fs::rename(&staging, &target).await?;
        debug!(version = %snapshot.version, resources = snapshot.resources.len(), "Snapshot written");
        Ok(())
    }

    async fn entries(&self, version: &str) -> Result<BTreeMap<String, SnapshotEntry>, AssetError> {
        let path = self.version_dir(version)?.join(ENTRIES_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(AssetError::NotInstalled(version.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_body(&self, version: &str, digest: &str) -> Result<Vec<u8>, AssetError> {
        validate_name(digest)?;
        Ok(tokio::fs::read(self.version_dir(version)?.join(digest)).await?)
    }

    async fn delete_snapshot(&self, version: &str) -> Result<(), AssetError> {
        remove_dir_if_present(&self.version_dir(version)?).await?;
        Ok(())
    }

    async fn live_version(&self) -> Result<Option<String>, AssetError> {
        match tokio::fs::read(self.root.join(INDEX_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice::<SnapshotIndex>(&bytes)?.live),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_live_version(&self, version: &str) -> Result<(), AssetError> {
        validate_name(version)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let index = SnapshotIndex {
            live: Some(version.to_string()),
        };
        let path = self.root.join(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&index)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

// ============================================================================
// Memory storage
// ============================================================================

#[derive(Default)]
struct StoredSnapshot {
    entries: BTreeMap<String, SnapshotEntry>,
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct MemorySnapshots {
    snapshots: BTreeMap<String, StoredSnapshot>,
    live: Option<String>,
}

/// In-process snapshot storage. Clones share contents.
#[derive(Clone, Default)]
pub struct MemorySnapshotStorage {
    state: Arc<Mutex<MemorySnapshots>>,
}

impl MemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemorySnapshots>, AssetError> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("snapshot storage poisoned").into())
    }
}

#[async_trait]
impl SnapshotStorage for MemorySnapshotStorage {
    async fn versions(&self) -> Result<Vec<String>, AssetError> {
        Ok(self.lock()?.snapshots.keys().cloned().collect())
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), AssetError> {
        let (entries, blobs) = snapshot.split();
        self.lock()?
            .snapshots
            .insert(snapshot.version.clone(), StoredSnapshot { entries, blobs });
        Ok(())
    }

    async fn entries(&self, version: &str) -> Result<BTreeMap<String, SnapshotEntry>, AssetError> {
        self.lock()?
            .snapshots
            .get(version)
            .map(|s| s.entries.clone())
            .ok_or_else(|| AssetError::NotInstalled(version.to_string()))
    }

    async fn read_body(&self, version: &str, digest: &str) -> Result<Vec<u8>, AssetError> {
        self.lock()?
            .snapshots
            .get(version)
            .and_then(|s| s.blobs.get(digest).cloned())
            .ok_or_else(|| AssetError::NotInstalled(version.to_string()))
    }

    async fn delete_snapshot(&self, version: &str) -> Result<(), AssetError> {
        self.lock()?.snapshots.remove(version);
        Ok(())
    }

    async fn live_version(&self) -> Result<Option<String>, AssetError> {
        Ok(self.lock()?.live.clone())
    }

    async fn set_live_version(&self, version: &str) -> Result<(), AssetError> {
        self.lock()?.live = Some(version.to_string());
        Ok(())
    }
}
