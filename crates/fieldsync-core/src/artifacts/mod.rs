//! Local cache for large, read-only documents (manuals, drawings).
//!
//! Entries are keyed by source URL and never expire: a hit is served without
//! touching the network, however old it is. [`ArtifactCache::refetch`] is the
//! only way to replace an entry, and [`ArtifactCache::clear`] the only way to
//! remove entries.

pub mod record;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityHandle;
use crate::notify::{Level, NotificationSink};
use crate::remote::{Fetcher, RemoteError};
use crate::store::{StoreError, StoreHandle};

pub use record::{ArtifactCollection, CachedArtifact};

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Offline and '{0}' has never been downloaded")]
    UnavailableOffline(String),

    #[error("Download of '{key}' failed: {source}")]
    Fetch {
        key: String,
        #[source]
        source: RemoteError,
    },

    #[error("Download of '{key}' failed with status {status}")]
    BadStatus { key: String, status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactProgress {
    CacheHit,
    Downloading,
}

impl fmt::Display for ArtifactProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactProgress::CacheHit => f.write_str("cache-hit"),
            ArtifactProgress::Downloading => f.write_str("downloading"),
        }
    }
}

pub struct ArtifactCache {
    /// `None` when storage is unavailable; every lookup then goes to network.
    store: Option<StoreHandle>,
    fetcher: Arc<dyn Fetcher>,
    connectivity: ConnectivityHandle,
    sink: Arc<dyn NotificationSink>,
}

impl ArtifactCache {
    pub fn new(
        store: Option<StoreHandle>,
        fetcher: Arc<dyn Fetcher>,
        connectivity: ConnectivityHandle,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            fetcher,
            connectivity,
            sink,
        }
    }

    /// Return the cached payload for `key`, downloading and caching it on a
    /// miss. A failure to cache a downloaded payload is logged, and the
    /// payload is still returned.
    pub async fn get_or_fetch(
        &self,
        key: &str,
        on_progress: impl Fn(ArtifactProgress),
    ) -> Result<Vec<u8>, ArtifactError> {
        if let Some(cached) = self.lookup(key).await {
            debug!(key, bytes = cached.size(), "Artifact served from cache");
            on_progress(ArtifactProgress::CacheHit);
            self.sink.notify("Opening from cache...", Level::Info);
            return Ok(cached.payload);
        }

        self.require_online(key)?;
        self.download(key, &on_progress).await
    }

    /// Download `key` again and overwrite any cached copy.
    pub async fn refetch(
        &self,
        key: &str,
        on_progress: impl Fn(ArtifactProgress),
    ) -> Result<Vec<u8>, ArtifactError> {
        self.require_online(key)?;
        self.download(key, &on_progress).await
    }

    pub async fn is_cached(&self, key: &str) -> bool {
        match &self.store {
            Some(store) => store
                .read::<ArtifactCollection, _, _>(|tx| Ok(tx.contains(key)))
                .await
                .unwrap_or(false),
            None => false,
        }
    }

    /// Keys of every cached entry, sorted.
    pub async fn cached_keys(&self) -> Result<Vec<String>, StoreError> {
        self.store()?
            .read::<ArtifactCollection, _, _>(|tx| Ok(tx.keys()))
            .await
    }

    /// Every cached entry in key order.
    pub async fn entries(&self) -> Result<Vec<CachedArtifact>, StoreError> {
        self.store()?
            .read::<ArtifactCollection, _, _>(|tx| tx.get_all())
            .await
    }

    /// Remove every cached artifact.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store()?
            .write::<ArtifactCollection, _, _>(|tx| tx.clear())
            .await?;
        info!("Artifact cache cleared");
        self.sink.notify("Document cache cleared.", Level::Warning);
        Ok(())
    }

    fn store(&self) -> Result<&StoreHandle, StoreError> {
        self.store
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("artifact storage disabled".to_string()))
    }

    fn require_online(&self, key: &str) -> Result<(), ArtifactError> {
        if self.connectivity.is_online() {
            return Ok(());
        }
        self.sink.notify(
            "You are offline and this document has not been downloaded yet.",
            Level::Warning,
        );
        Err(ArtifactError::UnavailableOffline(key.to_string()))
    }

    async fn lookup(&self, key: &str) -> Option<CachedArtifact> {
        let store = self.store.as_ref()?;
        match store.read::<ArtifactCollection, _, _>(|tx| tx.get(key)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key, error = %e, "Artifact lookup failed, treating as miss");
                None
            }
        }
    }

    async fn download(
        &self,
        key: &str,
        on_progress: &impl Fn(ArtifactProgress),
    ) -> Result<Vec<u8>, ArtifactError> {
        on_progress(ArtifactProgress::Downloading);
        self.sink.notify("Downloading document...", Level::Info);
        info!(key, "Downloading artifact");

        let response = self.fetcher.get(key).await.map_err(|source| {
            self.sink.notify("Document download failed.", Level::Warning);
            ArtifactError::Fetch {
                key: key.to_string(),
                source,
            }
        })?;
        if !response.is_success() {
            self.sink.notify("Document download failed.", Level::Warning);
            return Err(ArtifactError::BadStatus {
                key: key.to_string(),
                status: response.status,
            });
        }

        let artifact = CachedArtifact::new(key, response.body, response.content_type);
        self.cache(&artifact).await;
        Ok(artifact.payload)
    }

    async fn cache(&self, artifact: &CachedArtifact) {
        let Some(store) = &self.store else {
            return;
        };
        let result = store
            .write::<ArtifactCollection, _, _>(|tx| tx.put(&artifact.key, artifact))
            .await;
        match result {
            Ok(()) => debug!(key = %artifact.key, digest = %artifact.digest, "Artifact cached"),
            Err(e) => {
                warn!(key = %artifact.key, error = %e, "Could not cache artifact, returning it uncached");
                self.sink
                    .notify("Document opened but could not be saved for offline use.", Level::Warning);
            }
        }
    }
}
