//! Cache-first proxy for the application's own static assets.
//!
//! At install time every resource in the fixed [`AssetManifest`] is fetched
//! into a snapshot tagged with the manifest version. Activation makes that
//! snapshot live and deletes every other one, so exactly one snapshot is
//! ever served. Requests to other origins are never intercepted.

pub mod error;
pub mod storage;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::notify::{Level, NotificationSink};
use crate::remote::{FetchedResponse, Fetcher, RemoteError};

pub use error::AssetError;
pub use storage::{DirSnapshotStorage, MemorySnapshotStorage, Snapshot, SnapshotEntry, SnapshotStorage};

/// Maximum number of manifest resources fetched at once during install
const MAX_CONCURRENT_FETCHES: usize = 6;

/// The fixed list of same-origin resources making up one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub version: String,
    /// Paths relative to the application origin, e.g. `/index.html`
    pub resources: Vec<String>,
}

impl AssetManifest {
    pub fn new(version: impl Into<String>, resources: Vec<String>) -> Self {
        Self {
            version: version.into(),
            resources,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub method: Method,
    pub url: Url,
}

impl AssetRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOutcome {
    /// Not intercepted; the caller performs the request itself
    Passthrough,
    Cached(FetchedResponse),
    Network(FetchedResponse),
}

struct LiveSnapshot {
    version: String,
    entries: BTreeMap<String, SnapshotEntry>,
}

pub struct AssetProxy {
    origin: Url,
    manifest: AssetManifest,
    storage: Arc<dyn SnapshotStorage>,
    network: Arc<dyn Fetcher>,
    sink: Arc<dyn NotificationSink>,
    live: RwLock<Option<LiveSnapshot>>,
}

/// Cache key for a URL: path plus query string.
fn request_key(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

impl AssetProxy {
    pub fn new(
        origin: Url,
        manifest: AssetManifest,
        storage: Arc<dyn SnapshotStorage>,
        network: Arc<dyn Fetcher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            origin,
            manifest,
            storage,
            network,
            sink,
            live: RwLock::new(None),
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    pub async fn live_version(&self) -> Option<String> {
        self.live.read().await.as_ref().map(|l| l.version.clone())
    }

    fn resolve(&self, resource: &str) -> Result<Url, AssetError> {
        let url = self
            .origin
            .join(resource)
            .map_err(|_| AssetError::InvalidName(resource.to_string()))?;
        if url.origin() != self.origin.origin() {
            return Err(AssetError::InvalidName(resource.to_string()));
        }
        Ok(url)
    }

    /// Fetch every manifest resource into a snapshot for the manifest
    /// version. Nothing is stored unless every fetch succeeds. A version
    /// that already has a complete snapshot is not fetched again.
    pub async fn install(&self) -> Result<(), AssetError> {
        let version = self.manifest.version.as_str();
        if self.storage.versions().await?.iter().any(|v| v == version) {
            debug!(version, "Asset snapshot already installed");
            return Ok(());
        }

        let targets = self
            .manifest
            .resources
            .iter()
            .map(|r| self.resolve(r).map(|url| (request_key(&url), url)))
            .collect::<Result<Vec<_>, _>>()?;
        info!(version, resources = targets.len(), "Installing asset snapshot");

        let network = &self.network;
        let results: Vec<_> = stream::iter(targets)
            .map(|(key, url)| async move {
                let result = network.get(url.as_str()).await;
                (key, url, result)
            })
            .buffer_unordered(MAX_CONCURRENT_FETCHES)
            .collect()
            .await;

        let mut snapshot = Snapshot::new(version);
        for (key, url, result) in results {
            match result {
                Ok(response) if response.is_success() => {
                    snapshot.resources.insert(key, response);
                }
                Ok(response) => {
                    return Err(self.install_failed(&url, format!("status {}", response.status)));
                }
                Err(e) => return Err(self.install_failed(&url, e.to_string())),
            }
        }

        self.storage.write_snapshot(&snapshot).await?;
        info!(version, resources = snapshot.resources.len(), "Asset snapshot installed");
        Ok(())
    }

    fn install_failed(&self, url: &Url, reason: String) -> AssetError {
        warn!(version = %self.manifest.version, url = %url, reason = %reason, "Asset snapshot install failed");
        self.sink
            .notify("Offline assets could not be updated.", Level::Warning);
        AssetError::Install {
            version: self.manifest.version.clone(),
            resource: url.to_string(),
            reason,
        }
    }

    /// Make the manifest version live and delete every other snapshot.
    pub async fn activate(&self) -> Result<(), AssetError> {
        let version = self.manifest.version.clone();
        let entries = self.storage.entries(&version).await?;
        self.storage.set_live_version(&version).await?;
        *self.live.write().await = Some(LiveSnapshot {
            version: version.clone(),
            entries,
        });

        for old in self.storage.versions().await? {
            if old != version {
                self.storage.delete_snapshot(&old).await?;
                info!(version = %old, "Deleted stale asset snapshot");
            }
        }

        info!(version = %version, "Asset snapshot active");
        self.sink.notify("Offline assets ready.", Level::Success);
        Ok(())
    }

    /// Serve whatever snapshot the storage records as live, without
    /// installing anything. Returns the live version, if any.
    pub async fn load_live(&self) -> Result<Option<String>, AssetError> {
        let Some(version) = self.storage.live_version().await? else {
            return Ok(None);
        };
        let entries = self.storage.entries(&version).await?;
        *self.live.write().await = Some(LiveSnapshot {
            version: version.clone(),
            entries,
        });
        Ok(Some(version))
    }

    /// Install the manifest version if needed, then activate it. When the
    /// install fails the previously live snapshot keeps being served.
    pub async fn start(&self) -> Result<(), AssetError> {
        if let Err(e) = self.install().await {
            match self.load_live().await {
                Ok(Some(previous)) => info!(version = %previous, "Keeping previous asset snapshot"),
                Ok(None) => {}
                Err(load) => warn!(error = %load, "Could not load previous asset snapshot"),
            }
            return Err(e);
        }
        self.activate().await
    }

    /// Apply the per-request policy: other origins and non-GET requests
    /// pass through, same-origin GETs are served from the live snapshot
    /// and fall back to the network on a miss. Network responses are
    /// never added to the snapshot.
    pub async fn handle(&self, request: &AssetRequest) -> Result<ProxyOutcome, RemoteError> {
        if request.url.origin() != self.origin.origin() || request.method != Method::GET {
            return Ok(ProxyOutcome::Passthrough);
        }

        let key = request_key(&request.url);
        if let Some(response) = self.lookup(&key).await {
            debug!(key = %key, "Asset served from snapshot");
            return Ok(ProxyOutcome::Cached(response));
        }

        debug!(key = %key, "Asset not in snapshot, fetching");
        let response = self.network.get(request.url.as_str()).await?;
        Ok(ProxyOutcome::Network(response))
    }

    async fn lookup(&self, key: &str) -> Option<FetchedResponse> {
        let (version, entry) = {
            let live = self.live.read().await;
            let live = live.as_ref()?;
            (live.version.clone(), live.entries.get(key)?.clone())
        };
        match self.storage.read_body(&version, &entry.digest).await {
            Ok(body) => Some(FetchedResponse {
                status: entry.status,
                content_type: entry.content_type,
                body,
            }),
            Err(e) => {
                warn!(key, error = %e, "Snapshot read failed, falling back to network");
                None
            }
        }
    }
}
