//! Composition root.
//!
//! Wires the store, outbox, artifact cache and connectivity monitor around
//! injected network collaborators. When the store reports it is unavailable
//! the engine keeps running network-only: writes go straight to the remote
//! store and artifacts are fetched on every request.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::artifacts::ArtifactCache;
use crate::assets::AssetProxy;
use crate::connectivity::{ConnectivityHandle, ConnectivityMonitor, Status};
use crate::notify::{Level, NotificationSink};
use crate::outbox::{DrainReport, OutboxQueue, SubmitOutcome};
use crate::remote::{Fetcher, RemoteError, RemoteStore};
use crate::store::{StorageBackend, Store, StoreError, StoreHandle};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Offline with no local storage to queue the write in
    #[error("Offline and local storage is unavailable; the write was not saved")]
    Offline,
}

pub struct Engine {
    store: Option<StoreHandle>,
    remote: Arc<dyn RemoteStore>,
    outbox: Option<Arc<OutboxQueue>>,
    artifacts: ArtifactCache,
    monitor: Arc<ConnectivityMonitor>,
    assets: Option<AssetProxy>,
    sink: Arc<dyn NotificationSink>,
}

impl Engine {
    /// Open the store over `backend` and build every component.
    ///
    /// `StoreError::Unavailable` is absorbed (network-only mode); any other
    /// store error, such as a schema downgrade, is returned.
    pub async fn open(
        backend: impl StorageBackend + 'static,
        remote: Arc<dyn RemoteStore>,
        fetcher: Arc<dyn Fetcher>,
        initial: Status,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, StoreError> {
        let store = match Store::new(backend).open().await {
            Ok(handle) => Some(handle),
            Err(e) if e.is_unavailable() => {
                warn!(error = %e, "Local storage unavailable, running network-only");
                sink.notify(
                    "Local storage unavailable. Changes will only be sent while online.",
                    Level::Warning,
                );
                None
            }
            Err(e) => return Err(e),
        };

        let monitor = ConnectivityMonitor::new(initial, sink.clone());
        let connectivity = monitor.handle();

        let outbox = store.clone().map(|handle| {
            Arc::new(OutboxQueue::new(
                handle,
                remote.clone(),
                connectivity.clone(),
                sink.clone(),
            ))
        });
        let monitor = match outbox {
            Some(ref queue) => monitor.with_outbox(queue.clone()),
            None => monitor,
        };

        let artifacts = ArtifactCache::new(store.clone(), fetcher, connectivity, sink.clone());

        info!(
            persistent = store.is_some(),
            schema_version = store.as_ref().map(|s| s.schema_version()).unwrap_or_default(),
            ?initial,
            "Engine ready"
        );

        Ok(Self {
            store,
            remote,
            outbox,
            artifacts,
            monitor: Arc::new(monitor),
            assets: None,
            sink,
        })
    }

    pub fn with_assets(mut self, proxy: AssetProxy) -> Self {
        self.assets = Some(proxy);
        self
    }

    /// False when running network-only.
    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&StoreHandle> {
        self.store.as_ref()
    }

    pub fn outbox(&self) -> Option<&Arc<OutboxQueue>> {
        self.outbox.as_ref()
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn assets(&self) -> Option<&AssetProxy> {
        self.assets.as_ref()
    }

    pub fn monitor(&self) -> Arc<ConnectivityMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn connectivity(&self) -> ConnectivityHandle {
        self.monitor.handle()
    }

    /// Submit a write. With an outbox this never fails on remote errors;
    /// network-only, remote errors are returned to the caller.
    pub async fn submit(&self, destination: &str, payload: Value) -> Result<SubmitOutcome, EngineError> {
        if let Some(ref outbox) = self.outbox {
            return Ok(outbox.submit(destination, payload).await?);
        }

        if !self.monitor.status().is_online() {
            self.sink
                .notify("Offline and this device cannot store data. Not saved.", Level::Warning);
            return Err(EngineError::Offline);
        }

        self.sink.notify("Sending to server...", Level::Info);
        match self.remote.insert(destination, &payload).await {
            Ok(()) => {
                self.sink.notify("Data saved (server)", Level::Success);
                Ok(SubmitOutcome::Delivered)
            }
            Err(e) => {
                warn!(destination, error = %e, "Direct write failed with no outbox to fall back on");
                self.sink.notify("Could not reach the server. Not saved.", Level::Warning);
                Err(e.into())
            }
        }
    }

    /// Drain the outbox now. `None` when running network-only.
    pub async fn drain(&self) -> Option<DrainReport> {
        match self.outbox {
            Some(ref outbox) => Some(outbox.drain().await),
            None => None,
        }
    }

    /// Pending outbox records; zero when running network-only.
    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        match self.outbox {
            Some(ref outbox) => outbox.pending_count().await,
            None => Ok(0),
        }
    }
}
