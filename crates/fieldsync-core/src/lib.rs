//! Fieldsync Core - offline persistence and sync engine.
//!
//! This crate keeps a client working without a network connection:
//!
//! - [`outbox`] buffers writes the remote store has not accepted and replays
//!   them when connectivity returns
//! - [`artifacts`] caches large read-only documents by source URL
//! - [`assets`] serves the application's static assets from a versioned
//!   local snapshot
//! - [`connectivity`] turns online/offline events into outbox drains
//!
//! All persistence goes through [`store`]. Network access goes through the
//! [`remote::RemoteStore`] and [`remote::Fetcher`] traits, and user-facing
//! status goes to a [`notify::NotificationSink`]. [`engine::Engine`] wires
//! them together.

pub mod artifacts;
pub mod assets;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod notify;
pub mod outbox;
pub mod remote;
pub mod store;

#[cfg(test)]
mod testing;

pub use artifacts::{ArtifactCache, ArtifactError, ArtifactProgress, CachedArtifact};
pub use assets::{AssetError, AssetManifest, AssetProxy, AssetRequest, ProxyOutcome};
pub use config::Config;
pub use connectivity::{ConnectivityHandle, ConnectivityMonitor, ReachabilityProbe, Status};
pub use engine::{Engine, EngineError};
pub use notify::{ChannelSink, Level, Notification, NotificationSink, TracingSink};
pub use outbox::{DrainReport, OutboxQueue, OutboxRecord, SubmitOutcome};
pub use remote::{FetchedResponse, Fetcher, RemoteError, RemoteStore, RestClient};
pub use store::{FileBackend, MemoryBackend, Store, StoreError, StoreHandle};

/// URL type used by the asset proxy and remote client
pub use reqwest::Url;
