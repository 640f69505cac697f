//! Network collaborators.
//!
//! The engine only needs two things from the network: inserting a payload
//! into a remote collection ([`RemoteStore`]) and fetching a resource by URL
//! ([`Fetcher`]). Both are traits so tests and alternative transports can
//! stand in for [`RestClient`].

pub mod client;
pub mod error;

use async_trait::async_trait;
use serde_json::Value;

pub use client::RestClient;
pub use error::RemoteError;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert `payload` into `destination`. Ok means the remote accepted it.
    async fn insert(&self, destination: &str, payload: &Value) -> Result<(), RemoteError>;
}

/// A fetched resource, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedResponse, RemoteError>;
}
