//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};

use crate::notify::{Level, Notification, NotificationSink};
use crate::remote::{FetchedResponse, Fetcher, RemoteError, RemoteStore};
use crate::store::{MemoryBackend, Store, StoreHandle};

pub async fn memory_store() -> StoreHandle {
    Store::new(MemoryBackend::new()).open().await.unwrap()
}

type Predicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Remote store that records every insert in call order.
pub struct RecordingRemote {
    calls: Mutex<Vec<(String, Value)>>,
    fail_when: Predicate,
    gate: Option<Arc<Semaphore>>,
    started: Notify,
}

impl RecordingRemote {
    pub fn new() -> Self {
        Self::failing_on(|_| false)
    }

    /// Reject every payload matching `pred`.
    pub fn failing_on(pred: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_when: Box::new(pred),
            gate: None,
            started: Notify::new(),
        }
    }

    /// Every insert waits for a permit on the returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut remote = Self::new();
        remote.gate = Some(gate.clone());
        (remote, gate)
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Resolves once at least one insert has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl RemoteStore for RecordingRemote {
    async fn insert(&self, destination: &str, payload: &Value) -> Result<(), RemoteError> {
        self.calls
            .lock()
            .unwrap()
            .push((destination.to_string(), payload.clone()));
        self.started.notify_one();

        if let Some(ref gate) = self.gate {
            gate.acquire()
                .await
                .map_err(|e| RemoteError::ServerError(e.to_string()))?
                .forget();
        }

        if (self.fail_when)(payload) {
            return Err(RemoteError::Rejected {
                status: 400,
                body: "rejected by test".to_string(),
            });
        }
        Ok(())
    }
}

/// Fetcher serving canned responses and counting requests.
#[derive(Default)]
pub struct CountingFetcher {
    responses: Mutex<HashMap<String, FetchedResponse>>,
    requests: Mutex<Vec<String>>,
    unreachable: AtomicBool,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, body: &[u8]) -> Self {
        self.set_response(url, FetchedResponse::ok(body));
        self
    }

    pub fn set_response(&self, url: &str, response: FetchedResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn get(&self, url: &str) -> Result<FetchedResponse, RemoteError> {
        self.requests.lock().unwrap().push(url.to_string());
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::ServerError("network unreachable".to_string()));
        }
        let response = self.responses.lock().unwrap().get(url).cloned();
        Ok(response.unwrap_or(FetchedResponse {
            status: 404,
            content_type: None,
            body: Vec::new(),
        }))
    }
}

/// Sink that keeps every notification.
#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.level == level && n.message.contains(needle))
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, message: &str, level: Level) {
        self.seen.lock().unwrap().push(Notification {
            message: message.to_string(),
            level,
        });
    }
}
