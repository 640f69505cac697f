//! Durable outbox for writes the remote store has not accepted yet.
//!
//! A write is first tried against the remote store. If that fails, or the
//! device is offline, the write is appended to the outbox. Draining replays a
//! snapshot of the outbox in insertion order and removes each record, by id,
//! only once the remote store has accepted it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityHandle;
use crate::notify::{Level, NotificationSink};
use crate::remote::RemoteStore;
use crate::store::{schema, Collection, StoreError, StoreHandle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: u64,
    pub destination: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

pub struct OutboxCollection;

impl Collection for OutboxCollection {
    const NAME: &'static str = schema::OUTBOX;
    type Key = u64;
    type Record = OutboxRecord;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Records left in the outbox when the drain finished, including any
    /// enqueued while it ran.
    pub still_pending: usize,
    /// Snapshot passes run, counting follow-up passes requested by
    /// overlapping calls.
    pub passes: usize,
    /// True when another drain was already running; this call only asked it
    /// for a follow-up pass.
    pub coalesced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The remote store accepted the write directly.
    Delivered,
    /// The write was stored in the outbox under this id.
    Queued(u64),
}

#[derive(Debug, Default)]
struct DrainState {
    running: bool,
    follow_up: bool,
}

/// Exclusive right to run drain passes. Dropping it (including when a drain
/// future is cancelled) lets the next drain start.
struct DrainPermit<'a> {
    state: &'a Mutex<DrainState>,
    released: bool,
}

impl DrainPermit<'_> {
    /// Either consume a pending follow-up request (returns true) or give the
    /// permit back (returns false), atomically.
    fn continue_or_release(&mut self) -> bool {
        let mut state = lock(self.state);
        if state.follow_up {
            state.follow_up = false;
            true
        } else {
            state.running = false;
            self.released = true;
            false
        }
    }
}

impl Drop for DrainPermit<'_> {
    fn drop(&mut self) {
        if !self.released {
            lock(self.state).running = false;
        }
    }
}

fn lock(state: &Mutex<DrainState>) -> MutexGuard<'_, DrainState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct OutboxQueue {
    store: StoreHandle,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityHandle,
    sink: Arc<dyn NotificationSink>,
    drain_state: Mutex<DrainState>,
}

impl OutboxQueue {
    pub fn new(
        store: StoreHandle,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityHandle,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            sink,
            drain_state: Mutex::new(DrainState::default()),
        }
    }

    /// Deliver a write now if possible, otherwise keep it in the outbox.
    ///
    /// A remote failure is not an error here: the write is queued instead.
    /// Only a storage failure while queueing is returned.
    pub async fn submit(&self, destination: &str, payload: Value) -> Result<SubmitOutcome, StoreError> {
        if self.connectivity.is_online() {
            self.sink.notify("Sending to server...", Level::Info);
            match self.remote.insert(destination, &payload).await {
                Ok(()) => {
                    info!(destination, "Write delivered to remote store");
                    self.sink.notify("Data saved (server)", Level::Success);
                    return Ok(SubmitOutcome::Delivered);
                }
                Err(e) => {
                    warn!(destination, error = %e, "Remote write failed, falling back to outbox");
                }
            }
        }

        let id = self.enqueue(destination, payload).await?;
        Ok(SubmitOutcome::Queued(id))
    }

    /// Append a write to the outbox. The payload is stored verbatim.
    pub async fn enqueue(&self, destination: &str, payload: Value) -> Result<u64, StoreError> {
        let destination = destination.to_string();
        let id = self
            .store
            .write::<OutboxCollection, _, _>(move |tx| {
                let id = tx.allocate_id()?;
                let record = OutboxRecord {
                    id,
                    destination,
                    payload,
                    enqueued_at: Utc::now(),
                };
                tx.put(&id, &record)?;
                Ok(id)
            })
            .await?;

        info!(id, "Write queued in outbox");
        self.sink
            .notify("Offline: data saved on this device", Level::Warning);
        Ok(id)
    }

    /// Snapshot of every pending record in insertion order.
    pub async fn pending(&self) -> Result<Vec<OutboxRecord>, StoreError> {
        self.store
            .read::<OutboxCollection, _, _>(|tx| tx.get_all())
            .await
    }

    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        self.store
            .read::<OutboxCollection, _, _>(|tx| Ok(tx.count()))
            .await
    }

    pub fn is_draining(&self) -> bool {
        lock(&self.drain_state).running
    }

    fn try_begin_drain(&self) -> Option<DrainPermit<'_>> {
        let mut state = lock(&self.drain_state);
        if state.running {
            state.follow_up = true;
            return None;
        }
        state.running = true;
        Some(DrainPermit {
            state: &self.drain_state,
            released: false,
        })
    }

    /// Replay pending records against the remote store.
    ///
    /// If a drain is already running this returns at once with
    /// `coalesced: true`, and the running drain does one more pass over a
    /// fresh snapshot when its current pass ends. Two passes never overlap,
    /// so a record is never submitted twice concurrently.
    ///
    /// Errors are reported through the notification sink and logs, never
    /// returned.
    pub async fn drain(&self) -> DrainReport {
        let Some(mut permit) = self.try_begin_drain() else {
            debug!("Drain already running, follow-up pass requested");
            return DrainReport {
                coalesced: true,
                ..DrainReport::default()
            };
        };

        let mut report = DrainReport::default();
        loop {
            self.drain_pass(&mut report).await;
            if !permit.continue_or_release() {
                break;
            }
            debug!("Running follow-up drain pass");
        }

        report.still_pending = match self.pending_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Could not count pending records after drain");
                report.attempted - report.succeeded
            }
        };
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            still_pending = report.still_pending,
            passes = report.passes,
            "Outbox drain finished"
        );
        report
    }

    async fn drain_pass(&self, report: &mut DrainReport) {
        report.passes += 1;

        let pending = match self.pending().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "Could not read outbox for sync");
                self.sink
                    .notify("Sync failed: could not read pending data", Level::Warning);
                return;
            }
        };
        if pending.is_empty() {
            debug!("Outbox empty, nothing to sync");
            return;
        }

        self.sink.notify(
            &format!("Syncing {} pending records...", pending.len()),
            Level::Info,
        );

        let mut succeeded = 0;
        for record in &pending {
            report.attempted += 1;
            if let Err(e) = self.remote.insert(&record.destination, &record.payload).await {
                warn!(id = record.id, destination = %record.destination, error = %e, "Sync failed, record stays queued");
                continue;
            }
            match self.remove(record.id).await {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    warn!(id = record.id, error = %e, "Remote accepted record but removing it from the outbox failed");
                }
            }
        }

        report.succeeded += succeeded;
        let failed = pending.len() - succeeded;
        if succeeded > 0 {
            self.sink.notify(
                &format!("{} records synced to the server", succeeded),
                Level::Success,
            );
        }
        if failed > 0 {
            self.sink.notify(
                &format!("{} records still pending", failed),
                Level::Warning,
            );
        }
    }

    /// Delete exactly the record that was attempted, by id.
    async fn remove(&self, id: u64) -> Result<bool, StoreError> {
        self.store
            .write::<OutboxCollection, _, _>(|tx| tx.delete(&id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::Status;
    use crate::store::{MemoryBackend, Store};
    use crate::testing::{memory_store, RecordingRemote, RecordingSink};
    use serde_json::json;

    fn queue(
        store: StoreHandle,
        remote: Arc<RecordingRemote>,
        status: Status,
    ) -> (Arc<OutboxQueue>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let queue = OutboxQueue::new(store, remote, ConnectivityHandle::fixed(status), sink.clone());
        (Arc::new(queue), sink)
    }

    #[tokio::test]
    async fn test_offline_submit_is_removed_once_after_drain() {
        let remote = Arc::new(RecordingRemote::new());
        let (queue, sink) = queue(memory_store().await, remote.clone(), Status::Offline);

        let payload = json!({"unit": "PC200", "hours": 12});
        let outcome = queue.submit("daily_reports", payload.clone()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        assert_eq!(remote.call_count(), 0);
        assert!(sink.contains(Level::Warning, "saved on this device"));

        let report = queue.drain().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.still_pending, 0);
        assert_eq!(remote.calls(), vec![("daily_reports".to_string(), payload)]);
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_preserves_enqueue_order() {
        let remote = Arc::new(RecordingRemote::new());
        let (queue, _) = queue(memory_store().await, remote.clone(), Status::Offline);

        for n in 1..=3 {
            queue.enqueue("ppu", json!({"p": n})).await.unwrap();
        }
        queue.drain().await;

        let order: Vec<Value> = remote.calls().into_iter().map(|(_, p)| p).collect();
        assert_eq!(order, vec![json!({"p": 1}), json!({"p": 2}), json!({"p": 3})]);
    }

    #[tokio::test]
    async fn test_failed_record_does_not_block_the_rest() {
        let remote = Arc::new(RecordingRemote::failing_on(|p| p["p"] == 2));
        let (queue, sink) = queue(memory_store().await, remote.clone(), Status::Offline);

        for n in 1..=3 {
            queue.enqueue("ppu", json!({"p": n})).await.unwrap();
        }
        let report = queue.drain().await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.still_pending, 1);
        assert_eq!(remote.call_count(), 3);

        let left = queue.pending().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].payload, json!({"p": 2}));
        assert!(sink.contains(Level::Warning, "1 records still pending"));
        assert!(sink.contains(Level::Success, "2 records synced"));
    }

    #[tokio::test]
    async fn test_concurrent_drain_never_double_submits() {
        let (remote, gate) = RecordingRemote::gated();
        let remote = Arc::new(remote);
        let (queue, _) = queue(memory_store().await, remote.clone(), Status::Offline);
        for n in 1..=3 {
            queue.enqueue("ppu", json!({"p": n})).await.unwrap();
        }

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        remote.wait_started().await;
        assert!(queue.is_draining());

        let second = queue.drain().await;
        assert!(second.coalesced);
        assert_eq!(second.attempted, 0);

        gate.add_permits(10);
        let first = first.await.unwrap();

        assert_eq!(remote.call_count(), 3);
        assert_eq!(first.succeeded, 3);
        assert_eq!(first.passes, 2);
        assert_eq!(first.still_pending, 0);
        assert!(!queue.is_draining());
    }

    #[tokio::test]
    async fn test_records_enqueued_during_drain_are_kept() {
        let (remote, gate) = RecordingRemote::gated();
        let remote = Arc::new(remote);
        let (queue, _) = queue(memory_store().await, remote.clone(), Status::Offline);
        queue.enqueue("ppu", json!("before")).await.unwrap();

        let drain = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        remote.wait_started().await;
        let late = queue.enqueue("ppu", json!("during")).await.unwrap();

        gate.add_permits(10);
        let report = drain.await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.still_pending, 1);
        let left = queue.pending().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, late);
    }

    #[tokio::test]
    async fn test_online_submit_delivers_directly() {
        let remote = Arc::new(RecordingRemote::new());
        let (queue, sink) = queue(memory_store().await, remote.clone(), Status::Online);

        let outcome = queue.submit("dar", json!({"ok": true})).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Delivered);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert!(sink.contains(Level::Success, "Data saved"));
    }

    #[tokio::test]
    async fn test_online_submit_queues_when_remote_rejects() {
        let remote = Arc::new(RecordingRemote::failing_on(|_| true));
        let (queue, _) = queue(memory_store().await, remote.clone(), Status::Online);

        let outcome = queue.submit("dar", json!({"ok": false})).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        assert_eq!(remote.call_count(), 1);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_accepts_any_payload_shape() {
        let remote = Arc::new(RecordingRemote::new());
        let (queue, _) = queue(memory_store().await, remote, Status::Offline);

        for payload in [json!(null), json!("text"), json!([1, 2]), json!({"nested": {"a": []}})] {
            queue.enqueue("anything", payload).await.unwrap();
        }
        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 4);
        assert_eq!(pending[3].payload, json!({"nested": {"a": []}}));
    }

    #[tokio::test]
    async fn test_record_stays_when_delete_fails_after_remote_accepts() {
        let backend = MemoryBackend::new();
        let store = Store::new(backend.clone()).open().await.unwrap();
        let remote = Arc::new(RecordingRemote::new());
        let (queue, _) = queue(store, remote.clone(), Status::Offline);
        queue.enqueue("ppu", json!(1)).await.unwrap();

        backend.set_quota_exceeded(true);
        let report = queue.drain().await;

        assert_eq!(remote.call_count(), 1);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.still_pending, 1);
    }

    #[tokio::test]
    async fn test_outbox_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(RecordingRemote::new());
        {
            let store = Store::new(crate::store::FileBackend::new(dir.path()))
                .open()
                .await
                .unwrap();
            let (queue, _) = queue(store, remote.clone(), Status::Offline);
            queue.enqueue("dar", json!({"shift": "night"})).await.unwrap();
        }

        let store = Store::new(crate::store::FileBackend::new(dir.path()))
            .open()
            .await
            .unwrap();
        let (queue, _) = queue(store, remote.clone(), Status::Online);
        let report = queue.drain().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(remote.calls()[0].1, json!({"shift": "night"}));
    }
}
