//! Connectivity state and the online/offline state machine.
//!
//! [`ConnectivityMonitor`] is the single writer of the current [`Status`].
//! It is driven by external events (see [`ReachabilityProbe`] for the one the
//! CLI uses) and debounces them: only a real change of state counts as a
//! transition, and only an `Offline -> Online` transition drains the outbox.

pub mod probe;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::notify::{Level, NotificationSink};
use crate::outbox::{DrainReport, OutboxQueue};

pub use probe::{ReachabilityProbe, DEFAULT_PROBE_INTERVAL_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

impl Status {
    pub fn from_online(online: bool) -> Self {
        if online {
            Status::Online
        } else {
            Status::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Status::Online)
    }
}

/// Read side of the connectivity state, handed to components that need to
/// know whether the network is usable right now.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    rx: watch::Receiver<Status>,
}

impl ConnectivityHandle {
    /// A handle that always reports `status`, for one-shot commands and tests.
    pub fn fixed(status: Status) -> Self {
        let (_tx, rx) = watch::channel(status);
        Self { rx }
    }

    pub fn status(&self) -> Status {
        *self.rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    /// Wait for the next state change. Returns `None` once the monitor is gone.
    pub async fn changed(&mut self) -> Option<Status> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
}

pub struct ConnectivityMonitor {
    state: watch::Sender<Status>,
    outbox: Option<Arc<OutboxQueue>>,
    sink: Arc<dyn NotificationSink>,
}

impl ConnectivityMonitor {
    /// `initial` is the connectivity signal as read at startup.
    pub fn new(initial: Status, sink: Arc<dyn NotificationSink>) -> Self {
        let (state, _rx) = watch::channel(initial);
        Self {
            state,
            outbox: None,
            sink,
        }
    }

    /// Drain `outbox` on every `Offline -> Online` transition.
    pub fn with_outbox(mut self, outbox: Arc<OutboxQueue>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            rx: self.state.subscribe(),
        }
    }

    pub fn status(&self) -> Status {
        *self.state.borrow()
    }

    /// Apply one connectivity event. Returns the transition it caused, or
    /// `None` when the event repeats the current state.
    pub fn transition(&self, status: Status) -> Option<Transition> {
        let changed = self.state.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if !changed {
            debug!(?status, "Ignoring duplicate connectivity event");
            return None;
        }

        match status {
            Status::Online => {
                info!("Connectivity restored");
                self.sink.notify("System online", Level::Success);
                Some(Transition::WentOnline)
            }
            Status::Offline => {
                info!("Connectivity lost");
                self.sink
                    .notify("Connection lost. Offline mode active.", Level::Warning);
                Some(Transition::WentOffline)
            }
        }
    }

    /// Apply one event and, if it brought us online, drain the outbox
    /// before returning.
    pub async fn observe(&self, status: Status) -> Option<DrainReport> {
        match self.transition(status)? {
            Transition::WentOnline => {
                let outbox = self.outbox.as_ref()?;
                Some(outbox.drain().await)
            }
            Transition::WentOffline => None,
        }
    }

    /// Consume events until the sender side closes. Drains run as spawned
    /// tasks so later events are still processed while a drain is in flight.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Status>) {
        while let Some(status) = events.recv().await {
            if let Some(Transition::WentOnline) = self.transition(status) {
                if let Some(outbox) = self.outbox.clone() {
                    tokio::spawn(async move {
                        let report = outbox.drain().await;
                        debug!(?report, "Background drain finished");
                    });
                }
            }
        }
        debug!("Connectivity event stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, RecordingRemote, RecordingSink};
    use serde_json::json;
    use std::time::Duration;

    async fn queue_with_two_records(
        remote: Arc<RecordingRemote>,
        sink: Arc<RecordingSink>,
    ) -> Arc<OutboxQueue> {
        let queue = Arc::new(OutboxQueue::new(
            memory_store().await,
            remote,
            ConnectivityHandle::fixed(Status::Offline),
            sink,
        ));
        queue.enqueue("reports", json!({"n": 1})).await.unwrap();
        queue.enqueue("reports", json!({"n": 2})).await.unwrap();
        queue
    }

    #[test]
    fn test_fixed_handle_reports_status() {
        assert!(ConnectivityHandle::fixed(Status::Online).is_online());
        assert!(!ConnectivityHandle::fixed(Status::Offline).is_online());
        assert_eq!(Status::from_online(true), Status::Online);
    }

    #[test]
    fn test_duplicate_events_are_not_transitions() {
        let sink = Arc::new(RecordingSink::default());
        let monitor = ConnectivityMonitor::new(Status::Offline, sink.clone());

        assert_eq!(monitor.transition(Status::Offline), None);
        assert_eq!(monitor.transition(Status::Online), Some(Transition::WentOnline));
        assert_eq!(monitor.transition(Status::Online), None);
        assert_eq!(monitor.transition(Status::Offline), Some(Transition::WentOffline));
        assert_eq!(sink.messages().len(), 2);
    }

    #[test]
    fn test_handles_follow_monitor_state() {
        let monitor = ConnectivityMonitor::new(Status::Online, Arc::new(RecordingSink::default()));
        let handle = monitor.handle();
        assert!(handle.is_online());

        monitor.transition(Status::Offline);
        assert!(!handle.is_online());
        assert_eq!(monitor.status(), Status::Offline);
    }

    #[tokio::test]
    async fn test_online_transition_drains_exactly_once() {
        let remote = Arc::new(RecordingRemote::new());
        let sink = Arc::new(RecordingSink::default());
        let queue = queue_with_two_records(remote.clone(), sink.clone()).await;
        let monitor =
            ConnectivityMonitor::new(Status::Offline, sink.clone()).with_outbox(queue.clone());

        let report = monitor.observe(Status::Online).await.unwrap();
        assert_eq!(report.succeeded, 2);

        // Signal fires again for the same physical transition
        assert!(monitor.observe(Status::Online).await.is_none());
        assert_eq!(remote.call_count(), 2);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_transition_only_notifies() {
        let remote = Arc::new(RecordingRemote::new());
        let sink = Arc::new(RecordingSink::default());
        let queue = queue_with_two_records(remote.clone(), sink.clone()).await;
        let monitor =
            ConnectivityMonitor::new(Status::Online, sink.clone()).with_outbox(queue.clone());

        assert!(monitor.observe(Status::Offline).await.is_none());
        assert_eq!(remote.call_count(), 0);
        assert!(sink.contains(Level::Warning, "Offline mode"));
    }

    #[tokio::test]
    async fn test_starting_online_does_not_drain() {
        let remote = Arc::new(RecordingRemote::new());
        let sink = Arc::new(RecordingSink::default());
        let queue = queue_with_two_records(remote.clone(), sink.clone()).await;
        let monitor = ConnectivityMonitor::new(Status::Online, sink).with_outbox(queue);

        assert!(monitor.observe(Status::Online).await.is_none());
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_debounces_event_stream() {
        let remote = Arc::new(RecordingRemote::new());
        let sink = Arc::new(RecordingSink::default());
        let queue = queue_with_two_records(remote.clone(), sink.clone()).await;
        let monitor =
            Arc::new(ConnectivityMonitor::new(Status::Offline, sink).with_outbox(queue.clone()));

        let (tx, rx) = mpsc::channel(8);
        for status in [Status::Online, Status::Online, Status::Online] {
            tx.send(status).await.unwrap();
        }
        drop(tx);
        monitor.clone().run(rx).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.pending_count().await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(remote.call_count(), 2);
        assert_eq!(monitor.status(), Status::Online);
    }
}
