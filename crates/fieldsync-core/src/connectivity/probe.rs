//! TCP reachability checks used as the connectivity signal on hosts that
//! have no platform online/offline events.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use super::Status;

/// Default time between reachability checks
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 15;

/// A connect attempt slower than this counts as offline
const CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    host: String,
    port: u16,
    interval: Duration,
    timeout: Duration,
}

impl ReachabilityProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn check(&self) -> Status {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let online = matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)));
        debug!(host = %self.host, port = self.port, online, "Reachability check");
        Status::from_online(online)
    }

    /// Emit one event per check until the receiver is dropped. Every check
    /// is reported, including repeats; the monitor does the debouncing.
    pub async fn run(self, tx: mpsc::Sender<Status>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            let status = self.check().await;
            if tx.send(status).await.is_err() {
                break;
            }
        }
    }
}
