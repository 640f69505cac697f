//! Status notifications.
//!
//! Every state change the engine goes through (enqueue, drain results,
//! cache hits, connectivity changes) is reported to a [`NotificationSink`].
//! Sinks are fire-and-forget: `notify` must return immediately and never
//! fail the operation that produced the message.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Info => "info",
            Level::Success => "success",
            Level::Warning => "warning",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub level: Level,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, level: Level);
}

/// Renders notifications as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, message: &str, level: Level) {
        match level {
            Level::Warning => warn!(%level, "{}", message),
            Level::Info | Level::Success => info!(%level, "{}", message),
        }
    }
}

/// Forwards notifications to a channel for a front end to display.
///
/// Uses `try_send`, so a full or closed channel drops the message instead
/// of blocking the caller.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Notification>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, message: &str, level: Level) {
        let notification = Notification {
            message: message.to_string(),
            level,
        };
        if let Err(e) = self.tx.try_send(notification) {
            warn!(error = %e, "Dropped notification");
        }
    }
}
