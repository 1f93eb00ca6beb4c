//! Supervisor event feed.
//!
//! Log lines and stream state transitions are fanned out to any number of
//! subscribers over a bounded broadcast channel. Publishing never waits: a
//! subscriber that falls behind loses its oldest events, and publishing with
//! no subscribers at all is fine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::relay::StreamStatus;

/// Default channel capacity for supervisor events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// Human-readable operator message.
    Log { message: String, level: LogLevel },
    /// A stream record changed status.
    StreamUpdate {
        id: String,
        status: StreamStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl SupervisorEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
            level: LogLevel::Info,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
            level: LogLevel::Error,
        }
    }

    pub fn stream_update(id: impl Into<String>, status: StreamStatus, error: Option<String>) -> Self {
        Self::StreamUpdate {
            id: id.into(),
            status,
            error,
        }
    }
}

/// Broadcaster for supervisor events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    /// Create a new bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new bus with specified per-subscriber capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish an event.
    ///
    /// Log events are mirrored to `tracing`. Returns the number of subscribers
    /// the event was queued for.
    pub fn publish(&self, event: SupervisorEvent) -> usize {
        match &event {
            SupervisorEvent::Log {
                message,
                level: LogLevel::Info,
            } => info!(target: "stream_relay::events", "{message}"),
            SupervisorEvent::Log {
                message,
                level: LogLevel::Error,
            } => error!(target: "stream_relay::events", "{message}"),
            SupervisorEvent::StreamUpdate { id, status, error } => {
                debug!(stream_id = %id, %status, error = ?error, "Publishing stream update")
            }
        }
        self.sender.send(event).unwrap_or(0)
    }

    /// Publish an info-level log event.
    pub fn log_info(&self, message: impl Into<String>) {
        self.publish(SupervisorEvent::info(message));
    }

    /// Publish an error-level log event.
    pub fn log_error(&self, message: impl Into<String>) {
        self.publish(SupervisorEvent::error(message));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's view of the event feed.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<SupervisorEvent>,
}

impl EventSubscription {
    /// Wait for the next event.
    ///
    /// Events dropped because this subscriber lagged are skipped. Returns
    /// `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SupervisorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, dropping oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SupervisorEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, dropping oldest events");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every event currently queued.
    pub fn drain(&mut self) -> Vec<SupervisorEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
