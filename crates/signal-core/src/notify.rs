//! Fire-and-forget notification fan-out.
//!
//! Producers call [`NotificationHub::notify`], which only enqueues. A single
//! dispatcher task drains the queue and hands each event to every sink; a
//! failing sink is logged and skipped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::Result;

/// Redis channels for pub/sub.
pub mod channels {
    pub const EVENTS: &str = "gate:events";
}

/// Kinds of events emitted by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SignalRejected,
    RiskDenied,
    OrderSubmitted,
    OrderFilled,
    OrderRejected,
    OrderFailed,
    OrderCancelled,
    ModeChanged,
    UnlockFailed,
    UnlockLockout,
    SafeModeEntered,
    CapitalScaled,
    DailyReset,
}

/// A single notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Destination for notifications (dashboards, chat bots, logs).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &Event) -> Result<()>;
}

/// Handle used by the pipeline to emit events. Cheap to clone.
#[derive(Clone)]
pub struct NotificationHub {
    tx: mpsc::Sender<Event>,
}

impl NotificationHub {
    /// Start the dispatcher task and return the producer handle.
    pub fn spawn(buffer: usize, sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(buffer.max(1));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    if let Err(e) = sink.deliver(&event).await {
                        warn!(
                            sink = sink.name(),
                            event_type = ?event.event_type,
                            error = %e,
                            "Notification delivery failed"
                        );
                    }
                }
            }
            debug!("Notification dispatcher stopped");
        });

        Self { tx }
    }

    /// Enqueue an event. Never waits; drops the event if the queue is full.
    pub fn notify(&self, event_type: EventType, payload: serde_json::Value) {
        let event = Event {
            event_type,
            payload,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.tx.try_send(event) {
            warn!(event_type = ?event_type, error = %e, "Dropping notification");
        }
    }
}

/// In-process broadcast, for live subscribers and tests.
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn deliver(&self, event: &Event) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Publishes events as JSON to a Redis channel.
pub struct RedisSink {
    redis: redis::aio::ConnectionManager,
    channel: String,
}

impl RedisSink {
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let redis = redis::aio::ConnectionManager::new(client).await?;
        let channel = channel.into();
        info!(channel = %channel, "Redis notification sink connected");
        Ok(Self { redis, channel })
    }
}

#[async_trait]
impl NotificationSink for RedisSink {
    fn name(&self) -> &str {
        "redis"
    }

    async fn deliver(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.redis.clone();
        let _: () = conn.publish(&self.channel, payload).await?;
        Ok(())
    }
}

/// Writes events to the tracing log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &Event) -> Result<()> {
        info!(event_type = ?event.event_type, payload = %event.payload, "event");
        Ok(())
    }
}
