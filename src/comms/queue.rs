//! Delivery queue: many producers, one outbound consumer, FIFO.
//!
//! Entries live in memory only. Anything still queued when the process dies is lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::timeline::TimelineRecord;

/// What an entry carries, and so which channel method delivers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueEntryType {
    Heartbeat,
    Message,
    MessageSpecific,
    Results,
    Survey,
    Updates,
    Timeline,
}

impl QueueEntryType {
    /// Channel method name used to deliver this entry type.
    pub fn method(self) -> &'static str {
        match self {
            Self::Heartbeat => "SendHeartbeat",
            Self::Message => "SendMessage",
            Self::MessageSpecific => "SendSpecificMessage",
            Self::Results => "SendResults",
            Self::Survey => "SendSurvey",
            Self::Updates => "SendUpdates",
            Self::Timeline => "SendTimeline",
        }
    }
}

/// One queued outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub entry_type: QueueEntryType,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(entry_type: QueueEntryType, payload: serde_json::Value) -> Self {
        Self {
            entry_type,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(
            QueueEntryType::Heartbeat,
            serde_json::Value::String(Utc::now().to_rfc3339()),
        )
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::new(QueueEntryType::Message, serde_json::Value::String(text.into()))
    }

    /// One result record.
    pub fn results(record: &TimelineRecord) -> Self {
        let payload = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
        Self::new(QueueEntryType::Results, payload)
    }
}

/// Create a connected sender/receiver pair.
pub fn delivery_queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Producer handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<QueueEntry>,
}

impl QueueSender {
    /// Enqueue an entry. Returns `false` if the consumer is gone.
    pub fn enqueue(&self, entry: QueueEntry) -> bool {
        let entry_type = entry.entry_type;
        if self.tx.send(entry).is_err() {
            tracing::warn!(?entry_type, "Delivery queue closed, dropping entry");
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single consumer side.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<QueueEntry>,
}

impl QueueReceiver {
    /// Wait for the next entry. `None` once every sender is dropped and the queue is drained.
    pub async fn dequeue(&mut self) -> Option<QueueEntry> {
        self.rx.recv().await
    }

    /// Next entry if one is ready.
    pub fn try_dequeue(&mut self) -> Option<QueueEntry> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
