//! Result reporting.
//!
//! With the persistent channel enabled, records go onto the delivery queue.
//! Otherwise they are appended as JSON lines to the results log, which the
//! polling path posts on its own cycle.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::comms::queue::{QueueEntry, QueueSender};
use crate::timeline::TimelineRecord;

/// Where execution units send their result records.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn report(&self, records: &[TimelineRecord]);
}

/// Sink that drops everything (handlers disabled, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl ResultSink for NullSink {
    async fn report(&self, _records: &[TimelineRecord]) {}
}

/// Production reporter.
pub enum Reporter {
    Queue(QueueSender),
    /// The mutex serializes appends from concurrent units.
    Log { path: PathBuf, lock: Mutex<()> },
}

impl Reporter {
    pub fn queue(sender: QueueSender) -> Self {
        Reporter::Queue(sender)
    }

    pub fn log(path: PathBuf) -> Self {
        Reporter::Log {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn append(path: &PathBuf, records: &[TimelineRecord]) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl ResultSink for Reporter {
    async fn report(&self, records: &[TimelineRecord]) {
        match self {
            Reporter::Queue(sender) => {
                for record in records {
                    sender.enqueue(QueueEntry::results(record));
                }
            }
            Reporter::Log { path, lock } => {
                let _guard = lock.lock().await;
                if let Err(e) = Self::append(path, records).await {
                    tracing::warn!(path = %path.display(), "Failed to write results log: {}", e);
                }
            }
        }
    }
}
