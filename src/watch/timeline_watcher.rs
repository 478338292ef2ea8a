//! Reloads the orchestrator when the timeline file changes.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::Orchestrator;
use crate::watch::{LastWriteGate, WatcherHandle, touches, watch_dir_for, watch_directory};

pub struct TimelineWatcher {
    orchestrator: Arc<Orchestrator>,
    path: PathBuf,
    gate: LastWriteGate,
}

impl TimelineWatcher {
    /// The file's current state counts as already processed.
    pub fn new(orchestrator: Arc<Orchestrator>, path: PathBuf) -> Self {
        let gate = LastWriteGate::new();
        gate.prime(&path);
        Self {
            orchestrator,
            path,
            gate,
        }
    }

    /// Handle one change notification. Returns `true` if a reload ran.
    pub async fn on_change(&self) -> bool {
        if !self.gate.should_process(&self.path) {
            return false;
        }

        tracing::info!(path = %self.path.display(), "Timeline file changed, reloading");
        match self.orchestrator.reload().await {
            Ok(launched) => tracing::info!(launched, "Timeline reloaded"),
            Err(e) => tracing::warn!("Timeline reload failed: {}", e),
        }
        true
    }

    /// Start watching. Events are handled one at a time, in order.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Result<WatcherHandle> {
        let (watcher, mut events) = watch_directory(&watch_dir_for(&self.path))?;
        tracing::info!(path = %self.path.display(), "Watching timeline file");

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) if touches(&event, &self.path) => {
                            self.on_change().await;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            tracing::debug!("Timeline watcher stopped");
        });

        Ok(WatcherHandle::new(watcher, task))
    }
}
