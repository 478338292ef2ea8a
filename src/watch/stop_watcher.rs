//! Stop sentinel: touching the file shuts the whole agent down.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::Orchestrator;
use crate::watch::{LastWriteGate, WatcherHandle, touches, watch_dir_for, watch_directory};

pub struct StopWatcher {
    orchestrator: Arc<Orchestrator>,
    path: PathBuf,
    gate: LastWriteGate,
    /// Cancelled once the orchestrator is terminated; the process exits after that.
    shutdown: CancellationToken,
}

impl StopWatcher {
    /// A sentinel left over from a previous run does not count.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        path: PathBuf,
        shutdown: CancellationToken,
    ) -> Self {
        let gate = LastWriteGate::new();
        gate.prime(&path);
        Self {
            orchestrator,
            path,
            gate,
            shutdown,
        }
    }

    /// Handle one notification. Returns `true` if shutdown was triggered.
    pub async fn on_change(&self) -> bool {
        if !self.gate.should_process(&self.path) {
            return false;
        }

        tracing::warn!(path = %self.path.display(), "Stop sentinel touched, shutting down");
        self.orchestrator.terminate().await;
        self.shutdown.cancel();
        true
    }

    pub fn spawn(self: Arc<Self>) -> Result<WatcherHandle> {
        let (watcher, mut events) = watch_directory(&watch_dir_for(&self.path))?;
        tracing::info!(path = %self.path.display(), "Watching stop sentinel");

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) if touches(&event, &self.path) => {
                            if self.on_change().await {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });

        Ok(WatcherHandle::new(watcher, task))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::comms::NullSink;
    use crate::handlers::HandlerRegistry;
    use crate::scheduler::{OrchestratorState, SchedulerSettings};

    fn orchestrator(dir: &std::path::Path) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            SchedulerSettings {
                timeline_path: dir.join("timeline.json"),
                stop_grace: Duration::from_secs(1),
                reload_settle: Duration::from_millis(1),
            },
            Arc::new(HandlerRegistry::with_builtins()),
            Arc::new(NullSink),
        ))
    }

    #[tokio::test]
    async fn stale_sentinel_is_ignored_until_touched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop.txt");
        std::fs::write(&path, "").unwrap();

        let shutdown = CancellationToken::new();
        let orchestrator = orchestrator(dir.path());
        let watcher = StopWatcher::new(orchestrator.clone(), path.clone(), shutdown.clone());
        assert!(!watcher.on_change().await);
        assert!(!shutdown.is_cancelled());

        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();

        assert!(watcher.on_change().await);
        assert!(shutdown.is_cancelled());
        assert_eq!(orchestrator.state().await, OrchestratorState::Terminated);
    }
}
