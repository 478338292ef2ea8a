//! Drop-directory listener.
//!
//! Files matching the configured glob are parsed as a timeline (or a single
//! handler), every handler is launched ad hoc, and the file is renamed to
//! `{stem}-{uuid}.processed` so it never matches again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::EventKind;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ConfigError, Result};
use crate::scheduler::Orchestrator;
use crate::timeline::DropDocument;
use crate::timeline::ingest::parse_drop_document;
use crate::watch::{WatcherHandle, watch_directory};

pub const PROCESSED_EXTENSION: &str = "processed";

pub struct DirectoryListener {
    orchestrator: Arc<Orchestrator>,
    directory: PathBuf,
    pattern: glob::Pattern,
    /// Paths being processed right now. A file usually raises several
    /// notifications while it is written; only the first one is handled.
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl DirectoryListener {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        directory: PathBuf,
        pattern: &str,
    ) -> Result<Self> {
        let pattern = glob::Pattern::new(pattern).map_err(|e| ConfigError::InvalidValue {
            key: "listener.pattern".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            orchestrator,
            directory,
            pattern,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Whether `path`'s file name matches the drop pattern.
    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.pattern.matches(name))
    }

    fn claim(&self, path: &Path) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf())
    }

    fn release(&self, path: &Path) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    /// Process one dropped file. Returns the renamed path, or `None` if the
    /// file was skipped (already in flight, gone, or unparseable).
    ///
    /// Once renamed the file no longer matches, so later notifications for
    /// the old path find nothing to read.
    pub async fn process_file(&self, path: &Path) -> Option<PathBuf> {
        if !self.matches(path) || !self.claim(path) {
            return None;
        }
        let processed = self.process_claimed(path).await;
        self.release(path);
        processed
    }

    async fn process_claimed(&self, path: &Path) -> Option<PathBuf> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(path = %path.display(), "Dropped file not readable: {}", e);
                return None;
            }
        };

        let document = match parse_drop_document(&raw) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    "Dropped file left in place, parse failed: {}",
                    e
                );
                return None;
            }
        };

        let timeline_id = match &document {
            DropDocument::Timeline(timeline) => timeline.id,
            DropDocument::Handler(_) => Uuid::new_v4(),
        };

        let mut launched = 0;
        for handler in document.into_handlers() {
            let handler_type = handler.handler_type.clone();
            match self.orchestrator.run_command_for(timeline_id, handler).await {
                Ok(_) => launched += 1,
                Err(e) => {
                    tracing::warn!(handler = %handler_type, "Dropped handler not launched: {}", e)
                }
            }
        }

        let target = processed_name(path);
        if let Err(e) = tokio::fs::rename(path, &target).await {
            tracing::warn!(
                path = %path.display(),
                "Failed to mark dropped file processed: {}",
                e
            );
            return None;
        }

        tracing::info!(
            path = %path.display(),
            timeline_id = %timeline_id,
            launched,
            "Dropped file processed"
        );
        Some(target)
    }

    /// Create the directory if needed and start watching it. Each notified
    /// path is processed on its own task.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Result<WatcherHandle> {
        std::fs::create_dir_all(&self.directory)?;
        let (watcher, mut events) = watch_directory(&self.directory)?;
        tracing::info!(
            directory = %self.directory.display(),
            pattern = %self.pattern,
            "Directory listener started"
        );

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
                ) {
                    continue;
                }
                for path in event.paths {
                    let listener = self.clone();
                    tokio::spawn(async move {
                        listener.process_file(&path).await;
                    });
                }
            }
            tracing::debug!("Directory listener stopped");
        });

        Ok(WatcherHandle::new(watcher, task))
    }
}

/// `dir/cmd.json` becomes `dir/cmd-<uuid>.processed`.
pub fn processed_name(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}-{}.{}", stem, Uuid::new_v4(), PROCESSED_EXTENSION))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::comms::NullSink;
    use crate::handlers::{Handler, HandlerRegistry};
    use crate::scheduler::SchedulerSettings;
    use crate::scheduler::unit::tests::CountingHandler;
    use crate::timeline::HandlerType;

    fn listener(dir: &Path) -> DirectoryListener {
        let counting = Arc::new(CountingHandler::new());
        let mut registry = HandlerRegistry::new();
        registry.register(HandlerType::Command, move |_| {
            Ok(counting.clone() as Arc<dyn Handler>)
        });
        let orchestrator = Arc::new(Orchestrator::new(
            SchedulerSettings {
                timeline_path: dir.join("timeline.json"),
                stop_grace: Duration::from_secs(1),
                reload_settle: Duration::from_millis(1),
            },
            Arc::new(registry),
            Arc::new(NullSink),
        ));
        DirectoryListener::new(orchestrator, dir.to_path_buf(), "*.json").unwrap()
    }

    #[test]
    fn processed_name_keeps_stem() {
        let renamed = processed_name(Path::new("/drop/cmd.json"));
        let name = renamed.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("cmd-"));
        assert!(name.ends_with(".processed"));
        assert_eq!(renamed.parent(), Some(Path::new("/drop")));
    }

    #[tokio::test]
    async fn timeline_file_is_launched_and_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let listener = listener(dir.path());
        let path = dir.path().join("cmd.json");
        std::fs::write(
            &path,
            r#"{"Status":"Run","TimeLineHandlers":[
                {"HandlerType":"Command","TimeLineEvents":[{"Command":"a"}]},
                {"HandlerType":"Command","TimeLineEvents":[{"Command":"b"}]}
            ]}"#,
        )
        .unwrap();

        let renamed = listener.process_file(&path).await.unwrap();
        assert!(!path.exists());
        assert!(renamed.exists());
        assert!(!listener.matches(&renamed));
        assert!(listener.process_file(&renamed).await.is_none());
    }

    #[tokio::test]
    async fn duplicate_notification_is_processed_once() {
        let dir = tempfile::tempdir().unwrap();
        let listener = listener(dir.path());
        let path = dir.path().join("cmd.json");
        std::fs::write(
            &path,
            r#"{"HandlerType":"Command","TimeLineEvents":[{"Command":"a"}]}"#,
        )
        .unwrap();

        let (first, second) = tokio::join!(
            listener.process_file(&path),
            listener.process_file(&path)
        );
        assert!(first.is_some() != second.is_some());
        assert!(!path.exists());
        let processed = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(processed, 1);
        assert!(listener.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_file_is_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let listener = listener(dir.path());
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(listener.process_file(&path).await.is_none());
        assert!(path.exists());
        assert!(listener.orchestrator.jobs().is_empty().await);
    }

    #[tokio::test]
    async fn non_matching_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let listener = listener(dir.path());
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "{}").unwrap();
        assert!(listener.process_file(&path).await.is_none());
        assert!(path.exists());
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = listener(dir.path()).orchestrator;
        assert!(DirectoryListener::new(orchestrator, dir.path().to_path_buf(), "[").is_err());
    }
}
