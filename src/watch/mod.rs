//! Hot-reload watchers on the timeline file and the stop sentinel.

pub mod debounce;
pub mod stop_watcher;
pub mod timeline_watcher;

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

pub use debounce::LastWriteGate;
pub use stop_watcher::StopWatcher;
pub use timeline_watcher::TimelineWatcher;

/// Keeps a filesystem watcher and its event task alive.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn new(watcher: RecommendedWatcher, task: JoinHandle<()>) -> Self {
        Self {
            _watcher: watcher,
            task,
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Directory to watch for a file (its parent, or `.`).
pub fn watch_dir_for(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Watch `dir` (non-recursively) and forward its events into a tokio channel.
pub fn watch_directory(
    dir: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<Event>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.send(event);
        }
        Err(e) => tracing::warn!("File watcher error: {}", e),
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

/// Whether `event` is a create or modify touching a file named like `target`.
pub fn touches(event: &Event, target: &Path) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    ) {
        return false;
    }
    let Some(name) = target.file_name() else {
        return false;
    };
    event.paths.iter().any(|p| p.file_name() == Some(name))
}

#[cfg(test)]
mod tests {
    use notify::event::{CreateKind, RemoveKind};

    use super::*;

    #[test]
    fn parent_directory() {
        assert_eq!(
            watch_dir_for(Path::new("config/timeline.json")),
            PathBuf::from("config")
        );
        assert_eq!(watch_dir_for(Path::new("timeline.json")), PathBuf::from("."));
    }

    #[test]
    fn event_filtering() {
        let target = Path::new("/etc/agent/stop.txt");
        let event = |kind, path: &str| Event::new(kind).add_path(PathBuf::from(path));

        let create = event(EventKind::Create(CreateKind::File), "/etc/agent/stop.txt");
        assert!(touches(&create, target));

        let other = event(EventKind::Create(CreateKind::File), "/etc/agent/x.txt");
        assert!(!touches(&other, target));

        let remove = event(EventKind::Remove(RemoveKind::File), "/etc/agent/stop.txt");
        assert!(!touches(&remove, target));
    }
}
