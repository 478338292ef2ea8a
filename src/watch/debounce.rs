//! Collapse duplicate file-change notifications by comparing last-write times.

use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

/// Remembers the last-write time that was acted on.
#[derive(Debug, Default)]
pub struct LastWriteGate {
    last: Mutex<Option<SystemTime>>,
}

/// Last-write time of `path`, if it exists and the platform reports one.
pub fn last_write(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl LastWriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current last-write time without triggering.
    pub fn prime(&self, path: &Path) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = last_write(path);
    }

    /// `true` if the file's last-write time differs from the one last acted on,
    /// recording it. A missing file never passes.
    pub fn should_process(&self, path: &Path) -> bool {
        let Some(modified) = last_write(path) else {
            return false;
        };
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if *last == Some(modified) {
            return false;
        }
        *last = Some(modified);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn duplicate_notifications_pass_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.json");
        std::fs::write(&path, "{}").unwrap();

        let gate = LastWriteGate::new();
        assert!(gate.should_process(&path));
        assert!(!gate.should_process(&path));
        assert!(!gate.should_process(&path));
    }

    #[test]
    fn new_write_passes_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.json");
        std::fs::write(&path, "{}").unwrap();

        let gate = LastWriteGate::new();
        gate.prime(&path);
        assert!(!gate.should_process(&path));

        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
        assert!(gate.should_process(&path));
    }

    #[test]
    fn missing_file_never_passes() {
        let gate = LastWriteGate::new();
        assert!(!gate.should_process(Path::new("/no/such/stop.txt")));
    }
}
