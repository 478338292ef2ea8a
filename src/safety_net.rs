//! Safety net: keeps OS processes spawned by activity generators from piling up.
//!
//! Every interval the net compares, for each process-backed handler type in the
//! active timeline, the number of handlers against the number of running OS
//! processes. More than one spare instance means the oldest extras are killed.
//! The same module provides the hard-kill cleanup the orchestrator runs on stop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessError;
use crate::scheduler::Orchestrator;
use crate::timeline::HandlerType;

/// One running OS process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Time since the process started. Zero when the platform does not say.
    pub elapsed: Duration,
}

/// Enumerates and terminates OS processes by name.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    async fn list(&self, name: &str) -> Result<Vec<ProcessInfo>, ProcessError>;
    async fn kill(&self, pid: u32) -> Result<(), ProcessError>;
}

/// OS process names an activity type runs under.
pub fn process_names(handler_type: &HandlerType) -> &'static [&'static str] {
    match handler_type {
        HandlerType::BrowserChrome => &["chrome", "chromedriver"],
        HandlerType::BrowserFirefox => &["firefox", "geckodriver"],
        HandlerType::Word => &["WINWORD"],
        HandlerType::Excel => &["EXCEL"],
        HandlerType::PowerPoint => &["POWERPNT"],
        HandlerType::Outlook => &["OUTLOOK"],
        HandlerType::Notepad => &["notepad"],
        HandlerType::Pidgin => &["pidgin"],
        _ => &[],
    }
}

/// Handler types that are backed by OS processes.
pub const PROCESS_BACKED: &[HandlerType] = &[
    HandlerType::BrowserChrome,
    HandlerType::BrowserFirefox,
    HandlerType::Word,
    HandlerType::Excel,
    HandlerType::PowerPoint,
    HandlerType::Outlook,
    HandlerType::Notepad,
    HandlerType::Pidgin,
];

/// Process inspection through the platform's process tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

#[cfg(not(windows))]
#[async_trait]
impl ProcessInspector for SystemProcesses {
    async fn list(&self, name: &str) -> Result<Vec<ProcessInfo>, ProcessError> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,etimes=,comm="])
            .output()
            .await
            .map_err(|e| ProcessError::Enumerate(e.to_string()))?;
        if !output.status.success() {
            return Err(ProcessError::Enumerate(format!("ps exited with {}", output.status)));
        }
        Ok(parse_ps(&String::from_utf8_lossy(&output.stdout), name))
    }

    async fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        let output = Command::new("kill")
            .args(["-9", &pid.to_string()])
            .output()
            .await
            .map_err(|e| ProcessError::Kill {
                pid,
                reason: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProcessError::Kill {
                pid,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(windows)]
#[async_trait]
impl ProcessInspector for SystemProcesses {
    async fn list(&self, name: &str) -> Result<Vec<ProcessInfo>, ProcessError> {
        let image = format!("IMAGENAME eq {}.exe", name);
        let output = Command::new("tasklist")
            .args(["/FO", "CSV", "/NH", "/FI", &image])
            .output()
            .await
            .map_err(|e| ProcessError::Enumerate(e.to_string()))?;
        Ok(parse_tasklist(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        let output = Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
            .await
            .map_err(|e| ProcessError::Kill {
                pid,
                reason: e.to_string(),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProcessError::Kill {
                pid,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Parse `ps -eo pid=,etimes=,comm=` output, keeping processes called `name`.
#[cfg_attr(windows, allow(dead_code))]
fn parse_ps(stdout: &str, name: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let elapsed = fields.next()?.parse().ok()?;
            let comm = fields.collect::<Vec<_>>().join(" ");
            let base = comm.rsplit('/').next().unwrap_or(&comm);
            base.eq_ignore_ascii_case(name).then_some(ProcessInfo {
                pid,
                elapsed: Duration::from_secs(elapsed),
            })
        })
        .collect()
}

/// Parse `tasklist /FO CSV /NH` output.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_tasklist(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let pid = line.split("\",\"").nth(1)?.trim_matches('"').parse().ok()?;
            Some(ProcessInfo {
                pid,
                elapsed: Duration::ZERO,
            })
        })
        .collect()
}

/// Kills processes by name, never touching the agent's own process.
#[derive(Clone)]
pub struct Reaper {
    inspector: Arc<dyn ProcessInspector>,
    own_pid: u32,
}

impl Reaper {
    pub fn new(inspector: Arc<dyn ProcessInspector>) -> Self {
        Self {
            inspector,
            own_pid: std::process::id(),
        }
    }

    /// Reaper backed by the platform process tools.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemProcesses))
    }

    async fn kill_one(&self, name: &str, pid: u32) -> bool {
        if pid == self.own_pid {
            tracing::warn!("{}", ProcessError::OwnProcess { pid });
            return false;
        }
        match self.inspector.kill(pid).await {
            Ok(()) => {
                tracing::info!(process = %name, pid, "Killed process");
                true
            }
            Err(e) => {
                tracing::warn!(process = %name, "{}", e);
                false
            }
        }
    }

    /// Kill the oldest instances of `name` beyond `expected`, but only when more
    /// than `expected + 1` are running. Returns how many were killed.
    pub async fn kill_excess(&self, name: &str, expected: usize) -> usize {
        let mut running = match self.inspector.list(name).await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(process = %name, "{}", e);
                return 0;
            }
        };
        running.retain(|p| p.pid != self.own_pid);

        let actual = running.len();
        if actual <= expected + 1 {
            return 0;
        }

        tracing::info!(
            process = %name,
            expected,
            actual,
            "Too many instances running, killing oldest"
        );
        running.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));

        let mut killed = 0;
        for process in running.iter().take(actual - expected) {
            if self.kill_one(name, process.pid).await {
                killed += 1;
            }
        }
        killed
    }

    /// Kill every instance of every process-backed activity. Returns how many were killed.
    pub async fn cleanup_processes(&self) -> usize {
        let mut killed = 0;
        let names: HashSet<&str> = PROCESS_BACKED
            .iter()
            .flat_map(|t| process_names(t).iter().copied())
            .collect();

        for name in names {
            let running = match self.inspector.list(name).await {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(process = %name, "{}", e);
                    continue;
                }
            };
            for process in running {
                if process.pid != self.own_pid && self.kill_one(name, process.pid).await {
                    killed += 1;
                }
            }
        }

        if killed > 0 {
            tracing::info!(killed, "Process cleanup finished");
        }
        killed
    }
}

/// Periodic governance loop over the orchestrator's active timeline.
pub struct SafetyNet {
    orchestrator: Arc<Orchestrator>,
    reaper: Reaper,
    interval: Duration,
}

impl SafetyNet {
    pub fn new(orchestrator: Arc<Orchestrator>, reaper: Reaper, interval: Duration) -> Self {
        Self {
            orchestrator,
            reaper,
            interval,
        }
    }

    /// One governance pass. Returns the number of processes killed.
    pub async fn run_pass(&self) -> usize {
        let mut killed = 0;
        if let Some(timeline) = self.orchestrator.current_timeline().await {
            let types: HashSet<&HandlerType> = timeline
                .handlers
                .iter()
                .map(|h| &h.handler_type)
                .filter(|t| !process_names(t).is_empty())
                .collect();

            for handler_type in types {
                let expected = timeline.count_of(handler_type);
                for name in process_names(handler_type) {
                    killed += self.reaper.kill_excess(name, expected).await;
                }
            }
        }

        self.reclaim_memory().await;
        killed
    }

    async fn reclaim_memory(&self) {
        self.orchestrator.jobs().shrink().await;
        if let Some(kb) = resident_memory_kb() {
            tracing::debug!(rss_kb = kb, "Safety net pass complete");
        }
    }

    /// Spawn the loop. The first pass runs one interval after start.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let killed = self.run_pass().await;
                        if killed > 0 {
                            tracing::info!(killed, "Safety net killed excess processes");
                        }
                    }
                }
            }
            tracing::debug!("Safety net stopped");
        })
    }
}

/// Resident set size of this process in kB (Linux only).
fn resident_memory_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory process table.
    #[derive(Default)]
    pub(crate) struct FakeProcesses {
        pub table: Mutex<HashMap<String, Vec<ProcessInfo>>>,
        pub killed: Mutex<Vec<u32>>,
    }

    impl FakeProcesses {
        pub(crate) fn with(name: &str, ages: &[(u32, u64)]) -> Self {
            let fake = Self::default();
            fake.table.lock().unwrap().insert(
                name.to_string(),
                ages.iter()
                    .map(|&(pid, secs)| ProcessInfo {
                        pid,
                        elapsed: Duration::from_secs(secs),
                    })
                    .collect(),
            );
            fake
        }
    }

    #[async_trait]
    impl ProcessInspector for FakeProcesses {
        async fn list(&self, name: &str) -> Result<Vec<ProcessInfo>, ProcessError> {
            Ok(self.table.lock().unwrap().get(name).cloned().unwrap_or_default())
        }

        async fn kill(&self, pid: u32) -> Result<(), ProcessError> {
            for list in self.table.lock().unwrap().values_mut() {
                list.retain(|p| p.pid != pid);
            }
            self.killed.lock().unwrap().push(pid);
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_spare_instance_is_tolerated() {
        let fake = Arc::new(FakeProcesses::with("chrome", &[(10, 50), (11, 40), (12, 30)]));
        let reaper = Reaper::new(fake.clone());
        assert_eq!(reaper.kill_excess("chrome", 2).await, 0);
        assert!(fake.killed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn excess_is_killed_oldest_first() {
        let fake = Arc::new(FakeProcesses::with(
            "chrome",
            &[(10, 5), (11, 500), (12, 50), (13, 5000)],
        ));
        let reaper = Reaper::new(fake.clone());
        assert_eq!(reaper.kill_excess("chrome", 1).await, 3);
        assert_eq!(*fake.killed.lock().unwrap(), vec![13, 11, 12]);
        assert_eq!(fake.list("chrome").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn own_process_is_never_killed() {
        let own = std::process::id();
        let fake = Arc::new(FakeProcesses::with("notepad", &[(own, 9999), (20, 1)]));
        let reaper = Reaper::new(fake.clone());

        assert_eq!(reaper.kill_excess("notepad", 0).await, 0);
        assert_eq!(reaper.cleanup_processes().await, 1);
        assert_eq!(*fake.killed.lock().unwrap(), vec![20]);
    }

    #[test]
    fn process_map() {
        assert_eq!(process_names(&HandlerType::BrowserFirefox), &["firefox", "geckodriver"]);
        assert!(process_names(&HandlerType::Command).is_empty());
    }

    #[test]
    fn parse_ps_output() {
        let out = "    1  9000 systemd\n  420   120 /usr/lib/chrome\n  421 30 chrome\n garbage\n";
        let found = parse_ps(out, "chrome");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].pid, 420);
        assert_eq!(found[1].elapsed, Duration::from_secs(30));
    }

    #[test]
    fn parse_tasklist_output() {
        let out = "\"WINWORD.EXE\",\"4242\",\"Console\",\"1\",\"85,000 K\"\r\n";
        let found = parse_tasklist(out);
        assert_eq!(found, vec![ProcessInfo { pid: 4242, elapsed: Duration::ZERO }]);
    }
}
