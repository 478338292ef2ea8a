//! Shell command handler (`Command` and `Bash` handler types).
//!
//! Each event runs its `command`, then every non-empty argument, through the
//! shell. A command of `random` runs one randomly chosen argument instead.
//! Handler args:
//! - `execution-probability`: 0 to 100, chance that an event runs at all.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::handlers::{EventContext, Handler, HandlerOutcome};

/// Maximum output kept per command (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Which shell runs the commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    /// `cmd /C` on Windows, `sh -c` elsewhere.
    Platform,
    /// `bash -c`.
    Bash,
}

/// Shell command handler.
#[derive(Debug)]
pub struct CommandHandler {
    shell: ShellKind,
    timeout: Duration,
}

impl CommandHandler {
    pub fn new(shell: ShellKind) -> Self {
        Self {
            shell,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build(&self, cmd: &str) -> Command {
        let mut command = match self.shell {
            ShellKind::Bash => {
                let mut c = Command::new("bash");
                c.args(["-c", cmd]);
                c
            }
            ShellKind::Platform if cfg!(target_os = "windows") => {
                let mut c = Command::new("cmd");
                c.args(["/C", cmd]);
                c
            }
            ShellKind::Platform => {
                let mut c = Command::new("sh");
                c.args(["-c", cmd]);
                c
            }
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Run one command line, returning its combined output.
    async fn run(&self, cmd: &str, cancel: &CancellationToken) -> Result<String, HandlerError> {
        let child = self.build(cmd).spawn().map_err(|e| HandlerError::Spawn {
            command: cmd.to_string(),
            reason: e.to_string(),
        })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(HandlerError::ExecutionFailed(format!(
                        "Command execution failed: {}",
                        e
                    )));
                }
                Err(_) => {
                    return Err(HandlerError::ExecutionFailed(format!(
                        "Command timed out after {:?}",
                        self.timeout
                    )));
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.trim().is_empty() {
            stdout.trim_end().to_string()
        } else if stdout.trim().is_empty() {
            stderr.trim_end().to_string()
        } else {
            format!("{}\n\n--- stderr ---\n{}", stdout.trim_end(), stderr.trim_end())
        };

        if !output.status.success() {
            tracing::debug!(
                command = %cmd,
                code = output.status.code().unwrap_or(-1),
                "Command exited with non-zero status"
            );
        }

        Ok(truncate_output(&combined))
    }
}

#[async_trait]
impl Handler for CommandHandler {
    fn name(&self) -> &str {
        match self.shell {
            ShellKind::Platform => "command",
            ShellKind::Bash => "bash",
        }
    }

    async fn execute(&self, ctx: EventContext<'_>) -> Result<HandlerOutcome, HandlerError> {
        if !roll_probability(ctx.handler.arg_i64("execution-probability")) {
            tracing::debug!(
                trackable_id = %ctx.event.trackable_id,
                "Skipping event, execution probability not met"
            );
            return Ok(HandlerOutcome::skipped());
        }

        let mut outcome = HandlerOutcome::default();
        for (command_arg, line) in command_lines(ctx)? {
            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            tracing::info!(handler = self.name(), command = %line, "Executing command");
            let result = self.run(&line, ctx.cancel).await?;
            outcome.records.push(ctx.record(&command_arg, result));
        }
        Ok(outcome)
    }
}

/// Pairs of (reported command arg, shell line) for one event.
fn command_lines(ctx: EventContext<'_>) -> Result<Vec<(String, String)>, HandlerError> {
    let event = ctx.event;
    let args: Vec<&String> = event
        .command_args
        .iter()
        .filter(|a| !a.trim().is_empty())
        .collect();

    if event.command.trim().eq_ignore_ascii_case("random") {
        let pick = args
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| HandlerError::InvalidEvent {
                handler_type: ctx.handler.handler_type.to_string(),
                reason: "random command without arguments".to_string(),
            })?;
        return Ok(vec![((*pick).clone(), (*pick).clone())]);
    }

    let mut lines = Vec::with_capacity(args.len() + 1);
    if !event.command.trim().is_empty() {
        lines.push((String::new(), event.command.clone()));
    }
    lines.extend(args.into_iter().map(|a| (a.clone(), a.clone())));

    if lines.is_empty() {
        return Err(HandlerError::InvalidEvent {
            handler_type: ctx.handler.handler_type.to_string(),
            reason: "event has no command".to_string(),
        });
    }
    Ok(lines)
}

/// `true` when the event should run. Missing or out-of-range values always run.
fn roll_probability(probability: Option<i64>) -> bool {
    match probability {
        Some(p) if (0..100).contains(&p) => rand::thread_rng().gen_range(0..100) < p,
        _ => true,
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = floor_char_boundary(s, s.len() - half);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head_end],
        s.len() - MAX_OUTPUT_SIZE,
        &s[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{HandlerType, TimelineEvent, TimelineHandler};

    fn handler() -> TimelineHandler {
        TimelineHandler::new(HandlerType::Command)
    }

    #[test]
    fn lines_include_command_then_args() {
        let h = handler();
        let event = TimelineEvent::new("whoami").with_args(["hostname", "", "uptime"]);
        let cancel = CancellationToken::new();
        let lines = command_lines(EventContext::new(&h, &event, &cancel)).unwrap();
        let shell: Vec<&str> = lines.iter().map(|(_, l)| l.as_str()).collect();
        assert_eq!(shell, vec!["whoami", "hostname", "uptime"]);
        assert_eq!(lines[0].0, "");
    }

    #[test]
    fn random_picks_one_argument() {
        let h = handler();
        let event = TimelineEvent::new("random").with_args(["a", "b", "c"]);
        let cancel = CancellationToken::new();
        let lines = command_lines(EventContext::new(&h, &event, &cancel)).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(["a", "b", "c"].contains(&lines[0].1.as_str()));

        let empty = TimelineEvent::new("random");
        assert!(command_lines(EventContext::new(&h, &empty, &cancel)).is_err());
    }

    #[test]
    fn probability_bounds() {
        assert!(roll_probability(None));
        assert!(roll_probability(Some(100)));
        assert!(!roll_probability(Some(0)));
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let long = "x".repeat(MAX_OUTPUT_SIZE + 100);
        let out = truncate_output(&long);
        assert!(out.contains("[truncated 100 bytes]"));
        assert_eq!(truncate_output("short"), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_produces_record() {
        let h = handler();
        let mut event = TimelineEvent::new("echo hi");
        event.trackable_id = "t-1".into();
        let cancel = CancellationToken::new();

        let outcome = CommandHandler::new(ShellKind::Platform)
            .execute(EventContext::new(&h, &event, &cancel))
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        assert_eq!(record.result, "hi");
        assert_eq!(record.trackable_id, "t-1");
        assert_eq!(record.handler, "Command");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_interrupts_long_command() {
        let h = handler();
        let event = TimelineEvent::new("sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            CommandHandler::new(ShellKind::Platform)
                .execute(EventContext::new(&h, &event, &cancel)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(HandlerError::Cancelled)));
    }
}
