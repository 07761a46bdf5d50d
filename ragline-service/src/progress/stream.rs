//! Tracked subprocess execution with a live progress event stream.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use crate::process_registry::ProcessRegistry;

use super::event::ProgressEvent;
use super::parsers::{LineParser, parse_line};

/// Substrings that mark an output line as an error report.
const ERROR_KEYWORDS: &[&str] = &["error", "failed", "exception", "traceback", "panicked"];

/// Exit code a stage child uses when it stopped because it was cancelled,
/// so a stop request is reported as a cancellation rather than a failure.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// What to run. The child inherits this process's environment and working
/// directory; everything it needs arrives through arguments.
#[derive(Debug, Clone)]
pub struct SubprocessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SubprocessCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Classify a raw output line: error lines become terminal-ish error events,
/// everything else goes through the parser chain. Lines that mention a
/// warning are never promoted to errors even when a keyword matches.
fn classify_line(parsers: &[LineParser], line: &str) -> Option<ProgressEvent> {
    let lower = line.to_lowercase();
    if ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw)) && !lower.contains("warning") {
        return Some(ProgressEvent::Error {
            message: line.trim().to_string(),
        });
    }
    parse_line(parsers, line)
}

/// Spawn `command` and stream its progress until it exits.
///
/// The child's pid is registered under `session_id` for the duration of the
/// run, so a stop request for the session reaches it. Both stdout and stderr
/// are read line-by-line and fed through `parsers`; lines no parser matches
/// are logged at debug and dropped. The stream always ends with exactly one
/// terminal event: `Complete` on exit status 0, `Error` otherwise (including
/// timeout, in which case the child is killed first).
pub fn run_with_progress(
    command: SubprocessCommand,
    parsers: Vec<LineParser>,
    session_id: Option<String>,
    registry: Arc<ProcessRegistry>,
    timeout: Duration,
) -> impl Stream<Item = ProgressEvent> {
    stream! {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %command.program, error = %e, "Failed to spawn stage process");
                yield ProgressEvent::Error {
                    message: format!("Failed to start process: {e}"),
                };
                return;
            }
        };

        let pid = child.id();
        if let (Some(session), Some(pid)) = (&session_id, pid) {
            registry.register(session, pid);
        }
        info!(program = %command.program, ?pid, "Stage process started");

        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);

        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(line_tx);

        let deadline = tokio::time::Instant::now() + timeout;
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, line_rx.recv()).await {
                Ok(Some(line)) => {
                    match classify_line(&parsers, &line) {
                        Some(event) => yield event,
                        None => debug!(line = %line, "Unparsed stage output"),
                    }
                }
                // Both writer handles dropped: the child closed its pipes.
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let status = if timed_out {
            warn!(program = %command.program, ?pid, "Stage process timed out; killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
            None
        } else {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to await stage process");
                    None
                }
                Err(_) => {
                    timed_out = true;
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    None
                }
            }
        };

        if let (Some(session), Some(pid)) = (&session_id, pid) {
            registry.unregister(session, pid);
        }

        match status {
            Some(status) if status.success() => {
                yield ProgressEvent::Complete {
                    message: "Process completed".to_string(),
                };
            }
            Some(status) if status.code() == Some(CANCELLED_EXIT_CODE) => {
                yield ProgressEvent::Error {
                    message: "Process cancelled".to_string(),
                };
            }
            Some(status) => {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                yield ProgressEvent::Error {
                    message: format!("Process failed with code {code}"),
                };
            }
            None if timed_out => {
                yield ProgressEvent::Error {
                    message: "Process timed out".to_string(),
                };
            }
            None => {
                yield ProgressEvent::Error {
                    message: "Process failed".to_string(),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::parsers::{parse_percent_bar, parse_progress_marker};
    use futures::StreamExt;
    use futures::pin_mut;

    fn default_parsers() -> Vec<LineParser> {
        vec![parse_progress_marker, parse_percent_bar]
    }

    async fn collect(
        command: SubprocessCommand,
        timeout: Duration,
        registry: Arc<ProcessRegistry>,
    ) -> Vec<ProgressEvent> {
        let stream = run_with_progress(
            command,
            default_parsers(),
            Some("test-session".to_string()),
            registry,
            timeout,
        );
        pin_mut!(stream);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn markers_become_events_and_exit_zero_completes() {
        let registry = Arc::new(ProcessRegistry::new());
        let script = "echo 'PROGRESS|init|3|Found 3 items'; \
                      echo 'PROGRESS|row|1/3|a.pdf'; \
                      echo 'not a marker'; \
                      echo 'PROGRESS|row|3/3|c.pdf'";
        let command = SubprocessCommand::new("sh", vec!["-c".into(), script.into()]);

        let events = collect(command, Duration::from_secs(10), registry.clone()).await;

        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ProgressEvent::Init { total: Some(3), .. }));
        assert!(matches!(
            events[1],
            ProgressEvent::Progress { current: 1, .. }
        ));
        assert!(matches!(
            events[2],
            ProgressEvent::Progress { current: 3, .. }
        ));
        assert!(matches!(events[3], ProgressEvent::Complete { .. }));
        assert!(registry.get_pids("test-session").is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_ends_with_error() {
        let registry = Arc::new(ProcessRegistry::new());
        let command = SubprocessCommand::new("sh", vec!["-c".into(), "exit 3".into()]);

        let events = collect(command, Duration::from_secs(10), registry).await;

        match events.last().unwrap() {
            ProgressEvent::Error { message } => {
                assert_eq!(message, "Process failed with code 3");
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_keyword_lines_are_promoted_unless_warnings() {
        let registry = Arc::new(ProcessRegistry::new());
        let script = "echo 'Warning: error rates nominal'; \
                      echo 'Error: could not open file' >&2";
        let command = SubprocessCommand::new("sh", vec!["-c".into(), script.into()]);

        let events = collect(command, Duration::from_secs(10), registry).await;

        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        match errors[0] {
            ProgressEvent::Error { message } => {
                assert_eq!(message, "Error: could not open file");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn cancelled_exit_code_is_reported_as_cancellation() {
        let registry = Arc::new(ProcessRegistry::new());
        let script = format!("exit {CANCELLED_EXIT_CODE}");
        let command = SubprocessCommand::new("sh", vec!["-c".into(), script]);

        let events = collect(command, Duration::from_secs(10), registry).await;

        match events.last().unwrap() {
            ProgressEvent::Error { message } => {
                assert_eq!(message, "Process cancelled");
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_child_and_reports() {
        let registry = Arc::new(ProcessRegistry::new());
        let command = SubprocessCommand::new("sleep", vec!["30".into()]);

        let events = collect(command, Duration::from_millis(300), registry.clone()).await;

        match events.last().unwrap() {
            ProgressEvent::Error { message } => {
                assert_eq!(message, "Process timed out");
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
        assert!(registry.get_pids("test-session").is_empty());
    }

    #[tokio::test]
    async fn unspawnable_program_yields_error() {
        let registry = Arc::new(ProcessRegistry::new());
        let command = SubprocessCommand::new("/definitely/not/a/real/binary", vec![]);

        let events = collect(command, Duration::from_secs(5), registry).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProgressEvent::Error { .. }));
    }
}
