//! Per-session subprocess tracking and termination.
//!
//! The registry maps a session identifier to the set of OS process ids it
//! owns, so that stopping one user's in-flight work never touches another
//! session's processes. Termination is two-phase: SIGTERM first, then SIGKILL
//! for anything still alive after the timeout. The registry holds no durable
//! state; its lifetime is the lifetime of the hosting process.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{info, warn};

const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Result of a stop request for one session.
#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub status: String,
    pub action_taken: bool,
    pub session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<StopDetails>,
}

/// Per-pid breakdown of a stop request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopDetails {
    /// Exited after SIGTERM within the timeout.
    pub terminated: Vec<u32>,
    /// Survived SIGTERM and received SIGKILL.
    pub killed: Vec<u32>,
    /// Already gone before any signal was sent.
    pub already_dead: Vec<u32>,
    /// Signal delivery failed; left registered.
    pub failed: Vec<u32>,
    pub total_stopped: usize,
}

/// In-process registry of tracked subprocess pids, keyed by session.
#[derive(Default)]
pub struct ProcessRegistry {
    processes: DashMap<String, HashSet<u32>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pid for a session. No-op if already present.
    pub fn register(&self, session_id: &str, pid: u32) {
        self.processes
            .entry(session_id.to_string())
            .or_default()
            .insert(pid);
        info!(session = %session_id, pid, "Registered pid for session");
    }

    /// Remove a pid from a session; drops the session entry once empty.
    pub fn unregister(&self, session_id: &str, pid: u32) {
        let mut remove_session = false;
        if let Some(mut pids) = self.processes.get_mut(session_id) {
            pids.remove(&pid);
            remove_session = pids.is_empty();
        }
        if remove_session {
            self.processes.remove(session_id);
        }
        info!(session = %session_id, pid, "Unregistered pid from session");
    }

    /// Snapshot of the pids currently registered for a session.
    pub fn get_pids(&self, session_id: &str) -> Vec<u32> {
        self.processes
            .get(session_id)
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn is_process_alive(pid: u32) -> bool {
        // Signal 0 probes existence without delivering anything.
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Stop every process registered for a session.
    ///
    /// Sends SIGTERM to all live pids, polls liveness until `timeout`
    /// elapses, then SIGKILLs the survivors. An idle session is not an error:
    /// the summary comes back with `action_taken: false`.
    pub async fn stop_session(&self, session_id: &str, timeout: Duration) -> StopSummary {
        let pids = self.get_pids(session_id);

        if pids.is_empty() {
            info!(session = %session_id, "No processes found for session");
            return StopSummary {
                status: "No running processes found".to_string(),
                action_taken: false,
                session: session_id.to_string(),
                details: None,
            };
        }

        info!(session = %session_id, count = pids.len(), ?pids, "Stopping session processes");

        let mut details = StopDetails::default();

        // Phase 1: SIGTERM for a clean shutdown.
        let mut remaining: Vec<u32> = Vec::new();
        for pid in pids {
            if !Self::is_process_alive(pid) {
                details.already_dead.push(pid);
                self.unregister(session_id, pid);
                continue;
            }
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    info!(pid, "Sent SIGTERM");
                    remaining.push(pid);
                }
                Err(e) => {
                    warn!(pid, error = %e, "Failed to send SIGTERM");
                    details.failed.push(pid);
                }
            }
        }

        // Wait for clean exits until the deadline.
        let deadline = tokio::time::Instant::now() + timeout;
        while !remaining.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(LIVENESS_POLL_INTERVAL).await;
            let mut still_alive = Vec::new();
            for pid in remaining {
                if Self::is_process_alive(pid) {
                    still_alive.push(pid);
                } else {
                    details.terminated.push(pid);
                    self.unregister(session_id, pid);
                }
            }
            remaining = still_alive;
        }

        // Phase 2: SIGKILL for anything that ignored SIGTERM.
        for pid in remaining {
            if Self::is_process_alive(pid) {
                match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) => {
                        warn!(pid, "Sent SIGKILL (did not respond to SIGTERM)");
                        details.killed.push(pid);
                        self.unregister(session_id, pid);
                    }
                    Err(e) => {
                        warn!(pid, error = %e, "Failed to kill pid");
                        details.failed.push(pid);
                    }
                }
            } else {
                details.terminated.push(pid);
                self.unregister(session_id, pid);
            }
        }

        details.total_stopped =
            details.terminated.len() + details.killed.len() + details.already_dead.len();

        let summary = StopSummary {
            status: if details.total_stopped > 0 {
                "Stop signal sent to running processes".to_string()
            } else {
                "No processes stopped".to_string()
            },
            action_taken: details.total_stopped > 0,
            session: session_id.to_string(),
            details: Some(details),
        };

        info!(session = %session_id, ?summary, "Stop session result");
        summary
    }

    /// Remove entries whose pid is no longer alive, across all sessions.
    /// Registry hygiene only; never signals anything.
    pub fn cleanup_dead_processes(&self) -> usize {
        let mut cleaned = 0;
        let mut empty_sessions = Vec::new();

        for mut entry in self.processes.iter_mut() {
            let dead: Vec<u32> = entry
                .value()
                .iter()
                .copied()
                .filter(|&pid| !Self::is_process_alive(pid))
                .collect();
            for pid in dead {
                entry.value_mut().remove(&pid);
                cleaned += 1;
            }
            if entry.value().is_empty() {
                empty_sessions.push(entry.key().clone());
            }
        }
        for session in empty_sessions {
            self.processes.remove(&session);
        }

        if cleaned > 0 {
            info!(cleaned, "Cleaned up dead process entries");
        }
        cleaned
    }

    /// All sessions with their pids, for monitoring.
    pub fn all_sessions(&self) -> Vec<(String, Vec<u32>)> {
        self.processes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().copied().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[tokio::test]
    async fn stop_idle_session_is_not_an_error() {
        let registry = ProcessRegistry::new();
        let summary = registry
            .stop_session("nobody-home", Duration::from_secs(1))
            .await;
        assert!(!summary.action_taken);
        assert!(summary.details.is_none());
    }

    #[test]
    fn register_unregister_roundtrip() {
        let registry = ProcessRegistry::new();
        registry.register("s1", 1111);
        registry.register("s1", 1111);
        registry.register("s1", 2222);
        registry.register("s2", 3333);

        let mut pids = registry.get_pids("s1");
        pids.sort_unstable();
        assert_eq!(pids, vec![1111, 2222]);

        registry.unregister("s1", 1111);
        registry.unregister("s1", 2222);
        assert!(registry.get_pids("s1").is_empty());
        assert_eq!(registry.get_pids("s2"), vec![3333]);
    }

    #[tokio::test]
    async fn graceful_termination_of_cooperative_process() {
        let registry = ProcessRegistry::new();
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();
        // Reap promptly so the liveness probe does not see a zombie.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        registry.register("coop", pid);

        let summary = registry.stop_session("coop", Duration::from_secs(5)).await;
        assert!(summary.action_taken);
        let details = summary.details.unwrap();
        assert_eq!(details.terminated, vec![pid]);
        assert!(details.killed.is_empty());
        assert!(registry.get_pids("coop").is_empty());
    }

    #[tokio::test]
    async fn stubborn_process_is_force_killed_after_timeout() {
        let registry = ProcessRegistry::new();
        // Shell that ignores SIGTERM; only SIGKILL gets rid of it. It
        // announces readiness on stdout so no signal can arrive before the
        // trap is installed.
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; echo ready; sleep 30"])
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn stubborn shell");
        let pid = child.id();
        let stdout = child.stdout.take().expect("piped stdout");
        let mut line = String::new();
        std::io::BufRead::read_line(&mut std::io::BufReader::new(stdout), &mut line)
            .expect("read ready line");
        assert_eq!(line.trim(), "ready");
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        registry.register("stubborn", pid);

        let summary = registry
            .stop_session("stubborn", Duration::from_millis(600))
            .await;
        assert!(summary.action_taken);
        let details = summary.details.unwrap();
        assert_eq!(details.killed, vec![pid]);
        assert!(!details.terminated.contains(&pid));
        assert!(registry.get_pids("stubborn").is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_dead_pids() {
        let registry = ProcessRegistry::new();
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait");

        registry.register("gone", pid);
        let cleaned = registry.cleanup_dead_processes();
        assert_eq!(cleaned, 1);
        assert!(registry.get_pids("gone").is_empty());
    }
}
