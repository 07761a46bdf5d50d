//! SQLite-backed task queue: broker and result backend in one table.
//!
//! Delivery is at-least-once. A claimed task keeps its row in
//! STARTED/PROGRESS until the worker reports completion; if the worker dies,
//! the stale-claim sweep returns the row to PENDING once the visibility
//! timeout passes. Failed tasks are retried with exponential backoff and
//! jitter up to a cap, then parked in FAILURE.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{DatabaseError, ServiceError, ServiceResult};

use super::StageKind;

/// Client-visible task state, matching the wire shape progress consumers
/// poll for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "PROGRESS")]
    Progress {
        #[serde(flatten)]
        meta: ProgressMeta,
    },
    #[serde(rename = "SUCCESS")]
    Success { result: Value },
    #[serde(rename = "FAILURE")]
    Failure { error: String },
    #[serde(rename = "REVOKED")]
    Revoked,
}

/// Progress metadata stored alongside a PROGRESS row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressMeta {
    pub current: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    pub status: String,
}

/// A task handed to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: String,
    pub session_id: String,
    pub stage: StageKind,
    pub attempts: u32,
}

/// Outcome of reporting a failure.
#[derive(Debug, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued; will become claimable after this many seconds.
    Retrying { delay_secs: u64 },
    /// Retries exhausted (or the error was terminal); parked in FAILURE.
    Failed,
    /// The task was revoked or already terminal; nothing was recorded.
    Ignored,
}

pub struct TaskQueue {
    conn: Mutex<Connection>,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn open(path: &Path, config: QueueConfig) -> ServiceResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Database(DatabaseError::Connection(
                    rusqlite::Error::ToSqlConversionFailure(Box::new(e)),
                ))
            })?;
        }
        let conn = Connection::open(path).map_err(DatabaseError::Connection)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(DatabaseError::Query)?;
        Self::with_connection(conn, config)
    }

    pub fn open_in_memory(config: QueueConfig) -> ServiceResult<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Connection)?;
        Self::with_connection(conn, config)
    }

    fn with_connection(conn: Connection, config: QueueConfig) -> ServiceResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'PENDING',
                attempts INTEGER NOT NULL DEFAULT 0,
                not_before INTEGER NOT NULL DEFAULT 0,
                claimed_at INTEGER,
                meta TEXT,
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_claimable
                ON tasks(state, not_before, created_at);
            "#,
        )
        .map_err(DatabaseError::Query)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    fn now_epoch() -> i64 {
        Utc::now().timestamp()
    }

    /// Enqueue a stage run for a session; returns the task id.
    pub fn enqueue(&self, session_id: &str, stage: StageKind) -> ServiceResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO tasks (id, session_id, stage, state, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'PENDING', ?4, ?4)
            "#,
            params![id, session_id, stage.as_str(), now],
        )
        .map_err(DatabaseError::Query)?;
        info!(task = %id, session = %session_id, stage = stage.as_str(), "Task enqueued");
        Ok(id)
    }

    /// Claim the oldest claimable task, moving it to STARTED. The row keeps
    /// its claim until the worker completes, fails, or the stale sweep
    /// reclaims it.
    pub fn claim(&self) -> ServiceResult<Option<ClaimedTask>> {
        let now = Self::now_epoch();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        let candidate = tx
            .query_row(
                r#"
                SELECT id, session_id, stage, attempts FROM tasks
                WHERE state = 'PENDING' AND not_before <= ?1
                ORDER BY created_at
                LIMIT 1
                "#,
                params![now],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some((id, session_id, stage_str, attempts)) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE tasks SET state = 'STARTED', claimed_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, now, Utc::now().to_rfc3339()],
        )
        .map_err(DatabaseError::Query)?;
        tx.commit().map_err(DatabaseError::Query)?;

        let stage = StageKind::from_str(&stage_str).map_err(|_| ServiceError::Internal {
            message: format!("Unknown stage in queue: {stage_str}"),
        })?;
        Ok(Some(ClaimedTask {
            id,
            session_id,
            stage,
            attempts,
        }))
    }

    /// Record live progress for a claimed task.
    pub fn report_progress(&self, task_id: &str, meta: &ProgressMeta) -> ServiceResult<()> {
        let meta_json = serde_json::to_string(meta).map_err(DatabaseError::Serialization)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE tasks SET state = 'PROGRESS', meta = ?2, updated_at = ?3
            WHERE id = ?1 AND state IN ('STARTED', 'PROGRESS')
            "#,
            params![task_id, meta_json, Utc::now().to_rfc3339()],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// Acknowledge successful completion. A revoked or already-terminal row
    /// is left untouched.
    pub fn complete(&self, task_id: &str, result: &Value) -> ServiceResult<()> {
        let result_json = serde_json::to_string(result).map_err(DatabaseError::Serialization)?;
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                r#"
                UPDATE tasks SET state = 'SUCCESS', result = ?2, claimed_at = NULL, updated_at = ?3
                WHERE id = ?1 AND state IN ('STARTED', 'PROGRESS')
                "#,
                params![task_id, result_json, Utc::now().to_rfc3339()],
            )
            .map_err(DatabaseError::Query)?;
        if changed == 0 {
            info!(task = %task_id, "Completion ignored; task is no longer running");
        }
        Ok(())
    }

    /// Record a failure. Retryable failures within the attempt budget are
    /// requeued after `countdown * 2^attempts` seconds with jitter, capped at
    /// the configured maximum; everything else parks in FAILURE. A row that is
    /// no longer running (revoked, or reclaimed and finished elsewhere) is
    /// left untouched.
    pub fn fail(&self, task_id: &str, error: &str, retryable: bool) -> ServiceResult<FailOutcome> {
        let conn = self.conn.lock().unwrap();
        let (state, attempts): (String, u32) = conn
            .query_row(
                "SELECT state, attempts FROM tasks WHERE id = ?1",
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(DatabaseError::Query)?;
        if state != "STARTED" && state != "PROGRESS" {
            info!(task = %task_id, state = %state, "Failure ignored; task is no longer running");
            return Ok(FailOutcome::Ignored);
        }
        let attempts = attempts + 1;

        if retryable && attempts <= self.config.max_retries {
            let delay_secs = self.retry_delay(attempts);
            let not_before = Self::now_epoch() + delay_secs as i64;
            conn.execute(
                r#"
                UPDATE tasks
                SET state = 'PENDING', attempts = ?2, not_before = ?3, claimed_at = NULL,
                    error = ?4, updated_at = ?5
                WHERE id = ?1 AND state IN ('STARTED', 'PROGRESS')
                "#,
                params![task_id, attempts, not_before, error, Utc::now().to_rfc3339()],
            )
            .map_err(DatabaseError::Query)?;
            warn!(task = %task_id, attempts, delay_secs, "Task failed; retrying");
            Ok(FailOutcome::Retrying { delay_secs })
        } else {
            conn.execute(
                r#"
                UPDATE tasks
                SET state = 'FAILURE', attempts = ?2, claimed_at = NULL, error = ?3,
                    updated_at = ?4
                WHERE id = ?1 AND state IN ('STARTED', 'PROGRESS')
                "#,
                params![task_id, attempts, error, Utc::now().to_rfc3339()],
            )
            .map_err(DatabaseError::Query)?;
            warn!(task = %task_id, attempts, "Task failed permanently");
            Ok(FailOutcome::Failed)
        }
    }

    fn retry_delay(&self, attempts: u32) -> u64 {
        let base = self
            .config
            .retry_countdown_secs
            .saturating_mul(1u64 << (attempts - 1).min(16))
            .min(self.config.retry_backoff_max_secs);
        // Jitter keeps a burst of failures from retrying in lockstep.
        let half = (base / 2).max(1);
        half + rand::thread_rng().gen_range(0..=base - half)
    }

    /// Revoke a task that has not finished. Returns false if the task was
    /// already terminal.
    pub fn revoke(&self, task_id: &str) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                r#"
                UPDATE tasks SET state = 'REVOKED', claimed_at = NULL, updated_at = ?2
                WHERE id = ?1 AND state IN ('PENDING', 'STARTED', 'PROGRESS')
                "#,
                params![task_id, Utc::now().to_rfc3339()],
            )
            .map_err(DatabaseError::Query)?;
        Ok(changed > 0)
    }

    /// Requeue tasks whose claim outlived the visibility timeout (worker
    /// crash). Returns the number of rows requeued.
    pub fn requeue_stale(&self) -> ServiceResult<usize> {
        let cutoff = Self::now_epoch() - self.config.visibility_timeout_secs as i64;
        let conn = self.conn.lock().unwrap();
        let requeued = conn
            .execute(
                r#"
                UPDATE tasks
                SET state = 'PENDING', claimed_at = NULL, updated_at = ?2
                WHERE state IN ('STARTED', 'PROGRESS') AND claimed_at <= ?1
                "#,
                params![cutoff, Utc::now().to_rfc3339()],
            )
            .map_err(DatabaseError::Query)?;
        if requeued > 0 {
            warn!(requeued, "Requeued stale task claims");
        }
        Ok(requeued)
    }

    /// Current status of a task, shaped for API consumers.
    pub fn status(&self, task_id: &str) -> ServiceResult<Option<TaskStatus>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT state, meta, result, error FROM tasks WHERE id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some((state, meta, result, error)) = row else {
            return Ok(None);
        };

        let status = match state.as_str() {
            "PENDING" => TaskStatus::Pending,
            "STARTED" => TaskStatus::Started,
            "PROGRESS" => {
                let meta = meta
                    .as_deref()
                    .and_then(|m| serde_json::from_str(m).ok())
                    .unwrap_or_default();
                TaskStatus::Progress { meta }
            }
            "SUCCESS" => {
                let result = result
                    .as_deref()
                    .and_then(|r| serde_json::from_str(r).ok())
                    .unwrap_or(Value::Null);
                TaskStatus::Success { result }
            }
            "FAILURE" => TaskStatus::Failure {
                error: error.unwrap_or_default(),
            },
            "REVOKED" => TaskStatus::Revoked,
            other => {
                return Err(ServiceError::Internal {
                    message: format!("Unknown task state: {other}"),
                });
            }
        };
        Ok(Some(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> TaskQueue {
        TaskQueue::open_in_memory(QueueConfig::default()).unwrap()
    }

    #[test]
    fn enqueue_claim_progress_complete() {
        let queue = queue();
        let id = queue.enqueue("s1", StageKind::Extraction).unwrap();
        assert_eq!(queue.status(&id).unwrap(), Some(TaskStatus::Pending));

        let claimed = queue.claim().unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.stage, StageKind::Extraction);
        assert_eq!(queue.status(&id).unwrap(), Some(TaskStatus::Started));
        assert!(queue.claim().unwrap().is_none());

        queue
            .report_progress(
                &id,
                &ProgressMeta {
                    current: 5,
                    total: Some(20),
                    percent: Some(25),
                    item: None,
                    status: "doc.pdf".to_string(),
                },
            )
            .unwrap();
        match queue.status(&id).unwrap().unwrap() {
            TaskStatus::Progress { meta } => {
                assert_eq!(meta.current, 5);
                assert_eq!(meta.percent, Some(25));
            }
            other => panic!("unexpected status: {other:?}"),
        }

        queue
            .complete(&id, &serde_json::json!({"records_written": 12}))
            .unwrap();
        match queue.status(&id).unwrap().unwrap() {
            TaskStatus::Success { result } => {
                assert_eq!(result["records_written"], 12);
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let status = TaskStatus::Progress {
            meta: ProgressMeta {
                current: 150,
                total: Some(500),
                percent: Some(30),
                item: None,
                status: "Generating embedding".to_string(),
            },
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "PROGRESS");
        assert_eq!(json["current"], 150);
        assert_eq!(json["percent"], 30);
    }

    #[test]
    fn retryable_failure_backs_off_then_exhausts() {
        let queue = queue();
        let id = queue.enqueue("s1", StageKind::Chunking).unwrap();
        queue.claim().unwrap().unwrap();

        let outcome = queue.fail(&id, "endpoint unavailable", true).unwrap();
        match outcome {
            FailOutcome::Retrying { delay_secs } => {
                // First retry: countdown 30s base, with jitter, under the cap.
                assert!((15..=30).contains(&delay_secs), "delay {delay_secs}");
            }
            FailOutcome::Failed | FailOutcome::Ignored => panic!("first failure should retry"),
        }
        // Backed-off task is not claimable yet.
        assert!(queue.claim().unwrap().is_none());
        assert_eq!(queue.status(&id).unwrap(), Some(TaskStatus::Pending));

        queue.fail(&id, "again", true).unwrap();
        queue.fail(&id, "again", true).unwrap();
        let outcome = queue.fail(&id, "final straw", true).unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
        match queue.status(&id).unwrap().unwrap() {
            TaskStatus::Failure { error } => assert_eq!(error, "final straw"),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn terminal_failure_skips_retries() {
        let queue = queue();
        let id = queue.enqueue("s1", StageKind::VectorUpload).unwrap();
        queue.claim().unwrap().unwrap();
        let outcome = queue.fail(&id, "missing credential", false).unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
    }

    #[test]
    fn revoke_only_touches_unfinished_tasks() {
        let queue = queue();
        let id = queue.enqueue("s1", StageKind::Extraction).unwrap();
        assert!(queue.revoke(&id).unwrap());
        assert_eq!(queue.status(&id).unwrap(), Some(TaskStatus::Revoked));
        assert!(!queue.revoke(&id).unwrap());
        assert!(queue.claim().unwrap().is_none());
    }

    #[test]
    fn late_failure_does_not_resurrect_a_revoked_task() {
        let queue = queue();
        let id = queue.enqueue("s1", StageKind::Extraction).unwrap();
        queue.claim().unwrap().unwrap();
        assert!(queue.revoke(&id).unwrap());

        // The worker holding the claim reports its failure after the revoke.
        let outcome = queue.fail(&id, "connection reset by peer", true).unwrap();
        assert_eq!(outcome, FailOutcome::Ignored);
        assert_eq!(queue.status(&id).unwrap(), Some(TaskStatus::Revoked));
        assert!(queue.claim().unwrap().is_none());
    }

    #[test]
    fn late_completion_does_not_resurrect_a_revoked_task() {
        let queue = queue();
        let id = queue.enqueue("s1", StageKind::Chunking).unwrap();
        queue.claim().unwrap().unwrap();
        assert!(queue.revoke(&id).unwrap());

        queue.complete(&id, &serde_json::json!({"chunks": 4})).unwrap();
        assert_eq!(queue.status(&id).unwrap(), Some(TaskStatus::Revoked));
    }

    #[test]
    fn stale_claims_are_requeued() {
        let config = QueueConfig {
            visibility_timeout_secs: 0,
            ..QueueConfig::default()
        };
        let queue = TaskQueue::open_in_memory(config).unwrap();
        let id = queue.enqueue("s1", StageKind::Extraction).unwrap();
        queue.claim().unwrap().unwrap();

        // Zero visibility timeout: the claim is immediately stale.
        let requeued = queue.requeue_stale().unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(queue.status(&id).unwrap(), Some(TaskStatus::Pending));
        assert!(queue.claim().unwrap().is_some());
    }

    #[test]
    fn unknown_task_has_no_status() {
        let queue = queue();
        assert!(queue.status("no-such-task").unwrap().is_none());
    }
}
