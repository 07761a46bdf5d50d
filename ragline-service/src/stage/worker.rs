//! In-process queue workers.
//!
//! A worker claims one task at a time, runs its stage core through
//! [`execute_stage`](super::execute_stage), and reports progress back into
//! the task row. The soft time limit cancels the stage cooperatively; the
//! hard limit drops the stage future outright. Revocation cancels through a
//! shared token map the API side also holds.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::StaticConfig;
use crate::credentials::CredentialResolver;
use crate::error::{ExtractionError, StageError};
use crate::metrics;
use crate::progress::{ProgressEvent, ProgressFn};

use super::queue::{ClaimedTask, FailOutcome, ProgressMeta, TaskQueue, TaskStatus};
use super::session_store::SessionStore;
use super::{StageContext, execute_stage, truncate_error};

const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A task currently running in this process.
pub struct RunningTask {
    pub session_id: String,
    pub token: CancellationToken,
}

/// Tasks currently running in this process, keyed by task id. The API's
/// revoke endpoint and session stop requests cancel through this map.
pub type RevocationMap = Arc<DashMap<String, RunningTask>>;

pub struct QueueWorker {
    pub(crate) config: Arc<StaticConfig>,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) credentials: Arc<dyn CredentialResolver>,
    pub(crate) ocr_limiter: Arc<Semaphore>,
    pub(crate) revocations: RevocationMap,
}

impl QueueWorker {
    /// Claim-and-run loop; returns when `shutdown` fires.
    pub async fn run(&self, worker_id: usize, shutdown: CancellationToken) {
        info!(worker_id, "Queue worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.queue.claim() {
                Ok(Some(task)) => self.run_task(task).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to claim task");
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                }
            }
        }
        info!(worker_id, "Queue worker stopped");
    }

    pub(crate) async fn run_task(&self, task: ClaimedTask) {
        info!(
            task = %task.id,
            session = %task.session_id,
            stage = task.stage.as_str(),
            attempts = task.attempts,
            "Task picked up"
        );

        let token = CancellationToken::new();
        self.revocations.insert(
            task.id.clone(),
            RunningTask {
                session_id: task.session_id.clone(),
                token: token.clone(),
            },
        );

        let ctx = StageContext {
            config: self.config.clone(),
            session_id: task.session_id.clone(),
            session_dir: self.config.session_dir(&task.session_id),
            credentials: self.credentials.clone(),
            ocr_limiter: self.ocr_limiter.clone(),
        };
        let progress = self.progress_reporter(task.id.clone());

        // Soft limit: request cooperative cancellation. Hard limit: the
        // timeout below drops the stage future.
        let soft_cancel = token.clone();
        let soft_limit = self.config.queue.soft_time_limit();
        let soft_guard = tokio::spawn(async move {
            tokio::time::sleep(soft_limit).await;
            warn!("Soft time limit reached; cancelling stage");
            soft_cancel.cancel();
        });

        let outcome = tokio::time::timeout(
            self.config.queue.hard_time_limit(),
            execute_stage(task.stage, &ctx, &self.sessions, progress, token.clone()),
        )
        .await;
        soft_guard.abort();
        self.revocations.remove(&task.id);

        match outcome {
            Ok(Ok(result)) => {
                if let Err(e) = self.queue.complete(&task.id, &result) {
                    error!(task = %task.id, error = %e, "Failed to record task success");
                }
            }
            Ok(Err(ref e)) if super::is_cancellation(e) && self.is_revoked(&task.id) => {
                info!(task = %task.id, "Task revoked; leaving terminal state untouched");
            }
            Ok(Err(e)) => {
                self.record_failure(&task, &e.to_string(), is_retryable(&e));
            }
            Err(_) => {
                let message = format!(
                    "Hard time limit exceeded ({}s)",
                    self.config.queue.hard_time_limit_secs
                );
                if let Err(e) = self.sessions.set_error(&task.session_id, &message) {
                    error!(task = %task.id, error = %e, "Failed to record session error");
                }
                self.record_failure(&task, &message, true);
            }
        }
    }

    fn is_revoked(&self, task_id: &str) -> bool {
        matches!(self.queue.status(task_id), Ok(Some(TaskStatus::Revoked)))
    }

    fn record_failure(&self, task: &ClaimedTask, message: &str, retryable: bool) {
        let message = truncate_error(message);
        match self.queue.fail(&task.id, &message, retryable) {
            Ok(FailOutcome::Retrying { delay_secs }) => {
                metrics::record_task_retry(task.stage.as_str());
                info!(task = %task.id, delay_secs, "Task scheduled for retry");
            }
            Ok(FailOutcome::Failed) => {
                warn!(task = %task.id, "Task parked in FAILURE");
            }
            Ok(FailOutcome::Ignored) => {
                info!(task = %task.id, "Task no longer running; failure not recorded");
            }
            Err(e) => {
                error!(task = %task.id, error = %e, "Failed to record task failure");
            }
        }
    }

    /// Map progress events into PROGRESS task meta. Terminal events are
    /// handled by completion/failure paths, not here.
    fn progress_reporter(&self, task_id: String) -> ProgressFn {
        let queue = self.queue.clone();
        Arc::new(move |event: ProgressEvent| {
            let meta = match event {
                ProgressEvent::Init { total, message } => ProgressMeta {
                    current: 0,
                    total,
                    percent: total.map(|_| 0),
                    item: None,
                    status: message,
                },
                ProgressEvent::Progress {
                    current,
                    total,
                    percent,
                    item,
                    message,
                    ..
                } => ProgressMeta {
                    current,
                    total,
                    percent,
                    item,
                    status: message,
                },
                ProgressEvent::Complete { .. } | ProgressEvent::Error { .. } => return,
            };
            if let Err(e) = queue.report_progress(&task_id, &meta) {
                warn!(task = %task_id, error = %e, "Failed to report task progress");
            }
        })
    }
}

/// Whether a stage error is worth re-running the task for.
fn is_retryable(error: &StageError) -> bool {
    match error {
        StageError::Network { .. } => true,
        StageError::Endpoint { status, .. } => *status == 429 || *status >= 500,
        StageError::Cancelled => true,
        StageError::Io(_) => true,
        StageError::Database(_) => true,
        StageError::Extraction(inner) => matches!(
            inner,
            ExtractionError::RetriesExhausted { .. }
                | ExtractionError::Network { .. }
                | ExtractionError::Cancelled
        ),
        StageError::MissingInput { .. }
        | StageError::MissingCredential { .. }
        | StageError::Unconfigured { .. }
        | StageError::Serialization(_) => false,
    }
}
