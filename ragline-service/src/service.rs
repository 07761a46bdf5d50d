//! Service container: shared state wired together at startup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StaticConfig;
use crate::credentials::{CredentialResolver, EnvCredentials};
use crate::error::ServiceResult;
use crate::process_registry::{ProcessRegistry, StopSummary};
use crate::stage::worker::RevocationMap;
use crate::stage::{QueueWorker, SessionStore, StageContext, TaskQueue};

/// How long a stop request waits for SIGTERM to work before escalating.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Queue hygiene cadence: stale-claim requeue and dead-pid cleanup.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the API handlers and queue workers share.
pub struct PipelineService {
    pub config: Arc<StaticConfig>,
    pub registry: Arc<ProcessRegistry>,
    pub queue: Arc<TaskQueue>,
    pub sessions: Arc<SessionStore>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub ocr_limiter: Arc<Semaphore>,
    pub revocations: RevocationMap,
}

impl PipelineService {
    pub fn new(config: Arc<StaticConfig>) -> ServiceResult<Self> {
        let db_path = config.database_path();
        let queue = Arc::new(TaskQueue::open(&db_path, config.queue.clone())?);
        let sessions = Arc::new(SessionStore::open(&db_path)?);
        let ocr_limiter = Arc::new(Semaphore::new(config.extraction.ocr_concurrent_calls));

        Ok(Self {
            config,
            registry: Arc::new(ProcessRegistry::new()),
            queue,
            sessions,
            credentials: Arc::new(EnvCredentials),
            ocr_limiter,
            revocations: Arc::default(),
        })
    }

    /// Context for running a stage over one session, in-process.
    pub fn stage_context(&self, session_id: &str) -> StageContext {
        StageContext {
            config: self.config.clone(),
            session_id: session_id.to_string(),
            session_dir: self.config.session_dir(session_id),
            credentials: self.credentials.clone(),
            ocr_limiter: self.ocr_limiter.clone(),
        }
    }

    /// Stop every tracked process for a session and cancel any queued tasks
    /// this process is currently running for it.
    pub async fn stop_session(&self, session_id: &str) -> StopSummary {
        for entry in self.revocations.iter() {
            if entry.value().session_id == session_id {
                entry.value().token.cancel();
            }
        }
        self.registry
            .stop_session(session_id, STOP_GRACE_PERIOD)
            .await
    }

    /// Spawn the queue workers plus the periodic hygiene sweep.
    pub fn start_workers(self: &Arc<Self>, shutdown: CancellationToken) {
        for worker_id in 0..self.config.queue.workers {
            let worker = QueueWorker {
                config: self.config.clone(),
                queue: self.queue.clone(),
                sessions: self.sessions.clone(),
                credentials: self.credentials.clone(),
                ocr_limiter: self.ocr_limiter.clone(),
                revocations: self.revocations.clone(),
            };
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker.run(worker_id, shutdown).await;
            });
        }
        info!(workers = self.config.queue.workers, "Queue workers started");

        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match service.queue.requeue_stale() {
                    Ok(count) if count > 0 => {
                        info!(requeued = count, "Stale task claims requeued");
                    }
                    Err(e) => warn!(error = %e, "Stale claim sweep failed"),
                    _ => {}
                }
                service.registry.cleanup_dead_processes();
            }
        });
    }
}
