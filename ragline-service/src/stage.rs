//! Pipeline stages and the two transports that run them.
//!
//! Each stage has exactly one core run function taking a progress callback
//! and a cancellation token. The tracked-subprocess transport re-invokes the
//! service binary and streams stdout markers; the queued-task transport runs
//! the same core inside a queue worker. Session status bookkeeping, error
//! truncation, and stage metrics live in [`execute_stage`] so both transports
//! behave identically.

pub mod chunking;
pub mod embedding;
pub mod queue;
pub mod session_store;
pub mod subprocess;
pub mod upload;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::StaticConfig;
use crate::credentials::CredentialResolver;
use crate::error::StageError;
use crate::extraction::{ExtractionEngine, OcrEngine, RetryPolicy, TextExtractor};
use crate::metrics;
use crate::progress::parsers::{
    LineParser, parse_chunking_log, parse_embedding_log, parse_extraction_log, parse_percent_bar,
    parse_progress_marker,
};
use crate::progress::ProgressFn;

pub use queue::{TaskQueue, TaskStatus};
pub use session_store::SessionStore;
pub use worker::QueueWorker;

/// Error messages stored on a session are capped at this length.
const ERROR_MESSAGE_LIMIT: usize = 1000;

/// The five pipeline stages, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize, ValueEnum,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum StageKind {
    Extraction,
    Chunking,
    DenseEmbedding,
    SparseEmbedding,
    VectorUpload,
}

impl StageKind {
    /// Session status while this stage is running.
    pub fn running_status(&self) -> &'static str {
        match self {
            StageKind::Extraction => "extracting",
            StageKind::Chunking => "chunking",
            StageKind::DenseEmbedding | StageKind::SparseEmbedding => "embedding",
            StageKind::VectorUpload => "uploading",
        }
    }

    /// Session status once this stage has finished.
    pub fn completed_status(&self) -> &'static str {
        match self {
            StageKind::Extraction => "extracted",
            StageKind::Chunking => "chunked",
            StageKind::DenseEmbedding | StageKind::SparseEmbedding => "embedded",
            StageKind::VectorUpload => "completed",
        }
    }

    /// Stable label used in metrics and queue rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Extraction => "extraction",
            StageKind::Chunking => "chunking",
            StageKind::DenseEmbedding => "dense_embedding",
            StageKind::SparseEmbedding => "sparse_embedding",
            StageKind::VectorUpload => "vector_upload",
        }
    }

    /// Parser chain for this stage's subprocess output. The structured
    /// marker always leads; stage-specific log phrases follow.
    pub fn parsers(&self) -> Vec<LineParser> {
        let tail: LineParser = match self {
            StageKind::Extraction => parse_extraction_log,
            StageKind::Chunking => parse_chunking_log,
            _ => parse_embedding_log,
        };
        vec![parse_progress_marker, parse_percent_bar, tail]
    }
}

/// Everything a stage core needs to run for one session.
#[derive(Clone)]
pub struct StageContext {
    pub config: Arc<StaticConfig>,
    pub session_id: String,
    pub session_dir: PathBuf,
    pub credentials: Arc<dyn CredentialResolver>,
    pub ocr_limiter: Arc<Semaphore>,
}

impl StageContext {
    /// Manifest describing the session's source items.
    pub fn manifest_path(&self) -> PathBuf {
        self.session_dir.join("manifest.json")
    }

    /// Output stem the extraction journal files derive from.
    pub fn output_stem(&self) -> PathBuf {
        self.session_dir.join("output")
    }

    /// Chunk file written by the chunking stage and enriched by the
    /// embedding stages.
    pub fn chunks_path(&self) -> PathBuf {
        self.session_dir.join("output_chunks.json")
    }
}

/// Dispatch to the stage's core implementation.
pub async fn run_stage_core(
    kind: StageKind,
    ctx: &StageContext,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> Result<serde_json::Value, StageError> {
    match kind {
        StageKind::Extraction => {
            let extraction = &ctx.config.extraction;
            let chain = OcrEngine::from_config(
                &ctx.config.providers,
                ctx.credentials.clone(),
                ctx.ocr_limiter.clone(),
            )?;
            let engine = ExtractionEngine::new(
                Arc::new(chain) as Arc<dyn TextExtractor>,
                RetryPolicy::new(extraction.max_retries, extraction.retry_backoff_base),
                extraction.workers,
            );
            let report = engine
                .run(
                    &ctx.manifest_path(),
                    &ctx.session_dir,
                    &ctx.output_stem(),
                    progress,
                    cancel,
                )
                .await?;
            Ok(serde_json::json!({
                "total_items": report.total_items,
                "processed": report.processed,
                "skipped": report.skipped,
                "records_written": report.records_written,
                "failures": report.failures,
            }))
        }
        StageKind::Chunking => chunking::run(ctx, progress, cancel).await,
        StageKind::DenseEmbedding => embedding::run_dense(ctx, progress, cancel).await,
        StageKind::SparseEmbedding => embedding::run_sparse(ctx, progress, cancel).await,
        StageKind::VectorUpload => upload::run(ctx, progress, cancel).await,
    }
}

/// Run a stage with the shared session bookkeeping both transports use.
///
/// Sets the in-progress status before the core starts, the done status and
/// the duration metric on success. A cancellation moves the session to
/// `cancelled`; any other failure stores the truncated error message on the
/// session. The error is propagated unchanged either way.
pub async fn execute_stage(
    kind: StageKind,
    ctx: &StageContext,
    sessions: &SessionStore,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> Result<serde_json::Value, StageError> {
    sessions.set_status(&ctx.session_id, kind.running_status())?;
    info!(session = %ctx.session_id, stage = kind.as_str(), "Stage started");
    let started = Instant::now();

    match run_stage_core(kind, ctx, progress, cancel).await {
        Ok(result) => {
            metrics::record_stage_duration(kind.as_str(), started.elapsed().as_secs_f64());
            sessions.set_status(&ctx.session_id, kind.completed_status())?;
            info!(
                session = %ctx.session_id,
                stage = kind.as_str(),
                elapsed_secs = started.elapsed().as_secs_f64(),
                "Stage finished"
            );
            Ok(result)
        }
        Err(e) if is_cancellation(&e) => {
            info!(session = %ctx.session_id, stage = kind.as_str(), "Stage cancelled");
            sessions.set_status(&ctx.session_id, "cancelled")?;
            Err(e)
        }
        Err(e) => {
            error!(session = %ctx.session_id, stage = kind.as_str(), error = %e, "Stage failed");
            sessions.set_error(&ctx.session_id, &truncate_error(&e.to_string()))?;
            Err(e)
        }
    }
}

/// A stop request surfaces as a cancellation error, not a stage fault.
pub fn is_cancellation(error: &StageError) -> bool {
    matches!(
        error,
        StageError::Cancelled | StageError::Extraction(crate::error::ExtractionError::Cancelled)
    )
}

/// Cap stored error messages; provider responses can be arbitrarily long.
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_LIMIT {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_LIMIT).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractionRecord, JournalPaths, JournalWriter};
    use test_support::stage_context;

    #[test]
    fn stage_status_transitions() {
        assert_eq!(StageKind::Extraction.running_status(), "extracting");
        assert_eq!(StageKind::Extraction.completed_status(), "extracted");
        assert_eq!(StageKind::DenseEmbedding.running_status(), "embedding");
        assert_eq!(StageKind::SparseEmbedding.completed_status(), "embedded");
        assert_eq!(StageKind::VectorUpload.completed_status(), "completed");
    }

    #[test]
    fn stage_kind_string_roundtrip() {
        for kind in [
            StageKind::Extraction,
            StageKind::Chunking,
            StageKind::DenseEmbedding,
            StageKind::SparseEmbedding,
            StageKind::VectorUpload,
        ] {
            assert_eq!(kind.as_str().parse::<StageKind>().unwrap(), kind);
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }

    #[test]
    fn error_truncation_caps_at_limit() {
        let long = "x".repeat(5000);
        assert_eq!(truncate_error(&long).chars().count(), 1000);
        assert_eq!(truncate_error("short"), "short");
    }

    fn journal_record(key: &str) -> ExtractionRecord {
        ExtractionRecord {
            item_key: key.to_string(),
            item_type: String::new(),
            title: format!("Doc {key}"),
            abstract_text: String::new(),
            date: String::new(),
            url: String::new(),
            doi: String::new(),
            authors: String::new(),
            filename: format!("{key}.pdf"),
            path: format!("/tmp/{key}.pdf"),
            attachment_title: String::new(),
            text: "some extracted text".to_string(),
            provider: "stub".to_string(),
        }
    }

    #[tokio::test]
    async fn failed_stage_records_error_status_on_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context(dir.path());
        let sessions = SessionStore::open_in_memory().unwrap();
        let callback: ProgressFn = Arc::new(|_| {});

        // No journal in the directory, so chunking fails on missing input.
        let err = execute_stage(
            StageKind::Chunking,
            &ctx,
            &sessions,
            callback,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StageError::MissingInput { .. }));

        let record = sessions.get(&ctx.session_id).unwrap().unwrap();
        assert_eq!(record.status, "error");
        assert!(record.error.unwrap().contains("input missing"));
    }

    #[tokio::test]
    async fn cancelled_stage_is_not_recorded_as_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context(dir.path());
        let sessions = SessionStore::open_in_memory().unwrap();

        let writer = JournalWriter::spawn(JournalPaths::for_output(&ctx.output_stem()));
        writer
            .commit_item("A1".to_string(), vec![journal_record("A1")], vec![])
            .await
            .unwrap();
        writer.finalize().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let callback: ProgressFn = Arc::new(|_| {});

        let err = execute_stage(StageKind::Chunking, &ctx, &sessions, callback, cancel)
            .await
            .unwrap_err();
        assert!(is_cancellation(&err));

        let record = sessions.get(&ctx.session_id).unwrap().unwrap();
        assert_eq!(record.status, "cancelled");
        assert!(record.error.is_none());
    }
}
