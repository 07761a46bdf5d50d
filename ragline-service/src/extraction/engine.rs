//! The resumable extraction run: manifest in, journal and checkpoint out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ExtractionError;
use crate::metrics;
use crate::progress::{ProgressEvent, ProgressFn, ProgressLevel};

use super::fuzzy::resolve_attachment;
use super::journal::{
    ERROR_OCR_FAILED, ERROR_PDF_NOT_FOUND, ERROR_PROCESSING, ExtractionRecord, FailureRecord,
    JournalPaths, JournalWriter, load_checkpoint,
};
use super::manifest::{SourceItem, load_manifest};
use super::ocr::TextExtractor;
use super::retry::RetryPolicy;

/// Counters for one extraction run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractionReport {
    pub total_items: usize,
    /// Items handled during this run.
    pub processed: usize,
    /// Items skipped because the checkpoint already held them.
    pub skipped: usize,
    pub records_written: usize,
    pub failures: usize,
}

/// Drives extraction over a manifest with checkpoint resume.
///
/// All durable writes go through the journal writer; the engine itself holds
/// no state between runs, so re-running with the same output stem resumes
/// where the previous run stopped.
pub struct ExtractionEngine {
    extractor: Arc<dyn TextExtractor>,
    retry: RetryPolicy,
    workers: usize,
}

impl ExtractionEngine {
    pub fn new(extractor: Arc<dyn TextExtractor>, retry: RetryPolicy, workers: usize) -> Self {
        Self {
            extractor,
            retry,
            workers: workers.max(1),
        }
    }

    /// Run extraction for `manifest_path`, resolving attachments relative to
    /// `base_dir` and journaling under `output_stem`.
    pub async fn run(
        &self,
        manifest_path: &Path,
        base_dir: &Path,
        output_stem: &Path,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<ExtractionReport, ExtractionError> {
        let items = load_manifest(manifest_path)?;
        let total = items.len();

        let paths = JournalPaths::for_output(output_stem);
        let checkpoint = load_checkpoint(&paths);
        let (skipped_items, remaining): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|item| checkpoint.processed_keys.contains(&item.key));
        let skipped = skipped_items.len();

        info!(
            total,
            skipped,
            remaining = remaining.len(),
            "Starting extraction run"
        );
        if skipped > 0 {
            progress(ProgressEvent::Init {
                total: Some(total as u64),
                message: format!("Resuming: {skipped}/{total} items already processed"),
            });
        } else {
            progress(ProgressEvent::Init {
                total: Some(total as u64),
                message: format!("Found {total} items to process"),
            });
        }

        let writer = JournalWriter::spawn(paths);
        let completed = Arc::new(AtomicU64::new(skipped as u64));

        let mut report = ExtractionReport {
            total_items: total,
            skipped,
            ..Default::default()
        };

        if self.workers == 1 {
            for item in remaining {
                if cancel.is_cancelled() {
                    writer.finalize().await?;
                    return Err(ExtractionError::Cancelled);
                }
                let outcome = self
                    .handle_item(item, base_dir, &writer, &progress, &completed, total)
                    .await?;
                report.processed += 1;
                report.records_written += outcome.0;
                report.failures += outcome.1;
            }
        } else {
            let limiter = Arc::new(Semaphore::new(self.workers));
            let mut tasks: JoinSet<Result<(usize, usize), ExtractionError>> = JoinSet::new();

            for item in remaining {
                if cancel.is_cancelled() {
                    break;
                }
                let permit = limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ExtractionError::Cancelled)?;
                let extractor = self.extractor.clone();
                let retry = self.retry;
                let base_dir = base_dir.to_path_buf();
                let writer = writer.clone();
                let progress = progress.clone();
                let completed = completed.clone();

                tasks.spawn(async move {
                    let _permit = permit;
                    process_item(
                        extractor, retry, item, &base_dir, &writer, &progress, &completed, total,
                    )
                    .await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (records, failures) = joined.map_err(|e| {
                    warn!(error = %e, "Extraction worker panicked");
                    ExtractionError::Cancelled
                })??;
                report.processed += 1;
                report.records_written += records;
                report.failures += failures;
            }

            if cancel.is_cancelled() {
                writer.finalize().await?;
                return Err(ExtractionError::Cancelled);
            }
        }

        writer.finalize().await?;
        progress(ProgressEvent::Complete {
            message: format!(
                "Extraction complete: {} records, {} failures",
                report.records_written, report.failures
            ),
        });
        info!(?report, "Extraction run finished");
        Ok(report)
    }

    async fn handle_item(
        &self,
        item: SourceItem,
        base_dir: &Path,
        writer: &JournalWriter,
        progress: &ProgressFn,
        completed: &Arc<AtomicU64>,
        total: usize,
    ) -> Result<(usize, usize), ExtractionError> {
        process_item(
            self.extractor.clone(),
            self.retry,
            item,
            base_dir,
            writer,
            progress,
            completed,
            total,
        )
        .await
    }
}

/// Handle one item end to end: resolve attachments, extract, commit.
///
/// Per-attachment failures are recorded and the item is still checkpointed;
/// only infrastructure failures (journal unavailable, IO on commit) abort
/// the run.
#[allow(clippy::too_many_arguments)]
async fn process_item(
    extractor: Arc<dyn TextExtractor>,
    retry: RetryPolicy,
    item: SourceItem,
    base_dir: &Path,
    writer: &JournalWriter,
    progress: &ProgressFn,
    completed: &Arc<AtomicU64>,
    total: usize,
) -> Result<(usize, usize), ExtractionError> {
    let mut records: Vec<ExtractionRecord> = Vec::new();
    let mut failures: Vec<FailureRecord> = Vec::new();

    for attachment in item.pdf_attachments() {
        let Some(resolved) = resolve_attachment(&attachment.path, base_dir) else {
            warn!(item = %item.key, path = %attachment.path, "PDF not found");
            failures.push(FailureRecord::now(
                &item.key,
                &item.title,
                ERROR_PDF_NOT_FOUND,
                format!("PDF not found: {}", attachment.path),
            ));
            metrics::record_extraction_error(ERROR_PDF_NOT_FOUND);
            continue;
        };

        info!(item = %item.key, path = %resolved.display(), "Extracting attachment");
        let attempt_path = resolved.clone();
        let extraction = retry
            .run(|| {
                let extractor = extractor.clone();
                let path: PathBuf = attempt_path.clone();
                async move { extractor.extract(&path).await }
            })
            .await;

        match extraction {
            Ok(outcome) => {
                metrics::record_documents_processed(outcome.provider.clone(), 1);
                records.push(ExtractionRecord {
                    item_key: item.key.clone(),
                    item_type: item.item_type.clone(),
                    title: item.title.clone(),
                    abstract_text: item.abstract_text.clone(),
                    date: item.date.clone(),
                    url: item.url.clone(),
                    doi: item.doi.clone(),
                    authors: item.authors(),
                    filename: filename_of(&attachment.path),
                    path: resolved.display().to_string(),
                    attachment_title: attachment.title.clone(),
                    text: outcome.text,
                    provider: outcome.provider,
                });
            }
            Err(e) => {
                warn!(item = %item.key, error = %e, "Attachment extraction failed");
                let error_type = match &e {
                    ExtractionError::Pdf { .. } | ExtractionError::Io(_) => ERROR_PROCESSING,
                    _ => ERROR_OCR_FAILED,
                };
                failures.push(FailureRecord::now(
                    &item.key,
                    &item.title,
                    error_type,
                    e.to_string(),
                ));
                metrics::record_extraction_error(error_type);
            }
        }
    }

    let record_count = records.len();
    let failure_count = failures.len();
    writer
        .commit_item(item.key.clone(), records, failures)
        .await?;

    let current = completed.fetch_add(1, Ordering::SeqCst) + 1;
    progress(ProgressEvent::Progress {
        level: Some(ProgressLevel::Row),
        current,
        total: Some(total as u64),
        percent: Some(ProgressEvent::percent_of(current, total as u64)),
        item: Some(item.title.clone()),
        message: if item.title.is_empty() {
            item.key.clone()
        } else {
            item.title.clone()
        },
    });

    Ok((record_count, failure_count))
}

fn filename_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::journal::read_records;
    use crate::extraction::ocr::OcrOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubExtractor;

    #[async_trait]
    impl TextExtractor for StubExtractor {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn extract(&self, _pdf_path: &Path) -> Result<OcrOutcome, ExtractionError> {
            Ok(OcrOutcome {
                text: "stub text".to_string(),
                provider: "stub".to_string(),
            })
        }
    }

    fn write_fixture(dir: &Path) -> PathBuf {
        std::fs::write(dir.join("a.pdf"), b"%PDF-1.4").unwrap();
        let manifest = serde_json::json!([
            {
                "key": "A1",
                "title": "Has attachment",
                "attachments": [{"path": "a.pdf", "title": "Full text"}]
            },
            {
                "key": "B2",
                "title": "Missing attachment",
                "attachments": [{"path": "nowhere/missing.pdf", "title": "Full text"}]
            },
            {
                "key": "C3",
                "title": "No attachments"
            }
        ]);
        let path = dir.join("manifest.json");
        std::fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();
        path
    }

    fn collector() -> (ProgressFn, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
        let sink = events.clone();
        let callback: ProgressFn = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });
        (callback, events)
    }

    #[tokio::test]
    async fn three_item_run_journals_checkpoints_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_fixture(dir.path());
        let stem = dir.path().join("output");
        let (progress, events) = collector();

        let engine = ExtractionEngine::new(Arc::new(StubExtractor), RetryPolicy::default(), 1);
        let report = engine
            .run(
                &manifest,
                dir.path(),
                &stem,
                progress,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.total_items, 3);
        assert_eq!(report.processed, 3);
        assert_eq!(report.records_written, 1);
        assert_eq!(report.failures, 1);

        let paths = JournalPaths::for_output(&stem);
        let records = read_records(&paths).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_key, "A1");
        assert_eq!(records[0].provider, "stub");

        let checkpoint = load_checkpoint(&paths);
        assert_eq!(checkpoint.processed_keys.len(), 3);
        for key in ["A1", "B2", "C3"] {
            assert!(checkpoint.processed_keys.contains(key));
        }

        let errors: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.errors).unwrap()).unwrap();
        assert_eq!(errors["total_errors"], 1);
        assert_eq!(errors["errors"][0]["error_type"], "PDF_NOT_FOUND");

        let events = events.lock().unwrap();
        assert!(matches!(
            events[0],
            ProgressEvent::Init { total: Some(3), .. }
        ));
        let rows: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Progress { .. }))
            .collect();
        assert_eq!(rows.len(), 3);
        assert!(matches!(
            events.last().unwrap(),
            ProgressEvent::Complete { .. }
        ));
    }

    #[tokio::test]
    async fn fully_checkpointed_rerun_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_fixture(dir.path());
        let stem = dir.path().join("output");
        let engine = ExtractionEngine::new(Arc::new(StubExtractor), RetryPolicy::default(), 1);

        let (progress, _) = collector();
        engine
            .run(
                &manifest,
                dir.path(),
                &stem,
                progress,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let (progress, events) = collector();
        let report = engine
            .run(
                &manifest,
                dir.path(),
                &stem,
                progress,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.records_written, 0);

        let paths = JournalPaths::for_output(&stem);
        assert_eq!(read_records(&paths).unwrap().len(), 1);

        let events = events.lock().unwrap();
        match &events[0] {
            ProgressEvent::Init { message, .. } => {
                assert!(message.starts_with("Resuming: 3/3"));
            }
            other => panic!("unexpected first event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn worker_pool_produces_same_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_fixture(dir.path());
        let stem = dir.path().join("output");
        let (progress, _) = collector();

        let engine = ExtractionEngine::new(Arc::new(StubExtractor), RetryPolicy::default(), 4);
        let report = engine
            .run(
                &manifest,
                dir.path(),
                &stem,
                progress,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.records_written, 1);
        assert_eq!(report.failures, 1);

        let paths = JournalPaths::for_output(&stem);
        assert_eq!(load_checkpoint(&paths).processed_keys.len(), 3);
    }

    #[tokio::test]
    async fn cancelled_run_reports_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_fixture(dir.path());
        let stem = dir.path().join("output");
        let (progress, _) = collector();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let engine = ExtractionEngine::new(Arc::new(StubExtractor), RetryPolicy::default(), 1);
        let err = engine
            .run(&manifest, dir.path(), &stem, progress, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Cancelled));
    }
}
