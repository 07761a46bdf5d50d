//! Durable extraction state: output journal, checkpoint, error journal.
//!
//! Three files per extraction output:
//! - `<output>.jsonl` — append-only journal, one JSON record per extracted
//!   attachment;
//! - `<output>.progress.json` — checkpoint, the set of item keys already
//!   handled;
//! - `<output>_errors.json` — per-item failures, replace-on-write,
//!   diagnostics only (never read back to drive control flow).
//!
//! All writes go through one [`JournalWriter`] actor so journal appends and
//! checkpoint updates never interleave across workers. A crash can still land
//! between the journal append and the checkpoint write; readers close that
//! window by deduplicating records on their natural key.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::error::ExtractionError;

pub const ERROR_PDF_NOT_FOUND: &str = "PDF_NOT_FOUND";
pub const ERROR_OCR_FAILED: &str = "OCR_FAILED";
pub const ERROR_PROCESSING: &str = "PROCESSING_ERROR";

/// One successfully extracted attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub item_key: String,
    pub item_type: String,
    pub title: String,
    pub abstract_text: String,
    pub date: String,
    pub url: String,
    pub doi: String,
    pub authors: String,
    /// Filename as named by the manifest.
    pub filename: String,
    /// Path the attachment actually resolved to.
    pub path: String,
    pub attachment_title: String,
    pub text: String,
    /// Which extractor produced the text.
    pub provider: String,
}

/// Checkpoint file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub processed_keys: BTreeSet<String>,
    #[serde(default)]
    pub last_updated: String,
}

/// One entry in the error journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub item_key: String,
    pub title: String,
    pub error_type: String,
    pub message: String,
    pub timestamp: String,
}

impl FailureRecord {
    pub fn now(item_key: &str, title: &str, error_type: &str, message: impl Into<String>) -> Self {
        Self {
            item_key: item_key.to_string(),
            title: title.to_string(),
            error_type: error_type.to_string(),
            message: message.into(),
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorJournal {
    total_errors: usize,
    errors: Vec<FailureRecord>,
    last_updated: String,
}

/// The three file paths derived from one output stem.
#[derive(Debug, Clone)]
pub struct JournalPaths {
    pub journal: PathBuf,
    pub checkpoint: PathBuf,
    pub errors: PathBuf,
}

impl JournalPaths {
    /// `stem` is the output path without extension, e.g. `session/output`.
    pub fn for_output(stem: &Path) -> Self {
        let name = stem
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let dir = stem.parent().map(Path::to_path_buf).unwrap_or_default();
        Self {
            journal: dir.join(format!("{name}.jsonl")),
            checkpoint: dir.join(format!("{name}.progress.json")),
            errors: dir.join(format!("{name}_errors.json")),
        }
    }
}

/// Load the checkpoint; a missing or unreadable file means a fresh start.
pub fn load_checkpoint(paths: &JournalPaths) -> Checkpoint {
    match std::fs::read_to_string(&paths.checkpoint) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_default(),
        Err(_) => Checkpoint::default(),
    }
}

/// Read journal records, deduplicated by `(item_key, filename)`.
///
/// Later appends win, which makes a partially re-processed item converge on
/// its freshest extraction. Corrupt lines (a torn tail write) are skipped.
pub fn read_records(paths: &JournalPaths) -> Result<Vec<ExtractionRecord>, ExtractionError> {
    let content = match std::fs::read_to_string(&paths.journal) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records: Vec<ExtractionRecord> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ExtractionRecord>(line) {
            Ok(record) => {
                records.retain(|r| {
                    !(r.item_key == record.item_key && r.filename == record.filename)
                });
                records.push(record);
            }
            Err(e) => {
                error!(error = %e, "Skipping corrupt journal line");
            }
        }
    }
    Ok(records)
}

enum JournalCommand {
    CommitItem {
        item_key: String,
        records: Vec<ExtractionRecord>,
        failures: Vec<FailureRecord>,
        ack: oneshot::Sender<Result<(), ExtractionError>>,
    },
    Finalize {
        ack: oneshot::Sender<Result<(), ExtractionError>>,
    },
}

/// Handle to the single-writer journal actor.
///
/// Cloneable; all clones feed the same writer task, which applies commands in
/// arrival order. Dropping every handle shuts the task down after it drains.
#[derive(Clone)]
pub struct JournalWriter {
    tx: mpsc::Sender<JournalCommand>,
}

impl JournalWriter {
    /// Spawn the writer task over the given paths, seeded with the current
    /// checkpoint and any failures recorded by a previous run.
    pub fn spawn(paths: JournalPaths) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let state = WriterState::open(paths);
        tokio::spawn(state.run(rx));
        Self { tx }
    }

    /// Commit one fully handled item: journal appends first, then the
    /// checkpoint update, then the error journal rewrite if there were
    /// failures. Resolves once everything is on disk.
    pub async fn commit_item(
        &self,
        item_key: String,
        records: Vec<ExtractionRecord>,
        failures: Vec<FailureRecord>,
    ) -> Result<(), ExtractionError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(JournalCommand::CommitItem {
                item_key,
                records,
                failures,
                ack,
            })
            .await
            .map_err(|_| ExtractionError::JournalClosed)?;
        done.await.map_err(|_| ExtractionError::JournalClosed)?
    }

    /// Flush the error journal (written even when empty, so a clean run
    /// leaves an explicit zero-error file) and the checkpoint timestamp.
    pub async fn finalize(&self) -> Result<(), ExtractionError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(JournalCommand::Finalize { ack })
            .await
            .map_err(|_| ExtractionError::JournalClosed)?;
        done.await.map_err(|_| ExtractionError::JournalClosed)?
    }
}

struct WriterState {
    paths: JournalPaths,
    checkpoint: Checkpoint,
    failures: Vec<FailureRecord>,
}

impl WriterState {
    fn open(paths: JournalPaths) -> Self {
        let checkpoint = load_checkpoint(&paths);
        let failures = match std::fs::read_to_string(&paths.errors) {
            Ok(json) => serde_json::from_str::<ErrorJournal>(&json)
                .map(|j| j.errors)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        Self {
            paths,
            checkpoint,
            failures,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<JournalCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                JournalCommand::CommitItem {
                    item_key,
                    records,
                    failures,
                    ack,
                } => {
                    let result = self.commit(item_key, records, failures);
                    let _ = ack.send(result);
                }
                JournalCommand::Finalize { ack } => {
                    let result = self.write_errors().and_then(|()| self.write_checkpoint());
                    let _ = ack.send(result);
                }
            }
        }
        info!("Journal writer shut down");
    }

    fn commit(
        &mut self,
        item_key: String,
        records: Vec<ExtractionRecord>,
        failures: Vec<FailureRecord>,
    ) -> Result<(), ExtractionError> {
        if !records.is_empty() {
            self.append_records(&records)?;
        }

        self.checkpoint.processed_keys.insert(item_key);
        self.write_checkpoint()?;

        if !failures.is_empty() {
            self.failures.extend(failures);
            self.write_errors()?;
        }
        Ok(())
    }

    fn append_records(&self, records: &[ExtractionRecord]) -> Result<(), ExtractionError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.journal)?;
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    // Write-to-temp then rename keeps the checkpoint readable at every
    // instant; a crash leaves either the old file or the new one.
    fn write_checkpoint(&mut self) -> Result<(), ExtractionError> {
        self.checkpoint.last_updated = Utc::now().to_rfc3339();
        let tmp = self.paths.checkpoint.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.checkpoint)?)?;
        std::fs::rename(&tmp, &self.paths.checkpoint)?;
        Ok(())
    }

    fn write_errors(&self) -> Result<(), ExtractionError> {
        let journal = ErrorJournal {
            total_errors: self.failures.len(),
            errors: self.failures.clone(),
            last_updated: Utc::now().to_rfc3339(),
        };
        let tmp = self.paths.errors.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&journal)?)?;
        std::fs::rename(&tmp, &self.paths.errors)?;
        Ok(())
    }
}
