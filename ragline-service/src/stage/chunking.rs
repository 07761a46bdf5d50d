//! Chunking stage: split extracted documents into overlapping word windows.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::StageError;
use crate::extraction::{JournalPaths, read_records};
use crate::metrics;
use crate::progress::{ProgressEvent, ProgressFn, ProgressLevel};

use super::StageContext;

/// Window size and overlap, in words. Overlap keeps sentences that straddle
/// a boundary retrievable from either side.
const CHUNK_WORDS: usize = 500;
const CHUNK_OVERLAP: usize = 50;

/// One retrievable unit of text, enriched in place by the embedding stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub item_key: String,
    pub title: String,
    pub filename: String,
    pub chunk_index: usize,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dense_vector: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_vector: Option<std::collections::BTreeMap<String, f32>>,
}

/// Split text into overlapping word windows.
pub fn split_into_windows(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    let step = window.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + window).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Read the chunk file written by this stage.
pub fn load_chunks(path: &Path) -> Result<Vec<Chunk>, StageError> {
    let json = std::fs::read_to_string(path).map_err(|_| StageError::MissingInput {
        path: path.display().to_string(),
    })?;
    Ok(serde_json::from_str(&json)?)
}

/// Write the chunk file; also used by the embedding stages after enrichment.
pub fn store_chunks(path: &Path, chunks: &[Chunk]) -> Result<(), StageError> {
    std::fs::write(path, serde_json::to_vec_pretty(chunks)?)?;
    Ok(())
}

pub async fn run(
    ctx: &StageContext,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> Result<serde_json::Value, StageError> {
    let paths = JournalPaths::for_output(&ctx.output_stem());
    let records = read_records(&paths)?;
    if records.is_empty() {
        return Err(StageError::MissingInput {
            path: paths.journal.display().to_string(),
        });
    }

    let total = records.len();
    progress(ProgressEvent::Init {
        total: Some(total as u64),
        message: format!("Loading {total} documents for chunking"),
    });

    let mut chunks: Vec<Chunk> = Vec::new();
    for (doc_index, record) in records.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let windows = split_into_windows(&record.text, CHUNK_WORDS, CHUNK_OVERLAP);
        let produced = windows.len();
        for (chunk_index, text) in windows.into_iter().enumerate() {
            chunks.push(Chunk {
                chunk_id: format!("{}:{}:{}", record.item_key, record.filename, chunk_index),
                item_key: record.item_key.clone(),
                title: record.title.clone(),
                filename: record.filename.clone(),
                chunk_index,
                text,
                dense_vector: None,
                sparse_vector: None,
            });
        }

        let current = (doc_index + 1) as u64;
        progress(ProgressEvent::Progress {
            level: Some(ProgressLevel::Chunk),
            current,
            total: Some(total as u64),
            percent: Some(ProgressEvent::percent_of(current, total as u64)),
            item: Some(record.title.clone()),
            message: format!("Document #{}: {produced} chunks generated", doc_index + 1),
        });
    }

    store_chunks(&ctx.chunks_path(), &chunks)?;
    metrics::record_chunks_generated(chunks.len() as u64);
    info!(documents = total, chunks = chunks.len(), "Chunking finished");

    progress(ProgressEvent::Complete {
        message: format!("Chunking complete: {} chunks", chunks.len()),
    });
    Ok(serde_json::json!({
        "documents": total,
        "chunks": chunks.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractionRecord, JournalWriter};
    use crate::stage::test_support::stage_context;
    use std::sync::{Arc, Mutex};

    #[test]
    fn windows_overlap_and_cover_all_words() {
        let words: Vec<String> = (0..1100).map(|i| format!("w{i}")).collect();
        let text = words.join(" ");
        let chunks = split_into_windows(&text, 500, 50);

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].starts_with("w0 "));
        // Second window starts one step (450 words) in.
        assert!(chunks[1].starts_with("w450 "));
        assert!(chunks[2].ends_with(" w1099"));
    }

    #[test]
    fn short_text_is_one_window() {
        assert_eq!(split_into_windows("a b c", 500, 50).len(), 1);
        assert!(split_into_windows("   ", 500, 50).is_empty());
    }

    fn record(key: &str, words: usize) -> ExtractionRecord {
        let text = (0..words)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
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
            text,
            provider: "stub".to_string(),
        }
    }

    #[tokio::test]
    async fn chunking_stage_writes_chunk_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context(dir.path());

        let writer = JournalWriter::spawn(JournalPaths::for_output(&ctx.output_stem()));
        writer
            .commit_item("A1".to_string(), vec![record("A1", 1100)], vec![])
            .await
            .unwrap();
        writer
            .commit_item("B2".to_string(), vec![record("B2", 10)], vec![])
            .await
            .unwrap();
        writer.finalize().await.unwrap();

        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
        let sink = events.clone();
        let callback: ProgressFn = Arc::new(move |e| sink.lock().unwrap().push(e));

        let result = run(&ctx, callback, CancellationToken::new()).await.unwrap();
        assert_eq!(result["documents"], 2);
        assert_eq!(result["chunks"], 4);

        let chunks = load_chunks(&ctx.chunks_path()).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].chunk_id, "A1:A1.pdf:0");
        assert!(chunks.iter().all(|c| c.dense_vector.is_none()));

        let events = events.lock().unwrap();
        assert!(matches!(
            events[0],
            ProgressEvent::Init { total: Some(2), .. }
        ));
    }

    #[tokio::test]
    async fn chunking_without_journal_is_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context(dir.path());
        let callback: ProgressFn = Arc::new(|_| {});
        let err = run(&ctx, callback, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MissingInput { .. }));
    }
}
