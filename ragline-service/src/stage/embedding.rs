//! Embedding stages: dense vectors from an embeddings API, sparse vectors
//! computed locally.

use std::collections::BTreeMap;

use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::StageError;
use crate::metrics;
use crate::progress::{ProgressEvent, ProgressFn, ProgressLevel};

use super::StageContext;
use super::chunking::{Chunk, load_chunks, store_chunks};

const EMBEDDING_BATCH_SIZE: usize = 64;

/// Dense embedding: batch chunk texts through the configured embeddings
/// endpoint and attach the returned vectors in place.
pub async fn run_dense(
    ctx: &StageContext,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> Result<serde_json::Value, StageError> {
    let providers = &ctx.config.providers;
    let api_key = ctx
        .credentials
        .resolve(&providers.embeddings_api_key_env)
        .ok_or_else(|| StageError::MissingCredential {
            name: providers.embeddings_api_key_env.clone(),
        })?;

    let mut chunks = load_chunks(&ctx.chunks_path())?;
    let total_batches = chunks.len().div_ceil(EMBEDDING_BATCH_SIZE);
    progress(ProgressEvent::Init {
        total: Some(chunks.len() as u64),
        message: format!("Loading {} chunks for dense embedding", chunks.len()),
    });

    let client = Client::new();
    let endpoint = providers.embeddings_url.clone();
    let mut embedded = 0u64;

    for (batch_index, batch) in chunks.chunks_mut(EMBEDDING_BATCH_SIZE).enumerate() {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let inputs: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
        let response = client
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&json!({
                "model": providers.embeddings_model,
                "input": inputs,
            }))
            .send()
            .await
            .map_err(|source| StageError::Network {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StageError::Endpoint {
                endpoint: endpoint.clone(),
                status: status.as_u16(),
                message: message.chars().take(500).collect(),
            });
        }

        let payload: serde_json::Value =
            response
                .json()
                .await
                .map_err(|source| StageError::Network {
                    endpoint: endpoint.clone(),
                    source,
                })?;

        for (chunk, entry) in batch
            .iter_mut()
            .zip(payload["data"].as_array().into_iter().flatten())
        {
            let vector: Vec<f32> = entry["embedding"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if !vector.is_empty() {
                chunk.dense_vector = Some(vector);
                embedded += 1;
            }
        }

        let current = (batch_index + 1) as u64;
        progress(ProgressEvent::Progress {
            level: Some(ProgressLevel::Embed),
            current,
            total: Some(total_batches as u64),
            percent: Some(ProgressEvent::percent_of(current, total_batches as u64)),
            item: None,
            message: format!("Embedded batch {current}/{total_batches}"),
        });
    }

    store_chunks(&ctx.chunks_path(), &chunks)?;
    metrics::record_embeddings_generated("dense", embedded);
    info!(chunks = chunks.len(), embedded, "Dense embedding finished");

    progress(ProgressEvent::Complete {
        message: format!("Dense embedding complete: {embedded} vectors"),
    });
    Ok(json!({ "chunks": chunks.len(), "embedded": embedded }))
}

/// Sparse embedding: local term-frequency vectors, no network involved.
pub async fn run_sparse(
    ctx: &StageContext,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> Result<serde_json::Value, StageError> {
    let mut chunks = load_chunks(&ctx.chunks_path())?;
    let total = chunks.len();
    progress(ProgressEvent::Init {
        total: Some(total as u64),
        message: format!("Loading {total} chunks for sparse embedding"),
    });

    for (index, chunk) in chunks.iter_mut().enumerate() {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        chunk.sparse_vector = Some(term_frequencies(&chunk.text));

        let current = (index + 1) as u64;
        if current % 100 == 0 || current == total as u64 {
            progress(ProgressEvent::Progress {
                level: Some(ProgressLevel::Embed),
                current,
                total: Some(total as u64),
                percent: Some(ProgressEvent::percent_of(current, total as u64)),
                item: None,
                message: format!("Sparse vectors {current}/{total}"),
            });
        }
    }

    store_chunks(&ctx.chunks_path(), &chunks)?;
    metrics::record_embeddings_generated("sparse", total as u64);
    info!(chunks = total, "Sparse embedding finished");

    progress(ProgressEvent::Complete {
        message: format!("Sparse embedding complete: {total} vectors"),
    });
    Ok(json!({ "chunks": total }))
}

/// Term frequencies normalized by the most frequent term in the chunk.
fn term_frequencies(text: &str) -> BTreeMap<String, f32> {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for word in text.split_whitespace() {
        let token: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if token.len() > 1 {
            *counts.entry(token).or_default() += 1;
        }
    }

    let max = counts.values().copied().max().unwrap_or(1) as f32;
    counts
        .into_iter()
        .map(|(token, count)| (token, count as f32 / max))
        .collect()
}
