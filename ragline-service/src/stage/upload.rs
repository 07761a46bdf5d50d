//! Vector upload stage: batched upserts to the vector store endpoint.

use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::StageError;
use crate::metrics;
use crate::progress::{ProgressEvent, ProgressFn};

use super::StageContext;
use super::chunking::load_chunks;

const UPLOAD_BATCH_SIZE: usize = 100;

pub async fn run(
    ctx: &StageContext,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> Result<serde_json::Value, StageError> {
    let providers = &ctx.config.providers;
    if providers.vector_store_url.trim().is_empty() {
        return Err(StageError::Unconfigured {
            what: "vector store endpoint",
        });
    }
    let api_key = ctx.credentials.resolve(&providers.vector_store_api_key_env);

    let chunks = load_chunks(&ctx.chunks_path())?;
    let total_batches = chunks.len().div_ceil(UPLOAD_BATCH_SIZE);
    progress(ProgressEvent::Init {
        total: Some(chunks.len() as u64),
        message: format!("Loading {} chunks for upload", chunks.len()),
    });

    let client = Client::new();
    let endpoint = providers.vector_store_url.clone();
    let mut uploaded = 0u64;

    for (batch_index, batch) in chunks.chunks(UPLOAD_BATCH_SIZE).enumerate() {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let points: Vec<serde_json::Value> = batch
            .iter()
            .map(|chunk| {
                json!({
                    "id": chunk.chunk_id,
                    "vector": chunk.dense_vector,
                    "sparse_vector": chunk.sparse_vector,
                    "payload": {
                        "item_key": chunk.item_key,
                        "title": chunk.title,
                        "filename": chunk.filename,
                        "chunk_index": chunk.chunk_index,
                        "text": chunk.text,
                    },
                })
            })
            .collect();

        let mut request = client.post(&endpoint).json(&json!({ "points": points }));
        if let Some(key) = &api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|source| StageError::Network {
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

        uploaded += batch.len() as u64;
        let current = (batch_index + 1) as u64;
        progress(ProgressEvent::Progress {
            level: None,
            current,
            total: Some(total_batches as u64),
            percent: Some(ProgressEvent::percent_of(current, total_batches as u64)),
            item: None,
            message: format!("Uploaded batch {current}/{total_batches}"),
        });
    }

    metrics::record_vectors_upserted(uploaded);
    info!(uploaded, "Vector upload finished");

    progress(ProgressEvent::Complete {
        message: format!("Upload complete: {uploaded} vectors"),
    });
    Ok(json!({ "uploaded": uploaded }))
}
