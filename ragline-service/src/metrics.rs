//! Prometheus metrics for pipeline throughput and latency.
//!
//! Counters track volume per stage/provider; histograms track stage and
//! provider latency. Exposed at `/metrics` via the Prometheus exporter handle.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests).
pub fn install() -> Option<PrometheusHandle> {
    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed; metrics disabled");
            return None;
        }
    };

    describe_counter!(
        "ragline_documents_processed_total",
        "Total documents processed by the extraction engine, by OCR provider"
    );
    describe_counter!(
        "ragline_chunks_generated_total",
        "Total chunks generated by the chunking stage"
    );
    describe_counter!(
        "ragline_embeddings_generated_total",
        "Total embeddings generated, by kind (dense/sparse)"
    );
    describe_counter!(
        "ragline_vectors_upserted_total",
        "Total vectors upserted to the vector store"
    );
    describe_counter!(
        "ragline_extraction_errors_total",
        "Per-item extraction failures, by error type"
    );
    describe_counter!(
        "ragline_task_retries_total",
        "Queued task retries, by stage"
    );
    describe_histogram!(
        "ragline_stage_duration_seconds",
        "Wall-clock duration of a stage run, by stage"
    );

    Some(handle)
}

pub fn record_stage_duration(stage: &'static str, seconds: f64) {
    histogram!("ragline_stage_duration_seconds", "stage" => stage).record(seconds);
}

pub fn record_documents_processed(provider: String, count: u64) {
    counter!("ragline_documents_processed_total", "provider" => provider).increment(count);
}

pub fn record_extraction_error(error_type: &'static str) {
    counter!("ragline_extraction_errors_total", "error_type" => error_type).increment(1);
}

pub fn record_chunks_generated(count: u64) {
    counter!("ragline_chunks_generated_total").increment(count);
}

pub fn record_embeddings_generated(kind: &'static str, count: u64) {
    counter!("ragline_embeddings_generated_total", "kind" => kind).increment(count);
}

pub fn record_vectors_upserted(count: u64) {
    counter!("ragline_vectors_upserted_total").increment(count);
}

pub fn record_task_retry(stage: &'static str) {
    counter!("ragline_task_retries_total", "stage" => stage).increment(1);
}
