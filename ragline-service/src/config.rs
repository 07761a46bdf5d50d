//! Static configuration loaded at startup.
//! Settings here affect server binding or worker topology and require a
//! restart to change.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub providers: ProviderConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Service database and journals live under this directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Per-session upload directories (one subdirectory per session).
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

/// Extraction engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Item worker pool size. 1 means strict sequential processing.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Concurrent remote OCR calls, independent of the worker pool size.
    #[serde(default = "default_ocr_concurrent_calls")]
    pub ocr_concurrent_calls: usize,

    /// Retry attempts for transient OCR failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Exponential backoff base: wait `base^attempt` seconds between retries.
    #[serde(default = "default_backoff_base")]
    pub retry_backoff_base: f64,

    /// Wall-clock timeout for a tracked extraction subprocess, in seconds.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

impl ExtractionConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// External provider endpoints and credential environment variable names.
/// API keys themselves are resolved from the environment at call time.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_ocr_base_url")]
    pub ocr_base_url: String,

    #[serde(default = "default_ocr_model")]
    pub ocr_model: String,

    #[serde(default = "default_ocr_key_env")]
    pub ocr_api_key_env: String,

    #[serde(default = "default_ocr_timeout_secs")]
    pub ocr_timeout_secs: u64,

    #[serde(default = "default_vision_base_url")]
    pub vision_base_url: String,

    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_vision_key_env")]
    pub vision_api_key_env: String,

    /// Page cap for vision transcription of a single document.
    #[serde(default = "default_vision_max_pages")]
    pub vision_max_pages: usize,

    /// Render scale for page rasterization sent to the vision provider.
    #[serde(default = "default_vision_render_scale")]
    pub vision_render_scale: f32,

    #[serde(default = "default_embeddings_url")]
    pub embeddings_url: String,

    #[serde(default = "default_embeddings_model")]
    pub embeddings_model: String,

    #[serde(default = "default_embeddings_key_env")]
    pub embeddings_api_key_env: String,

    #[serde(default = "default_vector_store_url")]
    pub vector_store_url: String,

    #[serde(default = "default_vector_store_key_env")]
    pub vector_store_api_key_env: String,
}

impl ProviderConfig {
    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }
}

/// Queued-task transport configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Number of in-process queue workers pulling from the broker table.
    #[serde(default = "default_queue_workers")]
    pub workers: usize,

    /// Soft time limit: a graceful cancellation is requested past this point.
    #[serde(default = "default_soft_time_limit_secs")]
    pub soft_time_limit_secs: u64,

    /// Hard time limit: the task future is dropped past this point.
    #[serde(default = "default_hard_time_limit_secs")]
    pub hard_time_limit_secs: u64,

    /// Automatic retry attempts for failed tasks.
    #[serde(default = "default_task_max_retries")]
    pub max_retries: u32,

    /// Base delay before the first retry, in seconds. Doubles per attempt
    /// with randomized jitter, capped at `retry_backoff_max_secs`.
    #[serde(default = "default_retry_countdown_secs")]
    pub retry_countdown_secs: u64,

    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,

    /// Tasks claimed longer than this without completing are requeued
    /// (at-least-once redelivery after a worker crash).
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

impl QueueConfig {
    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.hard_time_limit_secs)
    }
}

impl StaticConfig {
    /// Load configuration from `config.toml` (optional) and `RAGLINE__`
    /// prefixed environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("RAGLINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.storage.upload_dir.join(session_id)
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join("ragline.db")
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            ocr_concurrent_calls: default_ocr_concurrent_calls(),
            max_retries: default_max_retries(),
            retry_backoff_base: default_backoff_base(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            ocr_base_url: default_ocr_base_url(),
            ocr_model: default_ocr_model(),
            ocr_api_key_env: default_ocr_key_env(),
            ocr_timeout_secs: default_ocr_timeout_secs(),
            vision_base_url: default_vision_base_url(),
            vision_model: default_vision_model(),
            vision_api_key_env: default_vision_key_env(),
            vision_max_pages: default_vision_max_pages(),
            vision_render_scale: default_vision_render_scale(),
            embeddings_url: default_embeddings_url(),
            embeddings_model: default_embeddings_model(),
            embeddings_api_key_env: default_embeddings_key_env(),
            vector_store_url: default_vector_store_url(),
            vector_store_api_key_env: default_vector_store_key_env(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_queue_workers(),
            soft_time_limit_secs: default_soft_time_limit_secs(),
            hard_time_limit_secs: default_hard_time_limit_secs(),
            max_retries: default_task_max_retries(),
            retry_countdown_secs: default_retry_countdown_secs(),
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

// ==================== Default Value Functions ====================

pub(crate) fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

pub(crate) fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
        upload_dir: default_upload_dir(),
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_workers() -> usize {
    1
}

fn default_ocr_concurrent_calls() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_stage_timeout_secs() -> u64 {
    1800
}

fn default_ocr_base_url() -> String {
    "https://api.mistral.ai".to_string()
}

fn default_ocr_model() -> String {
    "mistral-ocr-latest".to_string()
}

fn default_ocr_key_env() -> String {
    "MISTRAL_API_KEY".to_string()
}

fn default_ocr_timeout_secs() -> u64 {
    300
}

fn default_vision_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_vision_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_vision_max_pages() -> usize {
    10
}

fn default_vision_render_scale() -> f32 {
    2.0
}

fn default_embeddings_url() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}

fn default_embeddings_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_embeddings_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_vector_store_url() -> String {
    String::new()
}

fn default_vector_store_key_env() -> String {
    "VECTOR_STORE_API_KEY".to_string()
}

fn default_queue_workers() -> usize {
    2
}

fn default_soft_time_limit_secs() -> u64 {
    3600
}

fn default_hard_time_limit_secs() -> u64 {
    7200
}

fn default_task_max_retries() -> u32 {
    3
}

fn default_retry_countdown_secs() -> u64 {
    30
}

fn default_retry_backoff_max_secs() -> u64 {
    300
}

fn default_visibility_timeout_secs() -> u64 {
    7500
}
