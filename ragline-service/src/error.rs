use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Extraction failed")]
    Extraction(#[from] ExtractionError),

    #[error("Stage execution failed")]
    Stage(#[from] StageError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors raised while extracting text from source documents.
///
/// The retry wrapper only re-attempts errors classified as transient; the
/// provider chain treats everything else as a signal to move on (or give up).
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Missing credential: {name}")]
    MissingCredential { name: String },

    #[error("Network error calling {provider}")]
    Network {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} request failed (status {status}): {message}")]
    ProviderStatus {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("{provider} returned an unusable response: {message}")]
    MalformedResponse {
        provider: &'static str,
        message: String,
    },

    #[error("Source manifest not readable: {path}")]
    ManifestRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest format: expected an array or an object with an \"items\" key")]
    ManifestFormat,

    #[error("Failed to open PDF: {message}")]
    Pdf { message: String },

    #[error(
        "Unable to extract text: remote OCR and vision providers unavailable or failed, and the \
         document has no usable text layer"
    )]
    AllProvidersFailed,

    #[error("Extraction failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Journal writer is no longer running")]
    JournalClosed,

    #[error("Extraction cancelled")]
    Cancelled,

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed")]
    Serialization(#[from] serde_json::Error),
}

impl ExtractionError {
    /// Whether the retry wrapper should re-attempt after this error.
    ///
    /// Missing credentials and malformed responses never improve on retry;
    /// network failures and throttling/server-side statuses usually do.
    pub fn is_transient(&self) -> bool {
        match self {
            ExtractionError::Network { .. } => true,
            ExtractionError::ProviderStatus { status, .. } => {
                *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

/// Errors raised by stage execution (any pipeline stage, either transport).
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Stage input missing: {path}")]
    MissingInput { path: String },

    #[error("Network error calling {endpoint}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} request failed (status {status}): {message}")]
    Endpoint {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Missing credential: {name}")]
    MissingCredential { name: String },

    #[error("{what} is not configured")]
    Unconfigured { what: &'static str },

    #[error("Stage cancelled")]
    Cancelled,

    #[error("Session store unavailable")]
    Database(#[from] DatabaseError),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed")]
    Serialization(#[from] serde_json::Error),
}

/// Database errors (task queue and session store)
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),
}

/// API error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::SessionNotFound { .. } | ServiceError::TaskNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::SessionNotFound { .. } => "session_not_found",
            ServiceError::TaskNotFound { .. } => "task_not_found",
            ServiceError::Extraction(_) => "extraction_error",
            ServiceError::Stage(_) => "stage_error",
            ServiceError::Database(_) => "database_error",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: self.to_string(),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
