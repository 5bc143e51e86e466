//! Transcribe Relay - an HTTP relay in front of an external transcription process
//!
//! This crate provides a small, standalone HTTP service that turns audio
//! uploads into transcripts by delegating the actual speech-to-text work to
//! an external executable. It features:
//!
//! - A single `POST /transcribe` endpoint accepting a multipart audio upload
//! - Collision-free staging of uploads on the local filesystem
//! - Subprocess lifecycle management with stdout/stderr capture, exit-code
//!   mapping, and a hard timeout
//! - A swappable `Transcriber` trait so the subprocess backend can be replaced
//!   without touching the HTTP contract
//! - Upload retention sweeping and periodic request statistics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use transcribe_relay::{
//!     backend::{ScriptConfig, ScriptTranscriber},
//!     server::{router, AppState, RelayStats},
//!     store::UploadStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = ScriptTranscriber::new(ScriptConfig::default());
//!     backend.validate()?;
//!
//!     let app = router(AppState {
//!         store: UploadStore::new("uploads"),
//!         backend: Arc::new(backend),
//!         stats: Arc::new(RelayStats::default()),
//!         static_dir: None,
//!         keep_uploads: false,
//!         max_upload_bytes: 25 * 1024 * 1024,
//!     });
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:5001").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod protocol;
pub mod server;
pub mod store;

// Re-export commonly used types for convenience
pub use backend::{BackendError, ScriptConfig, ScriptTranscriber, Transcriber};
pub use protocol::{ErrorResponse, HealthResponse, RequestCounters, TranscriptResponse};
pub use server::{router, AppState, RelayStats};
pub use store::UploadStore;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors that can occur while handling a transcription request
#[derive(Error, Debug)]
pub enum RelayError {
    /// Request carried no audio field (or no multipart body at all)
    #[error("No audio file provided")]
    MissingAudio,

    /// Multipart body could not be parsed
    #[error("Invalid multipart payload: {0}")]
    InvalidMultipart(#[from] axum::extract::multipart::MultipartError),

    /// Transcription backend error
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::MissingAudio | RelayError::InvalidMultipart(_) => StatusCode::BAD_REQUEST,
            RelayError::Backend(BackendError::TimedOut { .. }) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Backend(_) | RelayError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// User-safe response body. Subprocess stderr is surfaced verbatim;
    /// every other internal detail stays in the server-side logs.
    fn body(&self) -> ErrorResponse {
        match self {
            RelayError::MissingAudio => ErrorResponse::new("No audio file provided"),
            RelayError::InvalidMultipart(_) => ErrorResponse::new("Invalid multipart payload"),
            RelayError::Backend(BackendError::Failed { details, .. }) => {
                ErrorResponse::with_details("Transcription failed", details.clone())
            }
            RelayError::Backend(BackendError::TimedOut { limit }) => ErrorResponse::with_details(
                "Transcription timed out",
                format!("process exceeded the {}s time limit", limit.as_secs()),
            ),
            RelayError::Backend(_) | RelayError::Other(_) => {
                ErrorResponse::new("Something went wrong!")
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match &self {
            RelayError::MissingAudio | RelayError::InvalidMultipart(_) => {
                tracing::debug!("Client error: {}", self);
            }
            RelayError::Backend(BackendError::Failed { .. })
            | RelayError::Backend(BackendError::TimedOut { .. }) => {
                tracing::warn!("Transcription error: {}", self);
            }
            RelayError::Backend(_) | RelayError::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
        }

        (self.status_code(), Json(self.body())).into_response()
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
