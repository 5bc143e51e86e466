use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Successful transcription response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptResponse {
    /// Transcribed text, trimmed of leading/trailing whitespace
    pub transcript: String,
}

impl TranscriptResponse {
    /// Create a response from raw transcriber output, trimming whitespace
    pub fn from_raw(raw: &str) -> Self {
        Self {
            transcript: raw.trim().to_string(),
        }
    }
}

/// Error response body returned for every failed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short, user-safe error message
    pub error: String,
    /// Diagnostic detail, present only when safe to surface (e.g. subprocess stderr)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create an error response with no diagnostic detail
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    /// Create an error response carrying diagnostic detail
    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Liveness response with request counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "ok" when the service can respond at all
    pub status: String,
    /// When the service started
    pub started_at: DateTime<Utc>,
    /// Counters for requests handled since startup
    pub requests: RequestCounters,
}

/// Request outcome counters reported by `/healthz` and the stats logger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounters {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl std::fmt::Display for RequestCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={}, succeeded={}, failed={}, timed_out={}",
            self.total, self.succeeded, self.failed, self.timed_out
        )
    }
}
