use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, Transcriber};
use crate::protocol::{HealthResponse, RequestCounters, TranscriptResponse};
use crate::store::UploadStore;
use crate::RelayError;

/// Multipart field name carrying the audio file
const AUDIO_FIELD: &str = "audio";

/// Request outcome counters, shared between the handler, `/healthz`, and the
/// periodic stats reporter.
#[derive(Debug)]
pub struct RelayStats {
    started_at: DateTime<Utc>,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }
}

impl RelayStats {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RequestCounters {
        RequestCounters {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    /// Staging area for incoming uploads
    pub store: UploadStore,
    /// Transcription capability; swappable behind the trait
    pub backend: Arc<dyn Transcriber>,
    /// Request counters
    pub stats: Arc<RelayStats>,
    /// Prebuilt client bundle to serve on non-API paths, when configured
    pub static_dir: Option<PathBuf>,
    /// Retain staged uploads after responding (debugging aid)
    pub keep_uploads: bool,
    /// Upper bound on accepted request bodies
    pub max_upload_bytes: usize,
}

/// Build the relay router.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/transcribe", post(transcribe))
        .route("/healthz", get(healthz));

    if let Some(ref dir) = state.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    let body_limit = state.max_upload_bytes;
    app.with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// `POST /transcribe`: stage the uploaded audio, run the backend, map the
/// outcome to JSON. One stored file and at most one backend invocation per
/// request; the stored file is deleted before responding unless retention is
/// enabled.
async fn transcribe(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<TranscriptResponse>, RelayError> {
    state.stats.record_request();

    // A request without a multipart body at all gets the same answer as one
    // missing the audio field.
    let mut multipart = multipart.map_err(|_| RelayError::MissingAudio)?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(AUDIO_FIELD) {
            let original_name = field.file_name().unwrap_or(AUDIO_FIELD).to_string();
            let bytes = field.bytes().await?;
            upload = Some((original_name, bytes));
            break;
        }
    }
    let (original_name, bytes) = upload.ok_or(RelayError::MissingAudio)?;

    let stored = state.store.save(&original_name, &bytes).await?;
    debug!(
        "Transcribing {} ({} bytes, from {:?})",
        stored.file_name(),
        bytes.len(),
        original_name
    );

    let result = state.backend.transcribe(stored.path()).await;

    if !state.keep_uploads {
        if let Err(e) = stored.remove().await {
            warn!("Failed to remove upload {}: {}", stored.file_name(), e);
        }
    }

    match result {
        Ok(raw) => {
            state.stats.record_success();
            Ok(Json(TranscriptResponse::from_raw(&raw)))
        }
        Err(e @ BackendError::TimedOut { .. }) => {
            state.stats.record_timeout();
            Err(e.into())
        }
        Err(e) => {
            state.stats.record_failure();
            Err(e.into())
        }
    }
}

/// `GET /healthz`: liveness plus request counters.
async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        started_at: state.stats.started_at(),
        requests: state.stats.snapshot(),
    })
}

/// Spawn the periodic stats reporter. Runs until a shutdown signal arrives.
pub fn spawn_stats_reporter(
    stats: Arc<RelayStats>,
    report_interval: Duration,
    shutdown_tx: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut interval = interval(report_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = stats.snapshot();
                    if snapshot.total > 0 {
                        info!("Service stats: {}", snapshot);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!("Stats reporter ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum_test::multipart::{MultipartForm, Part};
    use axum_test::TestServer;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    /// Scripted backend standing in for the external process
    enum MockTranscriber {
        Succeed(String),
        Fail(String),
        TimeOut,
        Break,
    }

    #[async_trait]
    impl Transcriber for MockTranscriber {
        async fn transcribe(&self, _audio: &Path) -> Result<String, BackendError> {
            match self {
                MockTranscriber::Succeed(text) => Ok(text.clone()),
                MockTranscriber::Fail(details) => Err(BackendError::Failed {
                    status: "exit status: 1".to_string(),
                    details: details.clone(),
                }),
                MockTranscriber::TimeOut => Err(BackendError::TimedOut {
                    limit: Duration::from_secs(30),
                }),
                MockTranscriber::Break => {
                    Err(BackendError::Io(std::io::Error::other("pipes fell over")))
                }
            }
        }
    }

    fn test_server(backend: MockTranscriber, keep_uploads: bool) -> (TempDir, TestServer, AppState) {
        let temp_dir = TempDir::new().unwrap();
        let state = AppState {
            store: UploadStore::new(temp_dir.path()),
            backend: Arc::new(backend),
            stats: Arc::new(RelayStats::default()),
            static_dir: None,
            keep_uploads,
            max_upload_bytes: 1024 * 1024,
        };
        let server = TestServer::new(router(state.clone())).unwrap();
        (temp_dir, server, state)
    }

    fn audio_form(bytes: &[u8], file_name: &str) -> MultipartForm {
        MultipartForm::new().add_part(
            AUDIO_FIELD,
            Part::bytes(bytes.to_vec())
                .file_name(file_name)
                .mime_type("audio/wav"),
        )
    }

    async fn upload_count(dir: &TempDir) -> usize {
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_missing_audio_field_is_400() {
        let (_dir, server, _state) = test_server(MockTranscriber::Succeed(String::new()), false);

        let response = server
            .post("/transcribe")
            .multipart(MultipartForm::new().add_text("note", "not audio"))
            .await;

        response.assert_status(axum::http::StatusCode::BAD_REQUEST);
        response.assert_json(&json!({ "error": "No audio file provided" }));
    }

    #[tokio::test]
    async fn test_non_multipart_request_is_400() {
        let (_dir, server, _state) = test_server(MockTranscriber::Succeed(String::new()), false);

        let response = server.post("/transcribe").await;

        response.assert_status(axum::http::StatusCode::BAD_REQUEST);
        response.assert_json(&json!({ "error": "No audio file provided" }));
    }

    #[tokio::test]
    async fn test_successful_transcription() {
        let (dir, server, state) = test_server(
            MockTranscriber::Succeed("  hello world \n".to_string()),
            false,
        );

        let response = server
            .post("/transcribe")
            .multipart(audio_form(b"RIFF....WAVE", "clip.wav"))
            .await;

        response.assert_status_ok();
        response.assert_json(&json!({ "transcript": "hello world" }));

        // Upload deleted once the response is mapped.
        assert_eq!(upload_count(&dir).await, 0);

        let counters = state.stats.snapshot();
        assert_eq!(counters.total, 1);
        assert_eq!(counters.succeeded, 1);
    }

    #[tokio::test]
    async fn test_failed_transcription_surfaces_stderr() {
        let (_dir, server, state) = test_server(MockTranscriber::Fail("bad audio".to_string()), false);

        let response = server
            .post("/transcribe")
            .multipart(audio_form(b"garbage", "clip.mp3"))
            .await;

        response.assert_status(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        response.assert_json(&json!({ "error": "Transcription failed", "details": "bad audio" }));
        assert_eq!(state.stats.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_timed_out_transcription_is_504() {
        let (_dir, server, state) = test_server(MockTranscriber::TimeOut, false);

        let response = server
            .post("/transcribe")
            .multipart(audio_form(b"bytes", "clip.wav"))
            .await;

        response.assert_status(axum::http::StatusCode::GATEWAY_TIMEOUT);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "Transcription timed out");
        assert_eq!(state.stats.snapshot().timed_out, 1);
    }

    #[tokio::test]
    async fn test_internal_fault_never_leaks_detail() {
        let (_dir, server, _state) = test_server(MockTranscriber::Break, false);

        let response = server
            .post("/transcribe")
            .multipart(audio_form(b"bytes", "clip.wav"))
            .await;

        response.assert_status(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        response.assert_json(&json!({ "error": "Something went wrong!" }));
    }

    #[tokio::test]
    async fn test_keep_uploads_retains_stored_file() {
        let (dir, server, _state) =
            test_server(MockTranscriber::Succeed("text".to_string()), true);

        server
            .post("/transcribe")
            .multipart(audio_form(b"RIFF", "take1.webm"))
            .await
            .assert_status_ok();

        assert_eq!(upload_count(&dir).await, 1);

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        let name = entry.file_name().into_string().unwrap();
        assert!(name.starts_with("audio-"), "unexpected name: {}", name);
        assert!(name.ends_with(".webm"), "unexpected name: {}", name);
    }

    #[tokio::test]
    async fn test_healthz_reports_counters() {
        let (_dir, server, _state) =
            test_server(MockTranscriber::Succeed("text".to_string()), false);

        server
            .post("/transcribe")
            .multipart(audio_form(b"RIFF", "clip.wav"))
            .await
            .assert_status_ok();

        let response = server.get("/healthz").await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "ok");
        assert!(body["started_at"].is_string());
        assert_eq!(
            body["requests"],
            json!({ "total": 1, "succeeded": 1, "failed": 0, "timed_out": 0 })
        );
    }

    #[tokio::test]
    async fn test_static_fallback_serves_client_bundle() {
        let bundle = TempDir::new().unwrap();
        tokio::fs::write(bundle.path().join("index.html"), "<html>relay</html>")
            .await
            .unwrap();

        let uploads = TempDir::new().unwrap();
        let state = AppState {
            store: UploadStore::new(uploads.path()),
            backend: Arc::new(MockTranscriber::Succeed(String::new())),
            stats: Arc::new(RelayStats::default()),
            static_dir: Some(bundle.path().to_path_buf()),
            keep_uploads: false,
            max_upload_bytes: 1024,
        };
        let server = TestServer::new(router(state)).unwrap();

        let response = server.get("/index.html").await;
        response.assert_status_ok();
        response.assert_text("<html>relay</html>");
    }
}
