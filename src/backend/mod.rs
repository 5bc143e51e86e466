use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Errors produced while running the external transcription process
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The configured script path does not exist (startup validation)
    #[error("Transcription script not found: {path}")]
    ScriptNotFound { path: PathBuf },

    /// The process exited nonzero; `details` is its trimmed stderr
    #[error("Transcription process exited with {status}")]
    Failed { status: String, details: String },

    /// The process outlived the configured time limit and was killed
    #[error("Transcription process exceeded the {limit:?} time limit")]
    TimedOut { limit: Duration },

    /// The process could not be spawned or its pipes could not be read
    #[error("Failed to run transcription process: {0}")]
    Io(#[from] std::io::Error),
}

/// A transcription capability: turn an audio file on disk into text.
///
/// The relay only ever talks to this trait, so the subprocess implementation
/// can be swapped for an in-process model or a remote API without touching
/// the request-handling contract.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<String, BackendError>;
}

/// Configuration for the script-based transcription backend
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Interpreter used to run the script (e.g. "python3")
    pub command: String,
    /// Path to the transcription script
    pub script: PathBuf,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the process
    pub env_vars: Vec<(String, String)>,
    /// Hard limit on process runtime
    pub timeout: Duration,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            script: PathBuf::from("python/transcribe.py"),
            working_dir: None,
            env_vars: Vec::new(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Transcription backend that shells out to an external script.
///
/// The script receives the audio file path as its sole argument and speaks
/// back over the classic Unix contract: transcript on stdout, diagnostics on
/// stderr, status via exit code.
pub struct ScriptTranscriber {
    config: ScriptConfig,
}

impl ScriptTranscriber {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }

    /// Check that the configured script exists. Called once at startup so a
    /// misconfigured path fails the boot instead of the first request.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.config.script.is_file() {
            Ok(())
        } else {
            Err(BackendError::ScriptNotFound {
                path: self.config.script.clone(),
            })
        }
    }
}

#[async_trait]
impl Transcriber for ScriptTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<String, BackendError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.arg(&self.config.script).arg(audio);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        // kill_on_drop covers both the timeout path and a caller dropping the
        // request mid-flight; no child outlives its request.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        debug!(
            "Spawned transcription process (pid {:?}) for {}",
            child.id(),
            audio.display()
        );

        let output = match timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Transcription of {} exceeded {:?}, killing process",
                    audio.display(),
                    self.config.timeout
                );
                return Err(BackendError::TimedOut {
                    limit: self.config.timeout,
                });
            }
        };

        if !output.status.success() {
            let details = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                "Transcription process exited with {} for {}: {}",
                output.status,
                audio.display(),
                details
            );
            return Err(BackendError::Failed {
                status: output.status.to_string(),
                details,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
