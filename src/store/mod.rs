use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix for every staged upload; the retention sweep only touches files
/// carrying it, so unrelated files in the directory are left alone.
const UPLOAD_PREFIX: &str = "audio-";

/// Staging area for incoming audio payloads.
///
/// Files are named `audio-<epoch-millis>-<token><ext>`. The timestamp keeps
/// names sortable by arrival; the random token keeps concurrent uploads in the
/// same millisecond from colliding. The directory is created lazily on first
/// write, parents included.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

/// Handle to a single staged upload
#[derive(Debug)]
pub struct StoredUpload {
    path: PathBuf,
}

impl StoredUpload {
    /// Path handed to the transcription backend
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component of the stored path
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Delete the staged file
    pub async fn remove(&self) -> Result<()> {
        tokio::fs::remove_file(&self.path)
            .await
            .with_context(|| format!("Failed to remove upload {}", self.path.display()))
    }
}

impl UploadStore {
    /// Create a store rooted at the given directory. Nothing is touched on
    /// disk until the first `save`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write an upload to a fresh file and return a handle to it.
    ///
    /// Only the extension of the client-supplied name is kept; everything
    /// else about the stored name is generated server-side.
    pub async fn save(&self, original_name: &str, bytes: &[u8]) -> Result<StoredUpload> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create upload directory {}", self.root.display()))?;

        let path = self.root.join(unique_file_name(original_name));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write upload {}", path.display()))?;

        debug!("Stored upload {} ({} bytes)", path.display(), bytes.len());
        Ok(StoredUpload { path })
    }

    /// Delete staged uploads older than `max_age`. Returns the number of
    /// files removed. Missing directory means nothing has been staged yet.
    pub async fn sweep(&self, max_age: Duration) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read upload directory {}", self.root.display())
                })
            }
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(UPLOAD_PREFIX) {
                continue;
            }

            let Ok(metadata) = entry.metadata().await else { continue };
            if !metadata.is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok());
            if age.map_or(false, |age| age >= max_age) {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        debug!("Swept stale upload {}", entry.path().display());
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to sweep {}: {}", entry.path().display(), e),
                }
            }
        }

        Ok(removed)
    }
}

/// Build a stored file name from the arrival time, a random token, and the
/// extension recovered from the client-supplied name.
fn unique_file_name(original_name: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let token = Uuid::new_v4().simple();
    format!(
        "{}{}-{}{}",
        UPLOAD_PREFIX,
        millis,
        token,
        sanitized_extension(original_name)
    )
}

/// Extract a usable `.ext` from the client filename. Anything non-alphanumeric
/// or unreasonably long is dropped rather than trusted.
fn sanitized_extension(original_name: &str) -> String {
    match Path::new(original_name).extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!(".{}", ext)
        }
        _ => String::new(),
    }
}

/// Spawn the periodic retention sweep. Runs until a shutdown signal arrives.
pub fn spawn_sweeper(
    store: UploadStore,
    sweep_interval: Duration,
    max_age: Duration,
    shutdown_tx: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut interval = interval(sweep_interval);
        // First tick fires immediately; skip it.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match store.sweep(max_age).await {
                        Ok(0) => {}
                        Ok(removed) => info!("Retention sweep removed {} stale upload(s)", removed),
                        Err(e) => warn!("Retention sweep failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!("Retention sweeper ended");
    })
}
