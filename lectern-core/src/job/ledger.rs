use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::budget::EncodingParams;

use super::types::FailureReason;

/// Terminal record written next to a verified output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneMarker {
    pub lecture_id: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub params: EncodingParams,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl DoneMarker {
    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        let payload = serde_json::to_vec_pretty(self)?;
        let staging = path.with_extension("done.tmp");
        fs::write(&staging, payload).await?;
        fs::rename(&staging, path).await
    }

    pub async fn load(path: &Path) -> Option<Self> {
        let bytes = fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(marker) => Some(marker),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable done marker");
                None
            }
        }
    }

    /// A marker counts only when it was written for `lecture_id`, still
    /// describes the file on disk, and that file fits the current cap.
    pub async fn confirms(
        path: &Path,
        lecture_id: &str,
        output: &Path,
        cap_bytes: u64,
    ) -> Option<Self> {
        let marker = Self::load(path).await?;
        if marker.lecture_id != lecture_id {
            warn!(
                path = %path.display(),
                lecture_id,
                recorded = %marker.lecture_id,
                "done marker belongs to another lecture"
            );
            return None;
        }
        let size = fs::metadata(output).await.ok()?.len();
        if size != marker.size_bytes || size > cap_bytes {
            debug!(
                output = %output.display(),
                size,
                recorded = marker.size_bytes,
                cap_bytes,
                "done marker does not match output"
            );
            return None;
        }
        Some(marker)
    }
}

pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 256 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Records `lecture_id` as the owner of a job directory, or returns the id
/// of the lecture that already owns it.
pub async fn claim_workdir(owner: &Path, lecture_id: &str) -> std::io::Result<Option<String>> {
    match fs::read_to_string(owner).await {
        Ok(recorded) if recorded.trim() == lecture_id => Ok(None),
        Ok(recorded) => Ok(Some(recorded.trim().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            fs::write(owner, format!("{lecture_id}\n")).await?;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Append-only `failures.log` under the logs directory.
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            path: logs_dir.join("failures.log"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, lecture_id: &str, reason: &FailureReason) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %err, "failed to create logs directory");
                return;
            }
        }
        let line = format!("{} [{}] {}\n", Utc::now().to_rfc3339(), lecture_id, reason);
        let appended = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        };
        if let Err(err) = appended.await {
            warn!(path = %self.path.display(), error = %err, "failed to append failure log");
        }
    }
}
