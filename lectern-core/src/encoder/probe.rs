use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::EncoderSection;

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe command failed: {0}")]
    Command(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid ffprobe payload: {0}")]
    Parse(String),
    #[error("failed to probe {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("container reports no duration")]
    MissingDuration,
    #[error("probe cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for ProbeError {
    fn from(source: serde_json::Error) -> Self {
        ProbeError::Parse(source.to_string())
    }
}

/// Reads the playable duration of a media file, in seconds.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn duration(&self, path: &Path, cancel: &CancellationToken) -> ProbeResult<f64>;
}

#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
    timeout: Duration,
}

impl FfprobeProbe {
    pub fn new(config: &EncoderSection) -> Self {
        Self {
            program: PathBuf::from(&config.ffprobe_path),
            timeout: Duration::from_secs(config.probe_timeout_seconds.max(1)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn duration(&self, path: &Path, cancel: &CancellationToken) -> ProbeResult<f64> {
        let mut command = Command::new(&self.program);
        command
            .kill_on_drop(true)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg(path);
        let execution = timeout(self.timeout, command.output());
        let result = tokio::select! {
            result = execution => result,
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
        };
        match result {
            Ok(Ok(output)) if output.status.success() => parse_duration(&output.stdout),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(path = %path.display(), "ffprobe returned non-zero status: {stderr}");
                Err(ProbeError::Command(stderr.trim().to_string()))
            }
            Ok(Err(source)) => Err(ProbeError::Io {
                path: path.to_path_buf(),
                source,
            }),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

fn parse_duration(stdout: &[u8]) -> ProbeResult<f64> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;
    parsed
        .format
        .duration
        .as_deref()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or(ProbeError::MissingDuration)
}
