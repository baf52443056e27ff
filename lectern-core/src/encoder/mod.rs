mod probe;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::budget::EncodingParams;
use crate::config::EncoderSection;

pub use probe::{FfprobeProbe, MediaProbe, ProbeError, ProbeResult};

/// Keep only the tail of the encoder's stderr in errors and logs.
const STDERR_EXCERPT_LINES: usize = 12;
const STDERR_EXCERPT_BYTES: usize = 4 * 1024;

pub type EncodeResult<T> = Result<T, EncodeError>;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder exited with status {exit_code:?}: {stderr_excerpt}")]
    Failed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("encode cancelled")]
    Cancelled,
}

/// External encoding process. Runs to completion or is terminated when
/// `cancel` fires.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        input: &Path,
        params: &EncodingParams,
        output: &Path,
        cancel: &CancellationToken,
    ) -> EncodeResult<()>;
}

#[derive(Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
    video_codec: String,
    audio_codec: String,
    preset: String,
}

impl fmt::Debug for FfmpegEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfmpegEncoder")
            .field("program", &self.program)
            .field("video_codec", &self.video_codec)
            .finish()
    }
}

impl FfmpegEncoder {
    pub fn new(config: &EncoderSection) -> Self {
        Self {
            program: PathBuf::from(&config.ffmpeg_path),
            video_codec: config.video_codec.clone(),
            audio_codec: config.audio_codec.clone(),
            preset: config.preset.clone(),
        }
    }

    pub fn build_args(&self, input: &Path, params: &EncodingParams, output: &Path) -> Vec<String> {
        let video = params.video_bitrate_bps().to_string();
        let bufsize = params.video_bitrate_bps().saturating_mul(2).to_string();
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
        ];
        if params.scale() < 1.0 {
            let scale = params.scale();
            args.push("-vf".to_string());
            args.push(format!(
                "scale=trunc(iw*{scale:.4}/2)*2:trunc(ih*{scale:.4}/2)*2"
            ));
        }
        args.extend([
            "-c:v".to_string(),
            self.video_codec.clone(),
            "-preset".to_string(),
            self.preset.clone(),
            "-b:v".to_string(),
            video.clone(),
            "-maxrate".to_string(),
            video,
            "-bufsize".to_string(),
            bufsize,
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-b:a".to_string(),
            params.audio_bitrate_bps().to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        input: &Path,
        params: &EncodingParams,
        output: &Path,
        cancel: &CancellationToken,
    ) -> EncodeResult<()> {
        let args = self.build_args(input, params, output);
        debug!(
            program = %self.program.display(),
            input = %input.display(),
            output = %output.display(),
            scale = params.scale(),
            video_bps = params.video_bitrate_bps(),
            "spawning encoder"
        );
        let mut command = Command::new(&self.program);
        command
            .kill_on_drop(true)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let child = command.spawn().map_err(|source| EncodeError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        // Dropping the wait future drops the child, and kill_on_drop terminates it.
        let waited = tokio::select! {
            output = child.wait_with_output() => output,
            _ = cancel.cancelled() => {
                warn!(input = %input.display(), "encoder terminated by cancellation");
                return Err(EncodeError::Cancelled);
            }
        };
        let output = waited.map_err(|source| EncodeError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        if output.status.success() {
            return Ok(());
        }
        Err(EncodeError::Failed {
            exit_code: output.status.code(),
            stderr_excerpt: stderr_excerpt(&String::from_utf8_lossy(&output.stderr)),
        })
    }
}

pub(crate) fn stderr_excerpt(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_EXCERPT_LINES);
    let mut excerpt = lines[start..].join("; ");
    if excerpt.len() > STDERR_EXCERPT_BYTES {
        let mut cut = excerpt.len() - STDERR_EXCERPT_BYTES;
        while !excerpt.is_char_boundary(cut) {
            cut += 1;
        }
        excerpt = excerpt[cut..].to_string();
    }
    excerpt
}
