use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LecternConfig {
    pub paths: PathsSection,
    pub budget: BudgetSection,
    pub retry: RetrySection,
    pub session: SessionSection,
    pub download: DownloadSection,
    pub encoder: EncoderSection,
    pub verify: VerifySection,
    pub pipeline: PipelineSection,
}

impl LecternConfig {
    /// Rejects values that would make the budget or retry arithmetic meaningless.
    pub fn validate(&self) -> Result<()> {
        let budget = &self.budget;
        if budget.target_bytes == 0 {
            return Err(ConfigError::invalid("budget.target_bytes", "must be > 0"));
        }
        if budget.audio_bitrate_bps == 0 {
            return Err(ConfigError::invalid(
                "budget.audio_bitrate_bps",
                "must be > 0",
            ));
        }
        if !(budget.min_resolution_scale > 0.0 && budget.min_resolution_scale <= 1.0) {
            return Err(ConfigError::invalid(
                "budget.min_resolution_scale",
                format!("{} is outside (0, 1]", budget.min_resolution_scale),
            ));
        }
        if !(budget.lower_tolerance > 0.0 && budget.lower_tolerance < 1.0) {
            return Err(ConfigError::invalid(
                "budget.lower_tolerance",
                format!("{} is outside (0, 1)", budget.lower_tolerance),
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be > 0"));
        }
        if !(retry.shrink_factor > 0.0 && retry.shrink_factor < 1.0) {
            return Err(ConfigError::invalid(
                "retry.shrink_factor",
                format!("{} is outside (0, 1)", retry.shrink_factor),
            ));
        }
        if retry.growth_factor.is_nan() || retry.growth_factor <= 1.0 {
            return Err(ConfigError::invalid(
                "retry.growth_factor",
                format!("{} must be greater than 1", retry.growth_factor),
            ));
        }
        if !(retry.scale_step > 0.0 && retry.scale_step < 1.0) {
            return Err(ConfigError::invalid(
                "retry.scale_step",
                format!("{} is outside (0, 1)", retry.scale_step),
            ));
        }

        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::invalid("pipeline.concurrency", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub work_dir: String,
    pub logs_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            work_dir: "lectures".to_string(),
            logs_dir: "lectures/logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub target_bytes: u64,
    pub audio_bitrate_bps: u64,
    pub min_video_bitrate_bps: u64,
    pub min_resolution_scale: f64,
    pub lower_tolerance: f64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            target_bytes: 200_000_000,
            audio_bitrate_bps: 128_000,
            min_video_bitrate_bps: 150_000,
            min_resolution_scale: 0.25,
            lower_tolerance: 0.80,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub shrink_factor: f64,
    pub growth_factor: f64,
    pub scale_step: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            shrink_factor: 0.85,
            growth_factor: 1.10,
            scale_step: 0.125,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub max_retries: u32,
    pub retry_delay_seconds: [u32; 2],
    pub url_ttl_seconds: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_seconds: [1, 5],
            url_ttl_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    pub max_retries: u32,
    pub retry_delay_seconds: [u32; 2],
    pub resume_enabled: bool,
    pub user_agent: String,
    pub input_extension: String,
    pub connect_timeout_seconds: u64,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_seconds: [2, 30],
            resume_enabled: true,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                .to_string(),
            input_extension: "mp4".to_string(),
            connect_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    pub output_extension: String,
    pub probe_timeout_seconds: u64,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            preset: "medium".to_string(),
            output_extension: "mp4".to_string(),
            probe_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifySection {
    pub duration_tolerance_percent: u32,
}

impl Default for VerifySection {
    fn default() -> Self {
        Self {
            duration_tolerance_percent: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub concurrency: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self { concurrency: 2 }
    }
}

pub fn load_lectern_config<P: AsRef<Path>>(path: P) -> Result<LecternConfig> {
    let config: LecternConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

pub(crate) fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
