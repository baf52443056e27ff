//! Size budget calculator.
//!
//! Maps a source duration and a byte cap to the first set of encoder
//! parameters. The audio bitrate is a hard constraint: when the remaining
//! video budget falls below the configured floor, resolution is reduced
//! instead, down to the minimum scale. The video floor is expressed at full
//! resolution and shrinks with pixel count (`floor(s) = Vmin * s^2`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::BudgetSection;

pub type BudgetResult<T> = Result<T, BudgetError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetError {
    #[error("invalid media duration: {duration}s")]
    InvalidDuration { duration: f64 },
    #[error("target of {target_bytes} bytes cannot hold the minimum stream of {minimum_bytes} bytes")]
    InsufficientBudget {
        target_bytes: u64,
        minimum_bytes: u64,
    },
    #[error("invalid encoding parameters: {0}")]
    InvalidParams(String),
}

/// Limits the calculator and the retry controller both work within.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetLimits {
    pub target_bytes: u64,
    pub audio_bitrate_bps: u64,
    pub min_video_bitrate_bps: u64,
    pub min_resolution_scale: f64,
}

impl BudgetLimits {
    /// Lowest video bitrate tolerated at the given resolution scale.
    pub fn video_floor_at(&self, scale: f64) -> f64 {
        self.min_video_bitrate_bps as f64 * scale * scale
    }

    /// Size of a stream running at the video floor and minimum scale.
    pub fn minimum_stream_bytes(&self, duration: f64) -> u64 {
        let bits = (self.audio_bitrate_bps as f64
            + self.video_floor_at(self.min_resolution_scale))
            * duration;
        (bits / 8.0).ceil() as u64
    }
}

impl From<&BudgetSection> for BudgetLimits {
    fn from(section: &BudgetSection) -> Self {
        Self {
            target_bytes: section.target_bytes,
            audio_bitrate_bps: section.audio_bitrate_bps,
            min_video_bitrate_bps: section.min_video_bitrate_bps,
            min_resolution_scale: section.min_resolution_scale,
        }
    }
}

/// Immutable encoder target. Built only by the calculator and the retry
/// controller, which validate the ranges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ParamsRecord")]
pub struct EncodingParams {
    scale: f64,
    video_bitrate_bps: u64,
    audio_bitrate_bps: u64,
}

#[derive(Deserialize)]
struct ParamsRecord {
    scale: f64,
    video_bitrate_bps: u64,
    audio_bitrate_bps: u64,
}

impl TryFrom<ParamsRecord> for EncodingParams {
    type Error = BudgetError;

    fn try_from(record: ParamsRecord) -> Result<Self, Self::Error> {
        EncodingParams::new(
            record.scale,
            record.video_bitrate_bps,
            record.audio_bitrate_bps,
        )
    }
}

impl EncodingParams {
    pub(crate) fn new(
        scale: f64,
        video_bitrate_bps: u64,
        audio_bitrate_bps: u64,
    ) -> BudgetResult<Self> {
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(BudgetError::InvalidParams(format!(
                "scale {scale} is outside (0, 1]"
            )));
        }
        if audio_bitrate_bps == 0 {
            return Err(BudgetError::InvalidParams(
                "audio bitrate must be positive".into(),
            ));
        }
        Ok(Self {
            scale,
            video_bitrate_bps,
            audio_bitrate_bps,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn video_bitrate_bps(&self) -> u64 {
        self.video_bitrate_bps
    }

    pub fn audio_bitrate_bps(&self) -> u64 {
        self.audio_bitrate_bps
    }

    pub fn total_bitrate_bps(&self) -> u64 {
        self.video_bitrate_bps + self.audio_bitrate_bps
    }
}

/// Computes the initial parameters for a source of `duration` seconds.
pub fn calculate(duration: f64, limits: &BudgetLimits) -> BudgetResult<EncodingParams> {
    if !duration.is_finite() || duration <= 0.0 {
        return Err(BudgetError::InvalidDuration { duration });
    }

    let total_bits = limits.target_bytes as f64 * 8.0;
    let audio_bits = limits.audio_bitrate_bps as f64 * duration;
    if total_bits <= audio_bits {
        return Err(BudgetError::InsufficientBudget {
            target_bytes: limits.target_bytes,
            minimum_bytes: (audio_bits / 8.0).ceil() as u64,
        });
    }

    let video_target = (total_bits - audio_bits) / duration;
    let video_min = limits.min_video_bitrate_bps as f64;
    if video_target >= video_min {
        return EncodingParams::new(1.0, video_target.floor() as u64, limits.audio_bitrate_bps);
    }

    if video_target < limits.video_floor_at(limits.min_resolution_scale) {
        return Err(BudgetError::InsufficientBudget {
            target_bytes: limits.target_bytes,
            minimum_bytes: limits.minimum_stream_bytes(duration),
        });
    }

    // Same bits per pixel as the floor at full resolution.
    let scale = (video_target / video_min)
        .sqrt()
        .clamp(limits.min_resolution_scale, 1.0);
    EncodingParams::new(scale, video_target.floor() as u64, limits.audio_bitrate_bps)
}
