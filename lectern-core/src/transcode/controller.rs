//! Adaptive retry controller.
//!
//! Consumes one [`AttemptResult`] at a time and decides the next
//! [`EncodingParams`]. The audio bitrate of the initial parameters is carried
//! through every retry untouched.

use serde::Serialize;
use tracing::debug;

use crate::budget::{BudgetLimits, EncodingParams};
use crate::config::RetrySection;

use super::types::{AttemptOutcome, AttemptResult, SizeBand};

const SCALE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Computed,
    Attempted,
    Retrying,
    Success,
    ExhaustedFailed,
}

impl ControllerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerState::Success | ControllerState::ExhaustedFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustReason {
    /// `max_attempts` results recorded without a success.
    AttemptCeiling,
    /// Already at the minimum scale and video floor; nothing left to reduce.
    AtFloor,
    /// The encoder failed again after the one reduced-parameter retry.
    RepeatedEncodeFailure,
}

impl std::fmt::Display for ExhaustReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ExhaustReason::AttemptCeiling => "attempt ceiling reached",
            ExhaustReason::AtFloor => "no further reduction possible",
            ExhaustReason::RepeatedEncodeFailure => "encoder failed twice",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Retry(EncodingParams),
    /// The last attempt's output is final.
    Accept,
    Exhausted(ExhaustReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub shrink_factor: f64,
    pub growth_factor: f64,
    pub scale_step: f64,
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            shrink_factor: section.shrink_factor,
            growth_factor: section.growth_factor,
            scale_step: section.scale_step,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryController {
    limits: BudgetLimits,
    policy: RetryPolicy,
    band: SizeBand,
    state: ControllerState,
    current: EncodingParams,
    attempts: u32,
    encode_failure_retried: bool,
    /// Lowest video bitrate that has overshot so far. Undershoot growth
    /// stays strictly below it.
    overshoot_ceiling_bps: Option<u64>,
}

impl RetryController {
    pub fn new(
        initial: EncodingParams,
        limits: BudgetLimits,
        policy: RetryPolicy,
        band: SizeBand,
    ) -> Self {
        Self {
            limits,
            policy,
            band,
            state: ControllerState::Computed,
            current: initial,
            attempts: 0,
            encode_failure_retried: false,
            overshoot_ceiling_bps: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current(&self) -> EncodingParams {
        self.current
    }

    /// Parameters for the next encode, or `None` once terminal or at the
    /// attempt ceiling.
    pub fn begin_attempt(&mut self) -> Option<EncodingParams> {
        if self.state.is_terminal() || self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        self.state = ControllerState::Attempted;
        Some(self.current)
    }

    pub fn on_result(&mut self, result: &AttemptResult) -> Decision {
        let previous = result.params;
        let decision = match &result.outcome {
            AttemptOutcome::Success => Decision::Accept,
            AttemptOutcome::Undershoot => {
                let size = result.size_bytes.unwrap_or(0);
                match self.grow(previous, size) {
                    None => Decision::Accept,
                    Some(_) if self.at_ceiling() => Decision::Exhausted(ExhaustReason::AttemptCeiling),
                    Some(next) => Decision::Retry(next),
                }
            }
            _ if self.at_ceiling() => Decision::Exhausted(ExhaustReason::AttemptCeiling),
            AttemptOutcome::Overshoot => {
                self.overshoot_ceiling_bps = Some(
                    self.overshoot_ceiling_bps
                        .map_or(previous.video_bitrate_bps(), |ceiling| {
                            ceiling.min(previous.video_bitrate_bps())
                        }),
                );
                match self.shrink(previous) {
                    Some(next) => Decision::Retry(next),
                    None => Decision::Exhausted(ExhaustReason::AtFloor),
                }
            }
            AttemptOutcome::EncodeFailed { .. } => {
                if self.encode_failure_retried {
                    Decision::Exhausted(ExhaustReason::RepeatedEncodeFailure)
                } else {
                    self.encode_failure_retried = true;
                    match self.step_down_both(previous) {
                        Some(next) => Decision::Retry(next),
                        None => Decision::Exhausted(ExhaustReason::AtFloor),
                    }
                }
            }
        };

        self.state = match &decision {
            Decision::Retry(next) => {
                self.current = *next;
                ControllerState::Retrying
            }
            Decision::Accept => ControllerState::Success,
            Decision::Exhausted(_) => ControllerState::ExhaustedFailed,
        };
        debug!(
            attempt = result.index,
            outcome = result.outcome.label(),
            state = ?self.state,
            "retry controller transition"
        );
        decision
    }

    fn at_ceiling(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    fn at_min_scale(&self, scale: f64) -> bool {
        scale <= self.limits.min_resolution_scale + SCALE_EPSILON
    }

    fn floor_bps(&self, scale: f64) -> u64 {
        self.limits.video_floor_at(scale).ceil() as u64
    }

    fn stepped_scale(&self, scale: f64) -> f64 {
        (scale - self.policy.scale_step).max(self.limits.min_resolution_scale)
    }

    fn params(&self, scale: f64, video_bps: u64, previous: EncodingParams) -> Option<EncodingParams> {
        EncodingParams::new(scale, video_bps, previous.audio_bitrate_bps()).ok()
    }

    /// Bitrate first; resolution only once the bitrate would cross the floor
    /// at the current scale. Every result is strictly smaller in at least one
    /// dimension and larger in neither.
    fn shrink(&self, previous: EncodingParams) -> Option<EncodingParams> {
        let scale = previous.scale();
        let video = previous.video_bitrate_bps();
        let reduced = (video as f64 * self.policy.shrink_factor).floor() as u64;

        if reduced >= self.floor_bps(scale) && reduced < video {
            return self.params(scale, reduced, previous);
        }
        if !self.at_min_scale(scale) {
            let next_scale = self.stepped_scale(scale);
            let next_video = reduced.max(self.floor_bps(next_scale)).min(video);
            return self.params(next_scale, next_video, previous);
        }
        let floor = self.floor_bps(scale);
        if floor < video {
            return self.params(scale, floor, previous);
        }
        None
    }

    /// Grows the video bitrate while the projected size stays under the cap.
    /// `None` means there is no headroom left.
    fn grow(&self, previous: EncodingParams, size_bytes: u64) -> Option<EncodingParams> {
        let video = previous.video_bitrate_bps();
        let mut next = (video as f64 * self.policy.growth_factor).floor() as u64;

        if size_bytes > 0 {
            // Size scales with the total bitrate for a fixed duration.
            let total = previous.total_bitrate_bps() as f64;
            let audio = previous.audio_bitrate_bps() as f64;
            let limit = self.band.cap_bytes as f64 / size_bytes as f64 * total - audio;
            next = next.min(limit.max(0.0).floor() as u64);
        }
        if let Some(ceiling) = self.overshoot_ceiling_bps {
            next = next.min(ceiling.saturating_sub(1));
        }
        if next <= video {
            return None;
        }
        self.params(previous.scale(), next, previous)
    }

    fn step_down_both(&self, previous: EncodingParams) -> Option<EncodingParams> {
        let scale = previous.scale();
        let video = previous.video_bitrate_bps();
        if self.at_min_scale(scale) && video <= self.floor_bps(scale) {
            return None;
        }
        let next_scale = self.stepped_scale(scale);
        let reduced = (video as f64 * self.policy.shrink_factor).floor() as u64;
        let next_video = reduced.max(self.floor_bps(next_scale)).min(video);
        self.params(next_scale, next_video, previous)
    }
}
