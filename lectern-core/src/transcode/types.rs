use serde::Serialize;

use crate::budget::EncodingParams;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Overshoot,
    Undershoot,
    EncodeFailed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Overshoot => "overshoot",
            AttemptOutcome::Undershoot => "undershoot",
            AttemptOutcome::EncodeFailed { .. } => "encode_failed",
        }
    }
}

/// One encoder invocation, appended to the job's attempt log and never removed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptResult {
    pub index: u32,
    pub params: EncodingParams,
    pub size_bytes: Option<u64>,
    pub outcome: AttemptOutcome,
}

/// Acceptable output size window: `[cap * lower_tolerance, cap]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBand {
    pub cap_bytes: u64,
    pub lower_bytes: u64,
}

impl SizeBand {
    pub fn new(cap_bytes: u64, lower_tolerance: f64) -> Self {
        let lower_bytes = (cap_bytes as f64 * lower_tolerance).ceil() as u64;
        Self {
            cap_bytes,
            lower_bytes: lower_bytes.min(cap_bytes),
        }
    }

    pub fn classify(&self, size_bytes: u64) -> AttemptOutcome {
        if size_bytes > self.cap_bytes {
            AttemptOutcome::Overshoot
        } else if size_bytes < self.lower_bytes {
            AttemptOutcome::Undershoot
        } else {
            AttemptOutcome::Success
        }
    }
}
