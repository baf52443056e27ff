use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::budget::BudgetError;
use crate::config::{DownloadSection, SessionSection};
use crate::transcode::{AttemptResult, ExhaustReason};

use super::paths::JobPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Discovered,
    Resolving,
    Downloading,
    Downloaded,
    Transcoding,
    Verified,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Discovered => "discovered",
            JobState::Resolving => "resolving",
            JobState::Downloading => "downloading",
            JobState::Downloaded => "downloaded",
            JobState::Transcoding => "transcoding",
            JobState::Verified => "verified",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Session { message: String },
    Fetch { message: String },
    Probe { message: String },
    InvalidDuration { duration: f64 },
    InsufficientBudget { target_bytes: u64, minimum_bytes: u64 },
    InvalidParams { message: String },
    Exhausted { reason: ExhaustReason, attempts: u32 },
    Verification { message: String },
    Io { message: String },
    Cancelled,
}

impl FailureReason {
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Session { .. } => "session",
            FailureReason::Fetch { .. } => "fetch",
            FailureReason::Probe { .. } => "probe",
            FailureReason::InvalidDuration { .. } => "invalid_duration",
            FailureReason::InsufficientBudget { .. } => "insufficient_budget",
            FailureReason::InvalidParams { .. } => "invalid_params",
            FailureReason::Exhausted { .. } => "exhausted",
            FailureReason::Verification { .. } => "verification",
            FailureReason::Io { .. } => "io",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Session { message } => write!(f, "session: {message}"),
            FailureReason::Fetch { message } => write!(f, "fetch: {message}"),
            FailureReason::Probe { message } => write!(f, "probe: {message}"),
            FailureReason::InvalidDuration { duration } => {
                write!(f, "invalid duration {duration}s")
            }
            FailureReason::InsufficientBudget {
                target_bytes,
                minimum_bytes,
            } => write!(
                f,
                "insufficient budget: target {target_bytes} bytes, minimum {minimum_bytes} bytes"
            ),
            FailureReason::InvalidParams { message } => write!(f, "invalid parameters: {message}"),
            FailureReason::Exhausted { reason, attempts } => {
                write!(f, "exhausted after {attempts} attempts: {reason}")
            }
            FailureReason::Verification { message } => write!(f, "verification: {message}"),
            FailureReason::Io { message } => write!(f, "io: {message}"),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl From<BudgetError> for FailureReason {
    fn from(error: BudgetError) -> Self {
        match error {
            BudgetError::InvalidDuration { duration } => FailureReason::InvalidDuration { duration },
            BudgetError::InsufficientBudget {
                target_bytes,
                minimum_bytes,
            } => FailureReason::InsufficientBudget {
                target_bytes,
                minimum_bytes,
            },
            BudgetError::InvalidParams(message) => FailureReason::InvalidParams { message },
        }
    }
}

/// One lecture's mutable record. Owned by a single job machine.
#[derive(Debug, Clone)]
pub struct LectureJob {
    pub lecture_id: String,
    pub source_url: Option<String>,
    pub paths: JobPaths,
    pub duration_seconds: Option<f64>,
    pub state: JobState,
    pub attempts: Vec<AttemptResult>,
    pub last_error: Option<FailureReason>,
    /// Set when a valid Done record was found and no work was performed.
    pub skipped: bool,
}

impl LectureJob {
    pub fn new(lecture_id: impl Into<String>, paths: JobPaths) -> Self {
        Self {
            lecture_id: lecture_id.into(),
            source_url: None,
            paths,
            duration_seconds: None,
            state: JobState::Discovered,
            attempts: Vec::new(),
            last_error: None,
            skipped: false,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Linear backoff between `delay_range[0]` and `delay_range[1]` seconds
/// across the configured retries, with a little jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Retries after the first try.
    pub max_retries: u32,
    pub delay_range: [u32; 2],
}

impl BackoffPolicy {
    /// Total tries, the first one included.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Pause before retry number `retry` (zero-based).
    pub fn compute_delay(&self, retry: u32) -> Duration {
        let min = self.delay_range[0] as f64;
        let max = self.delay_range[1].max(self.delay_range[0]) as f64;
        let seconds = if self.max_retries <= 1 {
            min
        } else {
            let last = self.max_retries - 1;
            let ratio = (retry.min(last) as f64) / (last as f64);
            min + (max - min) * ratio
        };
        let base = Duration::from_secs_f64(seconds);
        if base.is_zero() {
            return base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=250);
        base + Duration::from_millis(jitter_ms)
    }
}

impl From<&SessionSection> for BackoffPolicy {
    fn from(section: &SessionSection) -> Self {
        Self {
            max_retries: section.max_retries,
            delay_range: section.retry_delay_seconds,
        }
    }
}

impl From<&DownloadSection> for BackoffPolicy {
    fn from(section: &DownloadSection) -> Self {
        Self {
            max_retries: section.max_retries,
            delay_range: section.retry_delay_seconds,
        }
    }
}
