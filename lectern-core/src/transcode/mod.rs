mod controller;
mod runner;
mod types;

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::budget::{BudgetLimits, EncodingParams};

pub use controller::{ControllerState, Decision, ExhaustReason, RetryController, RetryPolicy};
pub use runner::{AttemptCancelled, AttemptRunner};
pub use types::{AttemptOutcome, AttemptResult, SizeBand};

/// Terminal result of the attempt loop for one input.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeOutcome {
    /// The output at the job's output path is the accepted attempt.
    Accepted(AttemptResult),
    Exhausted(ExhaustReason),
}

/// Drives [`AttemptRunner`] under a [`RetryController`] until it accepts an
/// output or gives up. Every attempt is appended to `log`.
#[derive(Clone)]
pub struct Transcoder {
    runner: AttemptRunner,
    limits: BudgetLimits,
    policy: RetryPolicy,
}

impl Transcoder {
    pub fn new(runner: AttemptRunner, limits: BudgetLimits, policy: RetryPolicy) -> Self {
        Self {
            runner,
            limits,
            policy,
        }
    }

    pub async fn run(
        &self,
        lecture_id: &str,
        input: &Path,
        output: &Path,
        initial: EncodingParams,
        log: &mut Vec<AttemptResult>,
        cancel: &CancellationToken,
    ) -> Result<TranscodeOutcome, AttemptCancelled> {
        let mut controller =
            RetryController::new(initial, self.limits, self.policy, self.runner.band());

        while let Some(params) = controller.begin_attempt() {
            let index = controller.attempts();
            let result = self.runner.run(index, input, params, output, cancel).await?;
            log.push(result.clone());

            match controller.on_result(&result) {
                Decision::Accept => {
                    info!(
                        lecture_id,
                        attempt = index,
                        size_bytes = result.size_bytes,
                        scale = params.scale(),
                        video_bps = params.video_bitrate_bps(),
                        "encode accepted"
                    );
                    return Ok(TranscodeOutcome::Accepted(result));
                }
                Decision::Retry(next) => {
                    warn!(
                        lecture_id,
                        attempt = index,
                        outcome = result.outcome.label(),
                        size_bytes = result.size_bytes,
                        next_scale = next.scale(),
                        next_video_bps = next.video_bitrate_bps(),
                        "retrying encode with adjusted parameters"
                    );
                }
                Decision::Exhausted(reason) => {
                    warn!(lecture_id, attempt = index, %reason, "encode attempts exhausted");
                    return Ok(TranscodeOutcome::Exhausted(reason));
                }
            }
        }
        Ok(TranscodeOutcome::Exhausted(ExhaustReason::AttemptCeiling))
    }
}
