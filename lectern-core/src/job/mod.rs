//! Per-lecture job state machine.
//!
//! `Discovered -> Resolving -> Downloading -> Downloaded -> Transcoding ->
//! Verified -> Done`, with `Failed` reachable from every working state. Every
//! error is converted into a [`FailureReason`] on the job; nothing escapes
//! [`JobMachine::run`].

mod ledger;
mod paths;
mod types;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::{self, BudgetLimits};
use crate::config::LecternConfig;
use crate::encoder::{MediaProbe, ProbeError};
use crate::fetch::{FetchError, Fetcher};
use crate::session::{ResolvedMedia, SessionProvider};
use crate::transcode::{AttemptCancelled, TranscodeOutcome, Transcoder};

pub use ledger::{claim_workdir, sha256_file, DoneMarker, FailureLog};
pub use paths::{JobPaths, StemSanitizer};
pub use types::{BackoffPolicy, FailureReason, JobState, LectureJob};

type Step<T> = Result<T, FailureReason>;

/// Everything a job needs besides its own record. Shared by all jobs of a
/// run; holds no per-job state.
pub struct JobContext {
    pub config: Arc<LecternConfig>,
    pub limits: BudgetLimits,
    pub session: Arc<dyn SessionProvider>,
    pub fetcher: Arc<dyn Fetcher>,
    pub probe: Arc<dyn MediaProbe>,
    pub transcoder: Transcoder,
    pub failure_log: FailureLog,
    pub session_backoff: BackoffPolicy,
    pub download_backoff: BackoffPolicy,
}

pub struct JobMachine {
    ctx: Arc<JobContext>,
    job: LectureJob,
}

impl JobMachine {
    pub fn new(ctx: Arc<JobContext>, job: LectureJob) -> Self {
        Self { ctx, job }
    }

    pub async fn run(mut self, cancel: &CancellationToken) -> LectureJob {
        let cap = self.ctx.limits.target_bytes;
        let paths = self.job.paths.clone();
        if let Some(marker) =
            DoneMarker::confirms(&paths.marker, &self.job.lecture_id, &paths.output, cap).await
        {
            info!(
                lecture_id = %self.job.lecture_id,
                size_bytes = marker.size_bytes,
                "output already done, skipping"
            );
            self.job.skipped = true;
            self.job.state = JobState::Done;
            return self.job;
        }

        match self.execute(cancel).await {
            Ok(()) => {
                self.transition(JobState::Done);
                info!(
                    lecture_id = %self.job.lecture_id,
                    attempts = self.job.attempt_count(),
                    "lecture done"
                );
            }
            Err(reason) => self.fail(reason).await,
        }
        self.job
    }

    async fn execute(&mut self, cancel: &CancellationToken) -> Step<()> {
        if cancel.is_cancelled() {
            return Err(FailureReason::Cancelled);
        }
        let paths = self.job.paths.clone();
        fs::create_dir_all(&paths.dir)
            .await
            .map_err(|err| io_failure(&paths.dir, err))?;
        let claimed = claim_workdir(&paths.owner, &self.job.lecture_id)
            .await
            .map_err(|err| io_failure(&paths.owner, err))?;
        if let Some(owner) = claimed {
            return Err(FailureReason::Io {
                message: format!(
                    "{} belongs to lecture {owner}",
                    paths.dir.display()
                ),
            });
        }

        if fs::metadata(&paths.input).await.is_ok() {
            debug!(lecture_id = %self.job.lecture_id, "reusing downloaded input");
        } else {
            let media = self.resolve(cancel).await?;
            self.download(media, cancel).await?;
        }
        self.transition(JobState::Downloaded);

        let duration = self.probe_duration(&paths.input, cancel).await?;
        self.job.duration_seconds = Some(duration);
        let initial = budget::calculate(duration, &self.ctx.limits)?;
        debug!(
            lecture_id = %self.job.lecture_id,
            duration,
            scale = initial.scale(),
            video_bps = initial.video_bitrate_bps(),
            "initial encoding parameters"
        );

        self.transition(JobState::Transcoding);
        remove_if_present(&paths.marker).await?;
        let outcome = self
            .ctx
            .transcoder
            .run(
                &self.job.lecture_id,
                &paths.input,
                &paths.output,
                initial,
                &mut self.job.attempts,
                cancel,
            )
            .await
            .map_err(|AttemptCancelled| FailureReason::Cancelled)?;
        let accepted = match outcome {
            TranscodeOutcome::Accepted(result) => result,
            TranscodeOutcome::Exhausted(reason) => {
                return Err(FailureReason::Exhausted {
                    reason,
                    attempts: self.job.attempt_count(),
                })
            }
        };

        let size_bytes = self.verify(duration, cancel).await?;
        self.transition(JobState::Verified);

        let sha256 = sha256_file(&paths.output)
            .await
            .map_err(|err| io_failure(&paths.output, err))?;
        let marker = DoneMarker {
            lecture_id: self.job.lecture_id.clone(),
            size_bytes,
            sha256,
            params: accepted.params,
            attempts: self.job.attempt_count(),
            completed_at: Utc::now(),
        };
        marker
            .write(&paths.marker)
            .await
            .map_err(|err| io_failure(&paths.marker, err))
    }

    async fn resolve(&mut self, cancel: &CancellationToken) -> Step<ResolvedMedia> {
        self.transition(JobState::Resolving);
        let policy = self.ctx.session_backoff.clone();
        let attempts = policy.attempts();
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(FailureReason::Cancelled);
            }
            match self.ctx.session.resolve(&self.job.lecture_id).await {
                Ok(media) => {
                    self.job.source_url = Some(media.download_url.clone());
                    return Ok(media);
                }
                Err(err) if attempt + 1 >= attempts => {
                    return Err(FailureReason::Session {
                        message: err.to_string(),
                    })
                }
                Err(err) => {
                    let wait = policy.compute_delay(attempt);
                    warn!(
                        lecture_id = %self.job.lecture_id,
                        attempt = attempt + 1,
                        wait = ?wait,
                        error = %err,
                        "retrying session resolve"
                    );
                    pause(wait, cancel).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn download(&mut self, mut media: ResolvedMedia, cancel: &CancellationToken) -> Step<()> {
        self.transition(JobState::Downloading);
        let paths = self.job.paths.clone();
        let resume_enabled = self.ctx.config.download.resume_enabled;
        let policy = self.ctx.download_backoff.clone();
        let attempts = policy.attempts();
        let mut restarted = false;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FailureReason::Cancelled);
            }
            if media.is_expired_at(Utc::now()) {
                debug!(lecture_id = %self.job.lecture_id, "download url expired before fetch");
                media = self.resolve(cancel).await?;
                self.transition(JobState::Downloading);
            }

            let existing = fs::metadata(&paths.partial)
                .await
                .map(|meta| meta.len())
                .unwrap_or(0);
            let offset = if resume_enabled { existing } else { 0 };
            if offset > 0 {
                info!(lecture_id = %self.job.lecture_id, offset, "resuming partial download");
            }

            let fetched = self
                .ctx
                .fetcher
                .fetch(
                    &media.download_url,
                    self.ctx.session.session(),
                    &paths.partial,
                    offset,
                    cancel,
                )
                .await;

            let error = match fetched {
                Ok(outcome) => {
                    let on_disk = fs::metadata(&paths.partial)
                        .await
                        .map_err(|err| io_failure(&paths.partial, err))?
                        .len();
                    let consistent = on_disk == outcome.final_size()
                        && outcome.total_size.map_or(true, |total| total == on_disk);
                    if consistent {
                        fs::rename(&paths.partial, &paths.input)
                            .await
                            .map_err(|err| io_failure(&paths.input, err))?;
                        debug!(lecture_id = %self.job.lecture_id, size_bytes = on_disk, "download complete");
                        return Ok(());
                    }
                    if restarted {
                        return Err(FailureReason::Fetch {
                            message: format!(
                                "size mismatch after restart: {on_disk} bytes on disk, expected {:?}",
                                outcome.total_size
                            ),
                        });
                    }
                    warn!(
                        lecture_id = %self.job.lecture_id,
                        on_disk,
                        expected = ?outcome.total_size,
                        "partial download is inconsistent, restarting from zero"
                    );
                    remove_if_present(&paths.partial).await?;
                    restarted = true;
                    continue;
                }
                Err(FetchError::Cancelled) => return Err(FailureReason::Cancelled),
                Err(err) => err,
            };

            if attempt + 1 >= attempts {
                return Err(FailureReason::Fetch {
                    message: error.to_string(),
                });
            }
            match error {
                FetchError::Expired { .. } => {
                    warn!(lecture_id = %self.job.lecture_id, error = %error, "download url rejected, resolving again");
                    media = self.resolve(cancel).await?;
                    self.transition(JobState::Downloading);
                }
                error if error.is_retryable() => {
                    let wait = policy.compute_delay(attempt);
                    warn!(
                        lecture_id = %self.job.lecture_id,
                        attempt = attempt + 1,
                        wait = ?wait,
                        error = %error,
                        "retrying download"
                    );
                    pause(wait, cancel).await?;
                }
                other => {
                    return Err(FailureReason::Fetch {
                        message: other.to_string(),
                    })
                }
            }
            attempt += 1;
        }
    }

    async fn probe_duration(&self, path: &Path, cancel: &CancellationToken) -> Step<f64> {
        self.ctx
            .probe
            .duration(path, cancel)
            .await
            .map_err(|err| match err {
                ProbeError::Cancelled => FailureReason::Cancelled,
                other => FailureReason::Probe {
                    message: other.to_string(),
                },
            })
    }

    /// Output fits the cap and plays for roughly as long as the input.
    async fn verify(&self, input_duration: f64, cancel: &CancellationToken) -> Step<u64> {
        let output = &self.job.paths.output;
        let size_bytes = fs::metadata(output)
            .await
            .map_err(|err| io_failure(output, err))?
            .len();
        let cap = self.ctx.limits.target_bytes;
        if size_bytes > cap {
            return Err(FailureReason::Verification {
                message: format!("output is {size_bytes} bytes, cap is {cap}"),
            });
        }

        let output_duration = match self.ctx.probe.duration(output, cancel).await {
            Ok(duration) => duration,
            Err(ProbeError::Cancelled) => return Err(FailureReason::Cancelled),
            Err(err) => {
                return Err(FailureReason::Verification {
                    message: format!("output is not probeable: {err}"),
                })
            }
        };
        let tolerance =
            input_duration * f64::from(self.ctx.config.verify.duration_tolerance_percent) / 100.0;
        if (output_duration - input_duration).abs() > tolerance {
            return Err(FailureReason::Verification {
                message: format!(
                    "output lasts {output_duration:.1}s, input {input_duration:.1}s"
                ),
            });
        }
        Ok(size_bytes)
    }

    fn transition(&mut self, next: JobState) {
        debug!(
            lecture_id = %self.job.lecture_id,
            from = %self.job.state,
            to = %next,
            "job transition"
        );
        self.job.state = next;
    }

    async fn fail(&mut self, reason: FailureReason) {
        warn!(
            lecture_id = %self.job.lecture_id,
            state = %self.job.state,
            reason = %reason,
            "lecture failed"
        );
        self.ctx
            .failure_log
            .record(&self.job.lecture_id, &reason)
            .await;
        self.job.last_error = Some(reason);
        self.job.state = JobState::Failed;
    }
}

async fn pause(wait: Duration, cancel: &CancellationToken) -> Step<()> {
    if wait.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = sleep(wait) => Ok(()),
        _ = cancel.cancelled() => Err(FailureReason::Cancelled),
    }
}

async fn remove_if_present(path: &Path) -> Step<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_failure(path, err)),
    }
}

fn io_failure(path: &Path, err: std::io::Error) -> FailureReason {
    FailureReason::Io {
        message: format!("{}: {err}", path.display()),
    }
}
