//! Pipeline orchestrator: a bounded pool of job machines over one batch of
//! lecture identifiers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::budget::BudgetLimits;
use crate::config::LecternConfig;
use crate::encoder::{Encoder, MediaProbe};
use crate::fetch::Fetcher;
use crate::job::{
    BackoffPolicy, DoneMarker, FailureLog, FailureReason, JobContext, JobMachine, JobPaths,
    JobState, LectureJob, StemSanitizer,
};
use crate::session::SessionProvider;
use crate::transcode::{AttemptResult, AttemptRunner, RetryPolicy, SizeBand, Transcoder};

pub struct Pipeline {
    ctx: Arc<JobContext>,
    concurrency: usize,
    sanitizer: StemSanitizer,
}

impl Pipeline {
    pub fn new(
        config: LecternConfig,
        session: Arc<dyn SessionProvider>,
        fetcher: Arc<dyn Fetcher>,
        encoder: Arc<dyn Encoder>,
        probe: Arc<dyn MediaProbe>,
    ) -> Self {
        let limits = BudgetLimits::from(&config.budget);
        let band = SizeBand::new(config.budget.target_bytes, config.budget.lower_tolerance);
        let transcoder = Transcoder::new(
            AttemptRunner::new(encoder, band),
            limits,
            RetryPolicy::from(&config.retry),
        );
        let ctx = JobContext {
            limits,
            session,
            fetcher,
            probe,
            transcoder,
            failure_log: FailureLog::new(Path::new(&config.paths.logs_dir)),
            session_backoff: BackoffPolicy::from(&config.session),
            download_backoff: BackoffPolicy::from(&config.download),
            config: Arc::new(config),
        };
        let concurrency = ctx.config.pipeline.concurrency.max(1);
        Self {
            ctx: Arc::new(ctx),
            concurrency,
            sanitizer: StemSanitizer::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn config(&self) -> &LecternConfig {
        &self.ctx.config
    }

    pub fn plan(&self, ids: &[String]) -> Vec<(String, JobPaths)> {
        plan_jobs(&self.ctx.config, &self.sanitizer, ids)
    }

    pub async fn run(&self, ids: &[String], cancel: &CancellationToken) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let planned = self.plan(ids);
        info!(
            %run_id,
            jobs = planned.len(),
            concurrency = self.concurrency,
            "pipeline run started"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut finished: Vec<(usize, LectureJob)> = Vec::with_capacity(planned.len());
        let mut pending: HashMap<usize, LectureJob> = HashMap::new();

        for (index, (id, paths)) in planned.into_iter().enumerate() {
            let job = LectureJob::new(id, paths);
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                finished.push((index, self.cancelled_before_start(job).await));
                continue;
            };
            pending.insert(index, job.clone());
            let ctx = Arc::clone(&self.ctx);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let job = JobMachine::new(ctx, job).run(&cancel).await;
                (index, job)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, job)) => {
                    pending.remove(&index);
                    finished.push((index, job));
                }
                Err(err) => error!(%run_id, error = %err, "job task did not complete"),
            }
        }
        for (index, mut job) in pending {
            let reason = FailureReason::Io {
                message: "job task aborted".to_string(),
            };
            self.ctx.failure_log.record(&job.lecture_id, &reason).await;
            job.state = JobState::Failed;
            job.last_error = Some(reason);
            finished.push((index, job));
        }

        finished.sort_by_key(|(index, _)| *index);
        let report = PipelineReport::new(
            run_id,
            started_at,
            finished.into_iter().map(|(_, job)| job).collect(),
        );
        info!(
            %run_id,
            succeeded = report.succeeded,
            skipped = report.skipped,
            failed = report.failed,
            "pipeline run finished"
        );
        report
    }

    async fn cancelled_before_start(&self, mut job: LectureJob) -> LectureJob {
        self.ctx
            .failure_log
            .record(&job.lecture_id, &FailureReason::Cancelled)
            .await;
        job.state = JobState::Failed;
        job.last_error = Some(FailureReason::Cancelled);
        job
    }
}

/// Paths for each distinct id, in first-seen order. A lecture's directory
/// depends on its id alone, never on the rest of the batch.
pub fn plan_jobs(
    config: &LecternConfig,
    sanitizer: &StemSanitizer,
    ids: &[String],
) -> Vec<(String, JobPaths)> {
    let work_dir = PathBuf::from(&config.paths.work_dir);
    let mut seen_ids = HashSet::new();
    let mut planned = Vec::new();
    for id in ids {
        if !seen_ids.insert(id.as_str()) {
            continue;
        }
        let stem = sanitizer.stem(id);
        let paths = JobPaths::new(
            &work_dir,
            &stem,
            &config.download.input_extension,
            &config.encoder.output_extension,
        );
        planned.push((id.clone(), paths));
    }
    planned
}

/// On-disk view of each job without touching the network.
pub async fn inspect_layout(config: &LecternConfig, ids: &[String]) -> Vec<DiskStatus> {
    let cap = config.budget.target_bytes;
    let mut statuses = Vec::new();
    for (lecture_id, paths) in plan_jobs(config, &StemSanitizer::new(), ids) {
        let state = if let Some(marker) =
            DoneMarker::confirms(&paths.marker, &lecture_id, &paths.output, cap).await
        {
            DiskState::Done {
                size_bytes: marker.size_bytes,
            }
        } else if fs::metadata(&paths.input).await.is_ok() {
            DiskState::Downloaded
        } else if let Ok(meta) = fs::metadata(&paths.partial).await {
            DiskState::Partial { bytes: meta.len() }
        } else {
            DiskState::Pending
        };
        statuses.push(DiskStatus {
            lecture_id,
            dir: paths.dir,
            state,
        });
    }
    statuses
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DiskState {
    Done { size_bytes: u64 },
    Downloaded,
    Partial { bytes: u64 },
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskStatus {
    pub lecture_id: String,
    pub dir: PathBuf,
    #[serde(flatten)]
    pub state: DiskState,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub lecture_id: String,
    pub state: JobState,
    pub skipped: bool,
    pub reason: Option<FailureReason>,
    pub duration_seconds: Option<f64>,
    pub output: PathBuf,
    pub attempts: Vec<AttemptResult>,
}

impl From<LectureJob> for JobReport {
    fn from(job: LectureJob) -> Self {
        Self {
            lecture_id: job.lecture_id,
            state: job.state,
            skipped: job.skipped,
            reason: job.last_error,
            duration_seconds: job.duration_seconds,
            output: job.paths.output,
            attempts: job.attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub jobs: Vec<JobReport>,
}

impl PipelineReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, jobs: Vec<LectureJob>) -> Self {
        let mut succeeded = 0;
        let mut skipped = 0;
        let mut failed = 0;
        for job in &jobs {
            match (job.state, job.skipped) {
                (JobState::Done, true) => skipped += 1,
                (JobState::Done, false) => succeeded += 1,
                _ => failed += 1,
            }
        }
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            succeeded,
            skipped,
            failed,
            jobs: jobs.into_iter().map(JobReport::from).collect(),
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &FailureReason)> {
        self.jobs.iter().filter_map(|job| {
            job.reason
                .as_ref()
                .map(|reason| (job.lecture_id.as_str(), reason))
        })
    }

    pub fn job(&self, lecture_id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|job| job.lecture_id == lecture_id)
    }
}
