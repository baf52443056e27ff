use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tempfile::tempdir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use lectern_core::{
    AttemptOutcome, DoneMarker, EncodeError, EncodeResult, Encoder, EncodingParams, ExhaustReason,
    FailureReason, FetchError, FetchOutcome, FetchResult, Fetcher, JobState, LecternConfig,
    MediaProbe, Pipeline, PipelineReport, ProbeResult, ResolvedMedia, Session, SessionError,
    SessionProvider, SessionResult,
};

const MB: u64 = 1_000_000;

#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct FakeSession {
    known: HashMap<String, String>,
    session: Session,
    expired_first: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeSession {
    fn new(ids: &[&str]) -> Self {
        Self {
            known: ids
                .iter()
                .map(|id| (id.to_string(), format!("https://media.example.edu/{id}.mp4")))
                .collect(),
            session: Session::default(),
            expired_first: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionProvider for FakeSession {
    async fn resolve(&self, lecture_id: &str) -> SessionResult<ResolvedMedia> {
        self.calls.lock().unwrap().push(lecture_id.to_string());
        let url = self
            .known
            .get(lecture_id)
            .ok_or_else(|| SessionError::NotFound {
                lecture_id: lecture_id.to_string(),
            })?;
        let expires_at = if self.expired_first.swap(false, Ordering::SeqCst) {
            Utc::now() - ChronoDuration::minutes(1)
        } else {
            Utc::now() + ChronoDuration::hours(1)
        };
        Ok(ResolvedMedia {
            download_url: url.clone(),
            expires_at,
        })
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

/// Materialises sparse files of `total` bytes.
struct FakeFetcher {
    total: u64,
    interrupt_first_at: Mutex<Option<u64>>,
    expire_first: AtomicBool,
    missing: AtomicBool,
    /// Fetches left that claim a length one byte longer than what they write.
    misreported: AtomicUsize,
    delay: Duration,
    calls: Mutex<Vec<(String, u64)>>,
    /// Length of the staging file when each fetch began.
    staged_lens: Mutex<Vec<u64>>,
    gauge: Gauge,
}

impl FakeFetcher {
    fn new(total: u64) -> Self {
        Self {
            total,
            interrupt_first_at: Mutex::new(None),
            expire_first: AtomicBool::new(false),
            missing: AtomicBool::new(false),
            misreported: AtomicUsize::new(0),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            staged_lens: Mutex::new(Vec::new()),
            gauge: Gauge::default(),
        }
    }

    fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        _session: &Session,
        dest: &Path,
        resume_offset: u64,
        _cancel: &CancellationToken,
    ) -> FetchResult<FetchOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), resume_offset));
        let staged = std::fs::metadata(dest).map(|meta| meta.len()).unwrap_or(0);
        self.staged_lens.lock().unwrap().push(staged);
        if self.expire_first.swap(false, Ordering::SeqCst) {
            return Err(FetchError::Expired { status: 403 });
        }
        if self.missing.load(Ordering::SeqCst) {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.gauge.exit();

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dest)
            .unwrap();
        if let Some(cut) = self.interrupt_first_at.lock().unwrap().take() {
            file.set_len(cut).unwrap();
            return Err(FetchError::Network("connection reset by peer".into()));
        }
        file.set_len(self.total).unwrap();
        let misreport = self
            .misreported
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        let total_size = if misreport { self.total + 1 } else { self.total };
        Ok(FetchOutcome {
            bytes_written: self.total - resume_offset,
            resumed_from: resume_offset,
            total_size: Some(total_size),
        })
    }
}

/// Produces outputs with scripted sizes; falls back to `default_size`.
struct ScriptedEncoder {
    sizes: Mutex<VecDeque<u64>>,
    default_size: u64,
    delay: Duration,
    block_until_cancelled: bool,
    started: Notify,
    calls: Mutex<Vec<EncodingParams>>,
    gauge: Gauge,
}

impl ScriptedEncoder {
    fn new(sizes: &[u64], default_size: u64) -> Self {
        Self {
            sizes: Mutex::new(sizes.iter().copied().collect()),
            default_size,
            delay: Duration::ZERO,
            block_until_cancelled: false,
            started: Notify::new(),
            calls: Mutex::new(Vec::new()),
            gauge: Gauge::default(),
        }
    }

    fn calls(&self) -> Vec<EncodingParams> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn encode(
        &self,
        _input: &Path,
        params: &EncodingParams,
        output: &Path,
        cancel: &CancellationToken,
    ) -> EncodeResult<()> {
        self.calls.lock().unwrap().push(*params);
        self.started.notify_one();
        if self.block_until_cancelled {
            cancel.cancelled().await;
            return Err(EncodeError::Cancelled);
        }
        self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.gauge.exit();
        let size = self
            .sizes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_size);
        let file = std::fs::File::create(output).unwrap();
        file.set_len(size).unwrap();
        Ok(())
    }
}

/// Reports `input` seconds for downloaded inputs and `output` for encodes.
struct FakeProbe {
    input: f64,
    output: f64,
}

impl FakeProbe {
    fn fixed(duration: f64) -> Self {
        Self {
            input: duration,
            output: duration,
        }
    }
}

#[async_trait]
impl MediaProbe for FakeProbe {
    async fn duration(&self, path: &Path, _cancel: &CancellationToken) -> ProbeResult<f64> {
        let name = path.file_name().unwrap().to_string_lossy();
        Ok(if name.contains(".output.") {
            self.output
        } else {
            self.input
        })
    }
}

struct Fakes {
    session: Arc<FakeSession>,
    fetcher: Arc<FakeFetcher>,
    encoder: Arc<ScriptedEncoder>,
    probe: Arc<FakeProbe>,
}

impl Fakes {
    fn new(ids: &[&str], source_size: u64, encoder: ScriptedEncoder) -> Self {
        Self {
            session: Arc::new(FakeSession::new(ids)),
            fetcher: Arc::new(FakeFetcher::new(source_size)),
            encoder: Arc::new(encoder),
            probe: Arc::new(FakeProbe::fixed(3600.0)),
        }
    }

    fn pipeline(&self, config: LecternConfig) -> Pipeline {
        Pipeline::new(
            config,
            self.session.clone(),
            self.fetcher.clone(),
            self.encoder.clone(),
            self.probe.clone(),
        )
    }
}

fn config(root: &Path) -> LecternConfig {
    let mut config = LecternConfig::default();
    config.paths.work_dir = root.join("work").display().to_string();
    config.paths.logs_dir = root.join("logs").display().to_string();
    config.session.retry_delay_seconds = [0, 0];
    config.download.retry_delay_seconds = [0, 0];
    config
}

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|id| id.to_string()).collect()
}

fn job_dir(root: &Path, stem: &str) -> PathBuf {
    root.join("work").join(stem)
}

fn failure_lines(root: &Path) -> Vec<String> {
    std::fs::read_to_string(root.join("logs").join("failures.log"))
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

fn reason_of<'a>(report: &'a PipelineReport, id: &str) -> Option<&'a FailureReason> {
    report.job(id).and_then(|job| job.reason.as_ref())
}

#[tokio::test]
async fn overshoot_then_success_reaches_done() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(
        &["week-01"],
        500 * MB,
        ScriptedEncoder::new(&[250 * MB, 195 * MB], 195 * MB),
    );
    let pipeline = fakes.pipeline(config(root.path()));

    let report = pipeline
        .run(&ids(&["week-01"]), &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    let job = report.job("week-01").unwrap();
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.attempts.len(), 2);
    assert_eq!(job.attempts[0].outcome, AttemptOutcome::Overshoot);
    assert_eq!(job.attempts[1].outcome, AttemptOutcome::Success);

    let calls = fakes.encoder.calls();
    assert_eq!(calls[0].scale(), 1.0);
    assert_eq!(calls[0].video_bitrate_bps(), 316_444);
    assert_eq!(calls[1].video_bitrate_bps(), 268_977);
    assert!(calls.iter().all(|p| p.audio_bitrate_bps() == 128_000));

    let dir = job_dir(root.path(), "week-01");
    let output = dir.join("week-01.output.mp4");
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 195 * MB);
    let marker = DoneMarker::confirms(
        &dir.join("week-01.output.mp4.done"),
        "week-01",
        &output,
        200 * MB,
    )
    .await;
    let marker = marker.expect("done marker should describe the output");
    assert_eq!(marker.attempts, 2);
    assert_eq!(marker.params.video_bitrate_bps(), 268_977);
    assert!(failure_lines(root.path()).is_empty());
}

#[tokio::test]
async fn rerun_of_done_batch_makes_no_calls() {
    let root = tempdir().unwrap();
    let batch = ids(&["week-01", "week-02"]);
    let first = Fakes::new(
        &["week-01", "week-02"],
        10 * MB,
        ScriptedEncoder::new(&[], 190 * MB),
    );
    let report = first
        .pipeline(config(root.path()))
        .run(&batch, &CancellationToken::new())
        .await;
    assert_eq!(report.succeeded, 2);

    let second = Fakes::new(
        &["week-01", "week-02"],
        10 * MB,
        ScriptedEncoder::new(&[], 190 * MB),
    );
    let report = second
        .pipeline(config(root.path()))
        .run(&batch, &CancellationToken::new())
        .await;

    assert_eq!(report.skipped, 2);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(second.session.calls(), 0);
    assert!(second.fetcher.calls().is_empty());
    assert!(second.encoder.calls().is_empty());
}

#[tokio::test]
async fn interrupted_download_resumes_from_partial_offset() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(
        &["week-03"],
        120 * MB,
        ScriptedEncoder::new(&[], 190 * MB),
    );
    *fakes.fetcher.interrupt_first_at.lock().unwrap() = Some(40 * MB);

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["week-03"]), &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded, 1);
    let offsets: Vec<u64> = fakes.fetcher.calls().iter().map(|(_, o)| *o).collect();
    assert_eq!(offsets, vec![0, 40_000_000]);
    let input = job_dir(root.path(), "week-03").join("week-03.input.mp4");
    assert_eq!(std::fs::metadata(input).unwrap().len(), 120 * MB);
}

#[tokio::test]
async fn existing_partial_from_previous_run_is_reused() {
    let root = tempdir().unwrap();
    let dir = job_dir(root.path(), "week-04");
    std::fs::create_dir_all(&dir).unwrap();
    let partial = std::fs::File::create(dir.join("week-04.input.mp4.part")).unwrap();
    partial.set_len(40 * MB).unwrap();

    let fakes = Fakes::new(
        &["week-04"],
        120 * MB,
        ScriptedEncoder::new(&[], 190 * MB),
    );
    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["week-04"]), &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(fakes.fetcher.calls()[0].1, 40_000_000);
    assert!(!dir.join("week-04.input.mp4.part").exists());
}

#[tokio::test]
async fn workers_never_exceed_concurrency() {
    let root = tempdir().unwrap();
    let lectures = ["l1", "l2", "l3", "l4", "l5", "l6"];
    let mut cfg = config(root.path());
    cfg.budget.target_bytes = 2 * MB;
    cfg.pipeline.concurrency = 2;

    let mut encoder = ScriptedEncoder::new(&[], 1_900_000);
    encoder.delay = Duration::from_millis(40);
    let mut fakes = Fakes::new(&lectures, MB, encoder);
    let mut fetcher = FakeFetcher::new(MB);
    fetcher.delay = Duration::from_millis(40);
    fakes.fetcher = Arc::new(fetcher);
    fakes.probe = Arc::new(FakeProbe::fixed(60.0));

    let pipeline = fakes.pipeline(cfg);
    assert_eq!(pipeline.concurrency(), 2);
    let report = pipeline
        .run(&ids(&lectures), &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded, 6);
    assert!(fakes.encoder.gauge.peak() <= 2);
    assert!(fakes.fetcher.gauge.peak() <= 2);
    assert!(fakes.encoder.gauge.peak() + fakes.fetcher.gauge.peak() >= 2);
}

#[tokio::test]
async fn cancellation_fails_in_flight_and_pending_jobs() {
    let root = tempdir().unwrap();
    let mut cfg = config(root.path());
    cfg.pipeline.concurrency = 1;
    let mut encoder = ScriptedEncoder::new(&[], 190 * MB);
    encoder.block_until_cancelled = true;
    let fakes = Fakes::new(&["a", "b", "c"], 50 * MB, encoder);
    let pipeline = fakes.pipeline(cfg);

    let cancel = CancellationToken::new();
    let trigger = async {
        fakes.encoder.started.notified().await;
        cancel.cancel();
    };
    let batch = ids(&["a", "b", "c"]);
    let (report, ()) = tokio::join!(pipeline.run(&batch, &cancel), trigger);

    assert_eq!(report.failed, 3);
    for id in ["a", "b", "c"] {
        assert_eq!(reason_of(&report, id), Some(&FailureReason::Cancelled));
    }
    assert_eq!(fakes.encoder.calls().len(), 1);
    // Downloaded input stays for the next run.
    assert!(job_dir(root.path(), "a").join("a.input.mp4").exists());
    assert_eq!(failure_lines(root.path()).len(), 3);
}

#[tokio::test]
async fn one_failing_job_does_not_affect_others() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(
        &["good"],
        10 * MB,
        ScriptedEncoder::new(&[], 190 * MB),
    );
    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["missing", "good"]), &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert!(report.has_failures());
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "missing");
    assert!(matches!(failures[0].1, FailureReason::Session { .. }));
    // First resolve plus the three configured retries.
    let missing_calls = fakes
        .session
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|id| id.as_str() == "missing")
        .count();
    assert_eq!(missing_calls, 4);

    let lines = failure_lines(root.path());
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("[missing] session:"));
}

#[tokio::test]
async fn audio_alone_over_budget_never_encodes() {
    let root = tempdir().unwrap();
    let mut fakes = Fakes::new(&["long"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));
    fakes.probe = Arc::new(FakeProbe::fixed(20_000.0));

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["long"]), &CancellationToken::new())
        .await;

    assert!(matches!(
        reason_of(&report, "long"),
        Some(FailureReason::InsufficientBudget { .. })
    ));
    assert!(fakes.encoder.calls().is_empty());
}

#[tokio::test]
async fn persistent_overshoot_exhausts_at_ceiling() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(&["big"], 10 * MB, ScriptedEncoder::new(&[], 260 * MB));

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["big"]), &CancellationToken::new())
        .await;

    let job = report.job("big").unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts.len(), 4);
    assert_eq!(
        job.reason,
        Some(FailureReason::Exhausted {
            reason: ExhaustReason::AttemptCeiling,
            attempts: 4,
        })
    );
    let rates: Vec<u64> = fakes
        .encoder
        .calls()
        .iter()
        .map(EncodingParams::video_bitrate_bps)
        .collect();
    assert!(rates.windows(2).all(|pair| pair[1] < pair[0]));
    assert!(!job_dir(root.path(), "big").join("big.output.mp4.done").exists());
}

#[tokio::test]
async fn rejected_download_url_is_resolved_again() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(&["week-05"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));
    fakes.fetcher.expire_first.store(true, Ordering::SeqCst);

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["week-05"]), &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(fakes.session.calls(), 2);
    assert_eq!(fakes.fetcher.calls().len(), 2);
}

#[tokio::test]
async fn output_with_wrong_length_fails_verification() {
    let root = tempdir().unwrap();
    let mut fakes = Fakes::new(&["short"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));
    fakes.probe = Arc::new(FakeProbe {
        input: 3600.0,
        output: 1800.0,
    });

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["short"]), &CancellationToken::new())
        .await;

    assert!(matches!(
        reason_of(&report, "short"),
        Some(FailureReason::Verification { .. })
    ));
    assert!(!job_dir(root.path(), "short")
        .join("short.output.mp4.done")
        .exists());
}

#[tokio::test]
async fn duplicate_ids_run_once() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(&["dup"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["dup", "dup"]), &CancellationToken::new())
        .await;

    assert_eq!(report.jobs.len(), 1);
    assert_eq!(fakes.encoder.calls().len(), 1);
}

#[tokio::test]
async fn similar_ids_never_share_a_finished_output() {
    let root = tempdir().unwrap();
    let first = Fakes::new(&["Lezione 1"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));
    let report = first
        .pipeline(config(root.path()))
        .run(&ids(&["Lezione 1"]), &CancellationToken::new())
        .await;
    assert_eq!(report.succeeded, 1);

    let second = Fakes::new(&["Lezione_1"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));
    let report = second
        .pipeline(config(root.path()))
        .run(&ids(&["Lezione_1"]), &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(second.session.calls(), 1);
    assert_eq!(second.encoder.calls().len(), 1);
    let job = report.job("Lezione_1").unwrap();
    assert_eq!(
        job.output,
        job_dir(root.path(), "Lezione_1").join("Lezione_1.output.mp4")
    );
    assert_eq!(std::fs::read_dir(root.path().join("work")).unwrap().count(), 2);
}

#[tokio::test]
async fn directory_owned_by_another_lecture_is_left_alone() {
    let root = tempdir().unwrap();
    let dir = job_dir(root.path(), "week-06");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("week-06.lecture"), "week 06\n").unwrap();
    std::fs::write(dir.join("week-06.input.mp4"), b"someone else's input").unwrap();

    let fakes = Fakes::new(&["week-06"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));
    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["week-06"]), &CancellationToken::new())
        .await;

    match reason_of(&report, "week-06") {
        Some(FailureReason::Io { message }) => assert!(message.contains("week 06")),
        other => panic!("unexpected failure {other:?}"),
    }
    assert_eq!(fakes.session.calls(), 0);
    assert!(fakes.encoder.calls().is_empty());
    assert_eq!(
        std::fs::read(dir.join("week-06.input.mp4")).unwrap(),
        b"someone else's input"
    );
}

#[tokio::test]
async fn inconsistent_download_restarts_from_zero() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(&["week-07"], 30 * MB, ScriptedEncoder::new(&[], 190 * MB));
    fakes.fetcher.misreported.store(1, Ordering::SeqCst);

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["week-07"]), &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded, 1);
    let offsets: Vec<u64> = fakes.fetcher.calls().iter().map(|(_, o)| *o).collect();
    assert_eq!(offsets, vec![0, 0]);
    // The inconsistent staging file was removed before the second fetch.
    assert_eq!(*fakes.fetcher.staged_lens.lock().unwrap(), vec![0, 0]);
    let dir = job_dir(root.path(), "week-07");
    assert_eq!(
        std::fs::metadata(dir.join("week-07.input.mp4")).unwrap().len(),
        30 * MB
    );
    assert!(!dir.join("week-07.input.mp4.part").exists());
}

#[tokio::test]
async fn repeated_inconsistent_download_fails_the_job() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(&["week-08"], 30 * MB, ScriptedEncoder::new(&[], 190 * MB));
    fakes.fetcher.misreported.store(usize::MAX, Ordering::SeqCst);

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["week-08"]), &CancellationToken::new())
        .await;

    assert!(matches!(
        reason_of(&report, "week-08"),
        Some(FailureReason::Fetch { .. })
    ));
    assert_eq!(fakes.fetcher.calls().len(), 2);
    assert!(fakes.encoder.calls().is_empty());
    assert!(!job_dir(root.path(), "week-08")
        .join("week-08.input.mp4")
        .exists());
}

#[tokio::test]
async fn stale_download_url_is_resolved_before_fetching() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(&["week-09"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));
    fakes.session.expired_first.store(true, Ordering::SeqCst);

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["week-09"]), &CancellationToken::new())
        .await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(fakes.session.calls(), 2);
    // No fetch went out with the stale url.
    assert_eq!(fakes.fetcher.calls().len(), 1);
}

#[tokio::test]
async fn missing_media_is_not_retried() {
    let root = tempdir().unwrap();
    let fakes = Fakes::new(&["week-10"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));
    fakes.fetcher.missing.store(true, Ordering::SeqCst);

    let report = fakes
        .pipeline(config(root.path()))
        .run(&ids(&["week-10"]), &CancellationToken::new())
        .await;

    assert!(matches!(
        reason_of(&report, "week-10"),
        Some(FailureReason::Fetch { .. })
    ));
    assert_eq!(fakes.fetcher.calls().len(), 1);
    assert_eq!(fakes.session.calls(), 1);
}

#[tokio::test]
async fn zero_download_retries_still_fetches_once() {
    let root = tempdir().unwrap();
    let mut cfg = config(root.path());
    cfg.download.max_retries = 0;
    let fakes = Fakes::new(&["week-11"], 10 * MB, ScriptedEncoder::new(&[], 190 * MB));
    *fakes.fetcher.interrupt_first_at.lock().unwrap() = Some(MB);

    let report = fakes
        .pipeline(cfg)
        .run(&ids(&["week-11"]), &CancellationToken::new())
        .await;

    assert!(matches!(
        reason_of(&report, "week-11"),
        Some(FailureReason::Fetch { .. })
    ));
    assert_eq!(fakes.fetcher.calls().len(), 1);
}
