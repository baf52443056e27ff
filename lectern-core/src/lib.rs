pub mod budget;
pub mod config;
pub mod encoder;
pub mod error;
pub mod fetch;
pub mod job;
pub mod pipeline;
pub mod session;
pub mod transcode;

pub use budget::{calculate, BudgetError, BudgetLimits, BudgetResult, EncodingParams};
pub use config::{load_lectern_config, LecternConfig};
pub use encoder::{
    EncodeError, EncodeResult, Encoder, FfmpegEncoder, FfprobeProbe, MediaProbe, ProbeError,
    ProbeResult,
};
pub use error::{ConfigError, Result};
pub use fetch::{FetchError, FetchOutcome, FetchResult, Fetcher, HttpFetcher};
pub use job::{
    DoneMarker, FailureLog, FailureReason, JobMachine, JobPaths, JobState, LectureJob,
    StemSanitizer,
};
pub use pipeline::{
    inspect_layout, plan_jobs, DiskState, DiskStatus, JobReport, Pipeline, PipelineReport,
};
pub use session::{
    CatalogEntry, CatalogSessionProvider, LectureCatalog, ResolvedMedia, Session, SessionError,
    SessionProvider, SessionResult,
};
pub use transcode::{
    AttemptOutcome, AttemptResult, AttemptRunner, ControllerState, Decision, ExhaustReason,
    RetryController, RetryPolicy, SizeBand, TranscodeOutcome, Transcoder,
};
