use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use lectern_core::{
    calculate, inspect_layout, load_lectern_config, BudgetLimits, CatalogSessionProvider,
    DiskState, DiskStatus, FfmpegEncoder, FfprobeProbe, HttpFetcher, LectureCatalog,
    LecternConfig, Pipeline, PipelineReport,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] lectern_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("http client error: {0}")]
    Fetch(#[from] lectern_core::FetchError),
    #[error("budget error: {0}")]
    Budget(#[from] lectern_core::BudgetError),
    #[error("catalog {0} lists no lectures")]
    EmptyCatalog(PathBuf),
    #[error("{failed} lecture(s) failed")]
    JobsFailed { failed: usize },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Lecture download and size-capped transcoding", long_about = None)]
pub struct Cli {
    /// Path to lectern.toml
    #[arg(long, global = true, default_value = "configs/lectern.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download and transcode lectures from a catalog
    Run(RunArgs),
    /// Show what is already on disk for each catalog lecture
    Status(StatusArgs),
    /// Print the initial encoding parameters for a duration
    Budget(BudgetArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Exported lecture catalog
    #[arg(long)]
    pub catalog: PathBuf,
    /// Lecture ids to process (all catalog lectures when empty)
    pub ids: Vec<String>,
    /// Override pipeline.concurrency
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Exported lecture catalog
    #[arg(long)]
    pub catalog: PathBuf,
}

#[derive(Args, Debug)]
pub struct BudgetArgs {
    /// Source duration in seconds
    #[arg(long)]
    pub duration: f64,
    /// Override budget.target_bytes
    #[arg(long)]
    pub target_bytes: Option<u64>,
}

pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let context = AppContext::new(&cli.config)?;

    match &cli.command {
        Commands::Run(args) => {
            let report = context.run_pipeline(args, &cancel).await?;
            render(&report, cli.format)?;
            if report.has_failures() {
                return Err(AppError::JobsFailed {
                    failed: report.failed,
                });
            }
        }
        Commands::Status(args) => {
            let status = context.status(args).await?;
            render(&status, cli.format)?;
        }
        Commands::Budget(args) => {
            let view = context.budget(args)?;
            render(&view, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: LecternConfig,
}

impl AppContext {
    fn new(config_path: &Path) -> Result<Self> {
        let config = load_lectern_config(config_path)?;
        Ok(Self { config })
    }

    fn catalog_ids(&self, path: &Path) -> Result<(LectureCatalog, Vec<String>)> {
        let catalog = LectureCatalog::load(path)?;
        let ids = catalog.ids();
        if ids.is_empty() {
            return Err(AppError::EmptyCatalog(path.to_path_buf()));
        }
        Ok((catalog, ids))
    }

    async fn run_pipeline(
        &self,
        args: &RunArgs,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport> {
        let (catalog, catalog_ids) = self.catalog_ids(&args.catalog)?;
        let ids = if args.ids.is_empty() {
            catalog_ids
        } else {
            args.ids.clone()
        };

        let session = CatalogSessionProvider::new(catalog, &self.config.session);
        let fetcher = HttpFetcher::new(&self.config.download)?;
        let encoder = FfmpegEncoder::new(&self.config.encoder);
        let probe = FfprobeProbe::new(&self.config.encoder);
        let mut pipeline = Pipeline::new(
            self.config.clone(),
            Arc::new(session),
            Arc::new(fetcher),
            Arc::new(encoder),
            Arc::new(probe),
        );
        if let Some(concurrency) = args.concurrency {
            pipeline = pipeline.with_concurrency(concurrency);
        }
        info!(lectures = ids.len(), concurrency = pipeline.concurrency(), "starting run");
        Ok(pipeline.run(&ids, cancel).await)
    }

    async fn status(&self, args: &StatusArgs) -> Result<StatusList> {
        let (_, ids) = self.catalog_ids(&args.catalog)?;
        Ok(StatusList {
            rows: inspect_layout(&self.config, &ids).await,
        })
    }

    fn budget(&self, args: &BudgetArgs) -> Result<BudgetView> {
        let mut limits = BudgetLimits::from(&self.config.budget);
        if let Some(target) = args.target_bytes {
            limits.target_bytes = target;
        }
        let params = calculate(args.duration, &limits)?;
        let projected_bytes =
            (params.total_bitrate_bps() as f64 * args.duration / 8.0).ceil() as u64;
        Ok(BudgetView {
            duration_seconds: args.duration,
            target_bytes: limits.target_bytes,
            scale: params.scale(),
            video_bitrate_bps: params.video_bitrate_bps(),
            audio_bitrate_bps: params.audio_bitrate_bps(),
            projected_bytes,
        })
    }
}

impl DisplayFallback for PipelineReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Run {}: {} succeeded, {} skipped, {} failed",
            self.run_id, self.succeeded, self.skipped, self.failed
        )];
        for job in &self.jobs {
            let detail = match (&job.reason, job.skipped) {
                (Some(reason), _) => reason.to_string(),
                (None, true) => "already done".to_string(),
                (None, false) => format!("{} attempt(s)", job.attempts.len()),
            };
            lines.push(format!(
                "  [{state}] {id}: {detail}",
                state = job.state,
                id = job.lecture_id
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct StatusList {
    rows: Vec<DiskStatus>,
}

impl DisplayFallback for StatusList {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for row in &self.rows {
            let detail = match &row.state {
                DiskState::Done { size_bytes } => format!("done ({size_bytes} bytes)"),
                DiskState::Downloaded => "downloaded, not transcoded".to_string(),
                DiskState::Partial { bytes } => format!("partial download ({bytes} bytes)"),
                DiskState::Pending => "pending".to_string(),
            };
            lines.push(format!("{}: {detail}", row.lecture_id));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct BudgetView {
    duration_seconds: f64,
    target_bytes: u64,
    scale: f64,
    video_bitrate_bps: u64,
    audio_bitrate_bps: u64,
    projected_bytes: u64,
}

impl DisplayFallback for BudgetView {
    fn display(&self) -> String {
        format!(
            "duration {:.0}s, target {} bytes\n  scale {:.3}, video {} bps, audio {} bps\n  projected {} bytes",
            self.duration_seconds,
            self.target_bytes,
            self.scale,
            self.video_bitrate_bps,
            self.audio_bitrate_bps,
            self.projected_bytes
        )
    }
}
