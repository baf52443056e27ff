//! Byte stream fetcher.
//!
//! Writes the body of a media URL into a staging file, resuming from a byte
//! offset with a `Range` request when asked to. A server that ignores the
//! range and answers with the full body restarts the file from zero.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, COOKIE, RANGE, USER_AGENT};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::DownloadSection;
use crate::session::Session;

const COPY_CHUNK_BYTES: usize = 256 * 1024;

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("media not found at {url}")]
    NotFound { url: String },
    #[error("download url rejected with status {status}")]
    Expired { status: u16 },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transient failures worth another attempt against the same URL.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        FetchError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        FetchError::Network(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Bytes written by this call.
    pub bytes_written: u64,
    /// Offset the transfer actually started from. Zero when the source
    /// ignored the resume request.
    pub resumed_from: u64,
    /// Full size of the resource when the source reported it.
    pub total_size: Option<u64>,
}

impl FetchOutcome {
    pub fn final_size(&self) -> u64 {
        self.resumed_from + self.bytes_written
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        session: &Session,
        dest: &Path,
        resume_offset: u64,
        cancel: &CancellationToken,
    ) -> FetchResult<FetchOutcome>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &DownloadSection) -> FetchResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds.max(1)))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch_http(
        &self,
        url: &str,
        session: &Session,
        dest: &Path,
        resume_offset: u64,
        cancel: &CancellationToken,
    ) -> FetchResult<FetchOutcome> {
        let mut request = self.client.get(url);
        if let Some(agent) = &session.user_agent {
            request = request.header(USER_AGENT, agent);
        }
        if let Some(cookies) = session.cookie_header() {
            request = request.header(COOKIE, cookies);
        }
        if resume_offset > 0 {
            request = request.header(RANGE, format!("bytes={resume_offset}-"));
        }

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            sent = request.send() => sent,
        };
        let response = sent?;
        let status = response.status();
        let (offset, total_size) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(content_range_total);
                (resume_offset, total)
            }
            StatusCode::RANGE_NOT_SATISFIABLE if resume_offset > 0 => {
                // Nothing past the offset: the partial is complete or longer
                // than the resource. The caller compares sizes.
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(content_range_total);
                return Ok(FetchOutcome {
                    bytes_written: 0,
                    resumed_from: resume_offset,
                    total_size: total,
                });
            }
            StatusCode::NOT_FOUND => {
                return Err(FetchError::NotFound {
                    url: url.to_string(),
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE => {
                return Err(FetchError::Expired {
                    status: status.as_u16(),
                })
            }
            status if status.is_success() => {
                if resume_offset > 0 {
                    info!(url, resume_offset, "server ignored range request, restarting download");
                }
                (0, response.content_length())
            }
            status => {
                return Err(FetchError::Network(format!(
                    "unexpected status {status} from {url}"
                )))
            }
        };

        let mut file = open_at(dest, offset).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await.map_err(|source| FetchError::io(dest, source))?;
                    return Err(FetchError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let data = chunk?;
            file.write_all(&data)
                .await
                .map_err(|source| FetchError::io(dest, source))?;
            written += data.len() as u64;
        }
        file.flush()
            .await
            .map_err(|source| FetchError::io(dest, source))?;
        debug!(url, bytes_written = written, resumed_from = offset, "http fetch finished");
        Ok(FetchOutcome {
            bytes_written: written,
            resumed_from: offset,
            total_size,
        })
    }

    async fn fetch_file(
        &self,
        source_path: &Path,
        dest: &Path,
        resume_offset: u64,
        cancel: &CancellationToken,
    ) -> FetchResult<FetchOutcome> {
        let mut source = match fs::File::open(source_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound {
                    url: source_path.display().to_string(),
                })
            }
            Err(err) => return Err(FetchError::io(source_path, err)),
        };
        let total = source
            .metadata()
            .await
            .map_err(|source| FetchError::io(source_path, source))?
            .len();
        let offset = if resume_offset > total { 0 } else { resume_offset };
        source
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| FetchError::io(source_path, source))?;

        let mut file = open_at(dest, offset).await?;
        let mut buffer = vec![0u8; COPY_CHUNK_BYTES];
        let mut written = 0u64;
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await.map_err(|source| FetchError::io(dest, source))?;
                    return Err(FetchError::Cancelled);
                }
                read = source.read(&mut buffer) => {
                    read.map_err(|err| FetchError::io(source_path, err))?
                }
            };
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .await
                .map_err(|source| FetchError::io(dest, source))?;
            written += read as u64;
        }
        file.flush()
            .await
            .map_err(|source| FetchError::io(dest, source))?;
        Ok(FetchOutcome {
            bytes_written: written,
            resumed_from: offset,
            total_size: Some(total),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        session: &Session,
        dest: &Path,
        resume_offset: u64,
        cancel: &CancellationToken,
    ) -> FetchResult<FetchOutcome> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| FetchError::io(parent, source))?;
        }
        if let Ok(parsed) = Url::parse(url) {
            if parsed.scheme() == "file" {
                let source_path = parsed
                    .to_file_path()
                    .map_err(|_| FetchError::Network(format!("invalid file url {url}")))?;
                return self
                    .fetch_file(&source_path, dest, resume_offset, cancel)
                    .await;
            }
        }
        self.fetch_http(url, session, dest, resume_offset, cancel)
            .await
    }
}

/// Opens `dest` for writing with exactly `offset` bytes kept.
async fn open_at(dest: &Path, offset: u64) -> FetchResult<fs::File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dest)
        .await
        .map_err(|source| FetchError::io(dest, source))?;
    file.set_len(offset)
        .await
        .map_err(|source| FetchError::io(dest, source))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|source| FetchError::io(dest, source))?;
    Ok(file)
}

/// Total length from `bytes <start>-<end>/<total>` or `bytes */<total>`.
fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
