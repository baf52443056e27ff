use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::budget::EncodingParams;
use crate::encoder::{EncodeError, Encoder};

use super::types::{AttemptOutcome, AttemptResult, SizeBand};

/// The only way an attempt ends without an [`AttemptResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptCancelled;

/// Wraps one encoder invocation and measures what it produced.
#[derive(Clone)]
pub struct AttemptRunner {
    encoder: Arc<dyn Encoder>,
    band: SizeBand,
}

impl AttemptRunner {
    pub fn new(encoder: Arc<dyn Encoder>, band: SizeBand) -> Self {
        Self { encoder, band }
    }

    pub fn band(&self) -> SizeBand {
        self.band
    }

    pub async fn run(
        &self,
        index: u32,
        input: &Path,
        params: EncodingParams,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<AttemptResult, AttemptCancelled> {
        // A leftover from an earlier attempt must not be measured as this one.
        if let Err(err) = fs::remove_file(output).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %output.display(), error = %err, "failed to clear previous output");
            }
        }

        let outcome = match self.encoder.encode(input, &params, output, cancel).await {
            Ok(()) => match fs::metadata(output).await {
                Ok(meta) => {
                    let size = meta.len();
                    debug!(attempt = index, size_bytes = size, "encode attempt measured");
                    return Ok(AttemptResult {
                        index,
                        params,
                        size_bytes: Some(size),
                        outcome: self.band.classify(size),
                    });
                }
                Err(err) => AttemptOutcome::EncodeFailed {
                    exit_code: Some(0),
                    stderr_excerpt: format!("encoder reported success but output is unreadable: {err}"),
                },
            },
            Err(EncodeError::Cancelled) => return Err(AttemptCancelled),
            Err(EncodeError::Failed {
                exit_code,
                stderr_excerpt,
            }) => AttemptOutcome::EncodeFailed {
                exit_code,
                stderr_excerpt,
            },
            Err(err @ EncodeError::Spawn { .. }) => AttemptOutcome::EncodeFailed {
                exit_code: None,
                stderr_excerpt: err.to_string(),
            },
        };
        Ok(AttemptResult {
            index,
            params,
            size_bytes: None,
            outcome,
        })
    }
}
