use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use media_io::{ProbeError, TranscodeError, TranscodeParams};

use crate::settings::{OutputFormat, Quality};

/// Run-scoped cancellation flag shared by the orchestrator and every job of
/// one run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn as_flag(&self) -> &AtomicBool {
        &self.0
    }
}

pub struct EncodeRequest<'a> {
    pub source: &'a Path,
    pub output: &'a Path,
    pub format: OutputFormat,
    pub quality: Quality,
    pub mute: bool,
    /// Implementations that can interrupt their work should watch this.
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    Success { output_path: PathBuf },
    /// The encoder ran but could not produce an output, e.g. no video stream.
    Failure { diagnostic: String },
}

/// The component that actually transcodes one file.
///
/// Called synchronously on a worker thread. `Ok(Failure)` marks the job
/// `Failed`; `Err` (and panics) mark it `Errored`. Implementations must create
/// the output directory when it does not exist.
pub trait Encoder: Send + Sync {
    fn transcode(&self, request: &EncodeRequest<'_>) -> Result<EncodeOutcome>;
}

/// Encoder backed by the `ffmpeg` binary on PATH.
#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder;

impl Encoder for FfmpegEncoder {
    fn transcode(&self, request: &EncodeRequest<'_>) -> Result<EncodeOutcome> {
        if let Some(dir) = request.output.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output directory {}", dir.display()))?;
        }

        let params = TranscodeParams {
            source: request.source,
            output: request.output,
            video_codec: request.format.video_codec(),
            crf: request.quality.value(),
            mute: request.mute,
        };

        let result = media_io::transcode(&params, Some(request.cancel.as_flag()));
        classify(result, request.output)
    }
}

/// Missing tools and process I/O are faults; everything else ffmpeg or
/// ffprobe reports about the input is a failure of that one job.
fn classify(result: Result<(), TranscodeError>, output: &Path) -> Result<EncodeOutcome> {
    match result {
        Ok(()) => Ok(EncodeOutcome::Success {
            output_path: output.to_path_buf(),
        }),
        Err(err @ TranscodeError::FfmpegMissing)
        | Err(err @ TranscodeError::Probe(ProbeError::FfprobeMissing)) => Err(err.into()),
        Err(TranscodeError::Io(err)) => Err(anyhow::Error::new(err).context("run ffmpeg process")),
        Err(err) => Ok(EncodeOutcome::Failure {
            diagnostic: err.to_string(),
        }),
    }
}
