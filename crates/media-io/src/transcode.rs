use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::{probe_media, ProbeError};

const STDERR_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("ffmpeg not found on PATH; please install FFmpeg")]
    FfmpegMissing,
    #[error("no video stream")]
    NoVideoStream,
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("{0}")]
    Ffmpeg(String),
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for a single-file constant-quality transcode.
#[derive(Debug, Clone)]
pub struct TranscodeParams<'a> {
    pub source: &'a Path,
    pub output: &'a Path,
    pub video_codec: &'a str,
    /// Constant rate factor, lower is better quality and larger output.
    pub crf: u8,
    pub mute: bool,
}

impl TranscodeParams<'_> {
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            self.source.to_string_lossy().into_owned(),
            // yuv420p encoders reject odd frame sizes
            "-vf".into(),
            "pad=ceil(iw/2)*2:ceil(ih/2)*2".into(),
            "-c:v".into(),
            self.video_codec.into(),
            "-crf".into(),
            self.crf.to_string(),
        ];
        if self.video_codec == "libvpx-vp9" {
            // constant quality mode for vp9
            args.push("-b:v".into());
            args.push("0".into());
        }
        if self.mute {
            args.push("-an".into());
        }
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Run ffmpeg to completion on the calling thread.
///
/// The source is probed first so that files without a video stream fail fast
/// with [`TranscodeError::NoVideoStream`]. When `cancel` is set while ffmpeg is
/// running, the child process is killed and [`TranscodeError::Cancelled`] is
/// returned.
pub fn transcode(
    params: &TranscodeParams<'_>,
    cancel: Option<&AtomicBool>,
) -> Result<(), TranscodeError> {
    let ffmpeg = which::which("ffmpeg").map_err(|_| TranscodeError::FfmpegMissing)?;

    let info = probe_media(params.source)?;
    if !info.has_video {
        return Err(TranscodeError::NoVideoStream);
    }

    let args = params.ffmpeg_args();
    tracing::debug!(source = %params.source.display(), ?args, "spawning ffmpeg");

    let mut child = Command::new(ffmpeg)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr_reader = child.stderr.take().map(|stderr| {
        thread::spawn(move || {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        })
    });

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            tracing::info!(source = %params.source.display(), "killing ffmpeg after cancel");
            let _ = child.kill();
            let _ = child.wait();
            if let Some(handle) = stderr_reader {
                let _ = handle.join();
            }
            return Err(TranscodeError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stderr_tail = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    if status.success() {
        Ok(())
    } else if stderr_tail.trim().is_empty() {
        Err(TranscodeError::Ffmpeg(format!("ffmpeg exited with {status}")))
    } else {
        Err(TranscodeError::Ffmpeg(stderr_tail))
    }
}
