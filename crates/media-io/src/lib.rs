use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

mod paths;
mod transcode;
pub use paths::{format_size, is_supported_video, resolve_media_paths, SUPPORTED_EXTENSIONS};
pub use transcode::{transcode, TranscodeError, TranscodeParams};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe not found on PATH; please install FFmpeg (ffprobe)")]
    FfprobeMissing,
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    disposition: Option<FfprobeDisposition>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeDisposition {
    attached_pic: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    format_name: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeJson {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub has_video: bool,
    pub has_audio: bool,
    pub video_codec: Option<String>,
    pub container: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps_num: Option<u32>,
    pub fps_den: Option<u32>,
    pub duration_seconds: Option<f64>,
    pub size_bytes: Option<u64>,
    pub audio_channels: Option<u32>,
    pub sample_rate: Option<u32>,
}

fn parse_rate(s: &str) -> Option<(u32, u32)> {
    let s = s.trim();
    if s == "0/0" || s == "0" || s.is_empty() {
        return None;
    }
    if let Some((a, b)) = s.split_once('/') {
        let num = a.parse().ok()?;
        let den = b.parse().ok()?;
        if den == 0 {
            return None;
        }
        return Some((num, den));
    }
    // integer fallback
    let v: u32 = s.parse().ok()?;
    Some((v, 1))
}

pub fn probe_media(path: &Path) -> Result<MediaInfo, ProbeError> {
    let ffprobe = which::which("ffprobe").map_err(|_| ProbeError::FfprobeMissing)?;
    let out = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-show_format")
        .arg("-show_streams")
        .arg("-print_format")
        .arg("json")
        .arg(path)
        .output()
        .map_err(|e| ProbeError::FfprobeFailed(e.to_string()))?;
    if !out.status.success() {
        return Err(ProbeError::FfprobeFailed(
            String::from_utf8_lossy(&out.stderr).trim().to_string(),
        ));
    }
    parse_probe_output(path, &out.stdout)
}

fn parse_probe_output(path: &Path, stdout: &[u8]) -> Result<MediaInfo, ProbeError> {
    let parsed: FfprobeJson =
        serde_json::from_slice(stdout).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let mut info = MediaInfo {
        path: path.to_path_buf(),
        has_video: false,
        has_audio: false,
        video_codec: None,
        container: None,
        width: None,
        height: None,
        fps_num: None,
        fps_den: None,
        duration_seconds: None,
        size_bytes: None,
        audio_channels: None,
        sample_rate: None,
    };

    for s in parsed.streams.iter().flatten() {
        match s.codec_type.as_deref() {
            Some("video") => {
                // Cover art is reported as a video stream.
                let attached_pic = s
                    .disposition
                    .as_ref()
                    .and_then(|d| d.attached_pic)
                    .unwrap_or(0)
                    == 1;
                if info.has_video || attached_pic {
                    continue;
                }
                let fps = s
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_rate)
                    .or_else(|| s.r_frame_rate.as_deref().and_then(parse_rate));
                info.has_video = true;
                info.video_codec = s.codec_name.clone();
                info.width = s.width;
                info.height = s.height;
                info.fps_num = fps.map(|(n, _)| n);
                info.fps_den = fps.map(|(_, d)| d);
            }
            Some("audio") => {
                info.has_audio = true;
                info.audio_channels = info.audio_channels.or(s.channels);
                info.sample_rate = info
                    .sample_rate
                    .or(s.sample_rate.as_deref().and_then(|x| x.parse().ok()));
            }
            _ => {}
        }
    }

    if let Some(format) = &parsed.format {
        info.duration_seconds = format.duration.as_deref().and_then(|d| d.parse().ok());
        info.size_bytes = format.size.as_deref().and_then(|d| d.parse().ok());
        info.container = format.format_name.clone();
    }

    Ok(info)
}
