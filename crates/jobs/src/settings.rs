use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Webm,
    Mov,
    Avi,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Mp4,
        OutputFormat::Webm,
        OutputFormat::Mov,
        OutputFormat::Avi,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Mov => "mov",
            OutputFormat::Avi => "avi",
        }
    }

    pub fn video_codec(self) -> &'static str {
        match self {
            OutputFormat::Webm => "libvpx-vp9",
            _ => "libx264",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().trim_start_matches('.').to_ascii_lowercase();
        OutputFormat::ALL
            .into_iter()
            .find(|f| f.extension() == wanted)
            .ok_or_else(|| JobError::UnsupportedFormat(s.to_string()))
    }
}

/// Constant-rate-factor style quality, 0 (best) to 51 (smallest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Quality(u8);

impl Quality {
    pub const MAX: u8 = 51;
    pub const DEFAULT: Quality = Quality(28);

    pub fn new(value: u8) -> Result<Self, JobError> {
        if value > Self::MAX {
            return Err(JobError::InvalidQuality(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Quality {
    type Error = JobError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Quality::new(value)
    }
}

impl From<Quality> for u8 {
    fn from(q: Quality) -> u8 {
        q.0
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Encoding parameters shared by every job in a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    pub format: OutputFormat,
    pub quality: Quality,
    pub mute: bool,
    /// Unset means "next to the source file".
    pub output_dir: Option<PathBuf>,
}

impl EncodeSettings {
    pub fn output_path_for(&self, source: &Path) -> PathBuf {
        output_path(source, self.format, self.output_dir.as_deref())
    }
}

/// `<stem>_compressed.<ext>` in `output_dir`, or beside `source` when unset.
pub fn output_path(source: &Path, format: OutputFormat, output_dir: Option<&Path>) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let file_name = format!("{stem}_compressed.{}", format.extension());
    match output_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(file_name),
        _ => source
            .parent()
            .map(|p| p.join(&file_name))
            .unwrap_or_else(|| PathBuf::from(&file_name)),
    }
}
