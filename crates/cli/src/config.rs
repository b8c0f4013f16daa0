use anyhow::{Context, Result};
use jobs::{EncodeSettings, OrchestratorConfig, OutputFormat, Quality};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_PARALLEL: usize = 2;
const DEFAULT_TICK_MS: u64 = 100;

/// Settings file contents. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub parallel: Option<usize>,
    pub tick_ms: Option<u64>,
    pub format: Option<OutputFormat>,
    pub quality: Option<Quality>,
    pub mute: Option<bool>,
    pub output_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read settings file {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("parse settings file {}", path.display()))
    }

    /// Load `path` when given, else the per-user settings file if it exists.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "using settings file");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("vidpress").join("settings.json"))
}

/// Command-line values; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub parallel: Option<usize>,
    pub tick_ms: Option<u64>,
    pub format: Option<OutputFormat>,
    pub quality: Option<u8>,
    pub mute: bool,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub parallel: usize,
    pub orchestrator: OrchestratorConfig,
    pub encode: EncodeSettings,
}

impl RunConfig {
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self> {
        let parallel = cli.parallel.or(file.parallel).unwrap_or(DEFAULT_PARALLEL);
        if parallel == 0 {
            anyhow::bail!("parallel must be at least 1");
        }
        let tick_ms = cli.tick_ms.or(file.tick_ms).unwrap_or(DEFAULT_TICK_MS);
        let orchestrator = OrchestratorConfig::with_tick_ms(tick_ms)?;

        let quality = match cli.quality {
            Some(q) => Quality::new(q)?,
            None => file.quality.unwrap_or_default(),
        };
        let encode = EncodeSettings {
            format: cli.format.or(file.format).unwrap_or_default(),
            quality,
            mute: cli.mute || file.mute.unwrap_or(false),
            output_dir: cli.output_dir.or(file.output_dir),
        };

        Ok(Self {
            parallel,
            orchestrator,
            encode,
        })
    }
}
