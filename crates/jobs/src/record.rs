use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines and tables.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Errored,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Errored
        )
    }

    /// Statuses only move forward: `Pending -> Processing -> terminal`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Processing, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered source file and where it is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub source_path: PathBuf,
    pub status: JobStatus,
    pub original_size: Option<u64>,
    /// Set only once the job is `Completed`.
    pub compressed_size: Option<u64>,
    pub output_path: Option<PathBuf>,
    /// Set only when the job is `Failed` or `Errored`.
    pub failure_detail: Option<String>,
}

impl JobRecord {
    pub(crate) fn new(source_path: PathBuf, original_size: Option<u64>) -> Self {
        Self {
            id: JobId::new(),
            source_path,
            status: JobStatus::Pending,
            original_size,
            compressed_size: None,
            output_path: None,
            failure_detail: None,
        }
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.source_path)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Status change reported by a worker, with the data that goes with it.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Processing,
    Completed {
        compressed_size: u64,
        output_path: PathBuf,
    },
    Failed {
        detail: String,
    },
    Errored {
        detail: String,
    },
}

impl StatusUpdate {
    pub fn status(&self) -> JobStatus {
        match self {
            StatusUpdate::Processing => JobStatus::Processing,
            StatusUpdate::Completed { .. } => JobStatus::Completed,
            StatusUpdate::Failed { .. } => JobStatus::Failed,
            StatusUpdate::Errored { .. } => JobStatus::Errored,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub id: JobId,
    pub update: StatusUpdate,
}

impl StatusEvent {
    pub fn processing(id: JobId) -> Self {
        Self {
            id,
            update: StatusUpdate::Processing,
        }
    }

    pub fn completed(id: JobId, compressed_size: u64, output_path: PathBuf) -> Self {
        Self {
            id,
            update: StatusUpdate::Completed {
                compressed_size,
                output_path,
            },
        }
    }

    pub fn failed(id: JobId, detail: impl Into<String>) -> Self {
        Self {
            id,
            update: StatusUpdate::Failed {
                detail: detail.into(),
            },
        }
    }

    pub fn errored(id: JobId, detail: impl Into<String>) -> Self {
        Self {
            id,
            update: StatusUpdate::Errored {
                detail: detail.into(),
            },
        }
    }
}
