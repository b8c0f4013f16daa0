use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("no jobs registered")]
    NoJobs,
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("a run is already in progress")]
    RunInProgress,
    #[error("{in_flight} job(s) from a cancelled run are still encoding")]
    StragglersInFlight { in_flight: usize },
    #[error("operation not permitted: {unfinished} job(s) have not finished")]
    OperationNotPermitted { unfinished: usize },
    #[error("worker pool is shut down")]
    PoolShutDown,
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
    #[error("quality {0} is outside 0-51")]
    InvalidQuality(u8),
    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),
    #[error("tick interval must be between 1 and 200 ms, got {0} ms")]
    InvalidTickInterval(u128),
}

impl JobError {
    /// Errors raised synchronously by argument checks, before any work starts.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            JobError::NoJobs
                | JobError::InvalidConcurrency
                | JobError::RunInProgress
                | JobError::StragglersInFlight { .. }
                | JobError::InvalidQuality(_)
                | JobError::UnsupportedFormat(_)
                | JobError::InvalidTickInterval(_)
        )
    }
}
