//! Batch transcoding jobs: a bounded worker pool, a status channel from the
//! workers back to a single owner, and the per-job state that owner renders.

mod channel;
mod encoder;
mod error;
mod orchestrator;
mod pool;
mod record;
mod settings;
mod store;

pub use channel::{StatusChannel, StatusSender};
pub use encoder::{CancelToken, EncodeOutcome, EncodeRequest, Encoder, FfmpegEncoder};
pub use error::JobError;
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, RunOutcome, RunPhase, TickReport, DEFAULT_TICK, MAX_TICK,
};
pub use pool::{JobTicket, WorkerPool};
pub use record::{JobId, JobRecord, JobStatus, StatusEvent, StatusUpdate};
pub use settings::{output_path, EncodeSettings, OutputFormat, Quality};
pub use store::{Applied, JobStore, Progress, StoreReader};
