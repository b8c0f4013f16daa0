use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::channel::StatusChannel;
use crate::encoder::{CancelToken, Encoder};
use crate::error::JobError;
use crate::pool::{JobTicket, WorkerPool};
use crate::record::{JobId, JobRecord, JobStatus};
use crate::settings::EncodeSettings;
use crate::store::{Applied, JobStore, Progress, StoreReader};

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
pub const MAX_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// How often the drain step runs.
    pub tick_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_tick_ms(ms: u64) -> Result<Self, JobError> {
        let config = Self {
            tick_interval: Duration::from_millis(ms),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.tick_interval.is_zero() || self.tick_interval > MAX_TICK {
            return Err(JobError::InvalidTickInterval(
                self.tick_interval.as_millis(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// No pool; a new run may be started.
    Idle,
    /// Jobs were submitted and the drain tick is waiting for them.
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    AllTerminal,
    Cancelled,
}

/// Result of one drain tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub applied: usize,
    /// Events for unknown ids or out-of-order transitions.
    pub dropped: usize,
    pub progress: Progress,
    /// This tick observed every job terminal and ended the run.
    pub finished: bool,
}

/// Owns the job store and status channel and runs batches through a
/// [`WorkerPool`].
///
/// All store writes happen on the thread that calls [`Orchestrator::tick`].
/// Workers only ever send events.
pub struct Orchestrator {
    store: JobStore,
    channel: StatusChannel,
    encoder: Arc<dyn Encoder>,
    config: OrchestratorConfig,
    pool: Option<WorkerPool>,
    /// Pools of cancelled runs whose workers may still be encoding.
    detached: Vec<WorkerPool>,
    /// Jobs submitted by the active run; completion is judged on these only.
    run_jobs: Vec<JobId>,
    cancel: Option<CancelToken>,
    phase: RunPhase,
    last_outcome: Option<RunOutcome>,
}

impl Orchestrator {
    pub fn new(encoder: Arc<dyn Encoder>, config: OrchestratorConfig) -> Result<Self, JobError> {
        config.validate()?;
        Ok(Self {
            store: JobStore::new(),
            channel: StatusChannel::new(),
            encoder,
            config,
            pool: None,
            detached: Vec::new(),
            run_jobs: Vec::new(),
            cancel: None,
            phase: RunPhase::Idle,
            last_outcome: None,
        })
    }

    pub fn register(&mut self, source_path: impl Into<PathBuf>) -> JobId {
        self.store.register(source_path)
    }

    pub fn register_sized(
        &mut self,
        source_path: impl Into<PathBuf>,
        original_size: Option<u64>,
    ) -> JobId {
        self.store.register_sized(source_path, original_size)
    }

    /// Submit every `Pending` job to a fresh pool of `concurrency` workers.
    ///
    /// Jobs still encoding on a cancelled run's workers take up slots: the new
    /// pool gets `concurrency - stragglers` workers, and the run is refused
    /// with [`JobError::StragglersInFlight`] when they fill every slot.
    /// Returns the number of jobs submitted. When nothing is pending the
    /// orchestrator stays idle and returns 0.
    pub fn start_run(
        &mut self,
        settings: EncodeSettings,
        concurrency: usize,
    ) -> Result<usize, JobError> {
        if self.phase == RunPhase::Running {
            return Err(JobError::RunInProgress);
        }
        if self.store.is_empty() {
            return Err(JobError::NoJobs);
        }
        if concurrency == 0 {
            return Err(JobError::InvalidConcurrency);
        }

        // Read the straggler set before draining: a job missing from it has
        // already sent its events, so the drain below moves it out of Pending.
        let mut stragglers = self.stragglers();
        self.apply_queued();
        stragglers.retain(|id| !self.status(*id).is_some_and(JobStatus::is_terminal));

        let pending: Vec<_> = self
            .store
            .pending()
            .into_iter()
            .filter(|(id, _)| !stragglers.contains(id))
            .collect();
        if pending.is_empty() {
            tracing::info!("no pending jobs; nothing to submit");
            return Ok(0);
        }
        if stragglers.len() >= concurrency {
            return Err(JobError::StragglersInFlight {
                in_flight: stragglers.len(),
            });
        }
        let workers = concurrency - stragglers.len();
        if !stragglers.is_empty() {
            tracing::warn!(
                stragglers = stragglers.len(),
                workers,
                "cancelled jobs still encoding; starting a smaller pool"
            );
        }

        let pool = WorkerPool::start(workers, self.encoder.clone(), self.channel.sender())?;
        let cancel = CancelToken::new();
        let settings = Arc::new(settings);
        for (id, source) in &pending {
            pool.submit(JobTicket {
                id: *id,
                source: source.clone(),
                settings: settings.clone(),
                cancel: cancel.clone(),
            })?;
        }

        tracing::info!(
            jobs = pending.len(),
            workers,
            format = %settings.format,
            quality = %settings.quality,
            "run started"
        );
        self.pool = Some(pool);
        self.run_jobs = pending.iter().map(|(id, _)| *id).collect();
        self.cancel = Some(cancel);
        self.phase = RunPhase::Running;
        self.last_outcome = None;
        Ok(self.run_jobs.len())
    }

    /// Ids still held by workers of cancelled runs. Forgets pools whose
    /// workers have all reported.
    fn stragglers(&mut self) -> HashSet<JobId> {
        self.detached.retain(|pool| pool.busy() > 0);
        self.detached
            .iter()
            .flat_map(WorkerPool::in_flight)
            .collect()
    }

    /// Apply every queued status event, then check for completion.
    ///
    /// Events are applied even when no run is active, so stragglers from a
    /// cancelled run still land in the store. A run ends once every job it
    /// submitted is terminal.
    pub fn tick(&mut self) -> TickReport {
        let (applied, dropped) = self.apply_queued();

        let mut finished = false;
        if self.phase == RunPhase::Running && self.store.all_terminal_of(&self.run_jobs) {
            self.finish_run();
            finished = true;
        }

        TickReport {
            applied,
            dropped,
            progress: self.store.progress(),
            finished,
        }
    }

    fn apply_queued(&mut self) -> (usize, usize) {
        let mut applied = 0;
        let mut dropped = 0;
        for event in self.channel.drain_all() {
            let id = event.id;
            match self.store.apply_event(event) {
                Applied::Updated(status) => {
                    applied += 1;
                    tracing::debug!(job = %id.short(), %status, "status applied");
                }
                Applied::UnknownJob | Applied::Rejected { .. } => dropped += 1,
            }
        }
        (applied, dropped)
    }

    fn finish_run(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown(true);
        }
        self.cancel = None;
        self.run_jobs.clear();
        self.phase = RunPhase::Idle;
        self.last_outcome = Some(RunOutcome::AllTerminal);
        let progress = self.store.progress();
        tracing::info!(
            completed = progress.completed,
            failed = progress.failed,
            "run finished"
        );
    }

    /// Stop the active run without waiting for jobs already encoding.
    ///
    /// Queued jobs stay `Pending`. Running jobs may still report later; those
    /// events are applied by later ticks. Returns false when nothing was
    /// running.
    pub fn cancel(&mut self) -> bool {
        if self.phase != RunPhase::Running {
            return false;
        }
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        let mut in_flight = 0;
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown(false);
            in_flight = pool.busy();
            self.detached.push(pool);
        }
        self.run_jobs.clear();
        self.phase = RunPhase::Idle;
        self.last_outcome = Some(RunOutcome::Cancelled);
        tracing::warn!(in_flight, "run cancelled");
        true
    }

    /// After a cancel, keep ticking until no job is `Processing` or `timeout`
    /// has passed, so encoders that honour the cancel token get to report.
    pub fn settle(&mut self, timeout: Duration) -> TickReport {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.tick();
            if report.progress.processing == 0 || Instant::now() >= deadline {
                return report;
            }
            thread::sleep(self.config.tick_interval);
        }
    }

    /// Tick on the configured cadence until the run ends.
    ///
    /// `observe` sees every tick report; returning `Break` cancels the run.
    pub fn drive<F>(&mut self, mut observe: F) -> Option<RunOutcome>
    where
        F: FnMut(&TickReport, &Orchestrator) -> ControlFlow<()>,
    {
        loop {
            if self.phase == RunPhase::Idle {
                return self.last_outcome;
            }
            thread::sleep(self.config.tick_interval);
            let report = self.tick();
            if observe(&report, self).is_break() && self.cancel() {
                return Some(RunOutcome::Cancelled);
            }
            if report.finished {
                return Some(RunOutcome::AllTerminal);
            }
        }
    }

    /// Drop every record. Refused while any job is not terminal.
    pub fn clear(&mut self) -> Result<usize, JobError> {
        let removed = self.store.clear()?;
        tracing::info!(removed, "job list cleared");
        Ok(removed)
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.store.snapshot()
    }

    pub fn reader(&self) -> StoreReader {
        self.store.reader()
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn progress(&self) -> Progress {
        self.store.progress()
    }

    pub fn all_terminal(&self) -> bool {
        self.store.all_terminal()
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.store.get(id).map(|r| r.status)
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Whether the observer may start a run or change settings.
    pub fn controls_enabled(&self) -> bool {
        self.phase == RunPhase::Idle
    }

    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.last_outcome
    }

    /// Jobs inside an encoder right now, including those of cancelled runs.
    pub fn in_flight(&self) -> usize {
        self.pool
            .iter()
            .chain(&self.detached)
            .map(WorkerPool::busy)
            .sum()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.phase == RunPhase::Running {
            self.cancel();
        }
    }
}
