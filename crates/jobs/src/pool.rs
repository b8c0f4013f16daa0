use anyhow::Context;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::channel::StatusSender;
use crate::encoder::{CancelToken, EncodeOutcome, EncodeRequest, Encoder};
use crate::error::JobError;
use crate::record::{JobId, StatusEvent};
use crate::settings::EncodeSettings;

/// Everything a worker needs to run one job.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub id: JobId,
    pub source: PathBuf,
    pub settings: Arc<EncodeSettings>,
    pub cancel: CancelToken,
}

/// Fixed set of worker threads pulling tickets from a shared FIFO queue.
///
/// Each worker runs one job at a time, so at most `size` jobs run at once.
///
/// A job is in flight from the moment a worker claims its ticket until its
/// terminal event has been sent. Claiming and abandoning share one lock, so
/// once [`WorkerPool::shutdown`] without waiting returns, the in-flight set
/// can only shrink.
pub struct WorkerPool {
    tx_jobs: Option<Sender<JobTicket>>,
    workers: Vec<thread::JoinHandle<()>>,
    abandoned: Arc<AtomicBool>,
    active: Arc<Mutex<HashSet<JobId>>>,
}

impl WorkerPool {
    pub fn start(
        size: usize,
        encoder: Arc<dyn Encoder>,
        events: StatusSender,
    ) -> Result<Self, JobError> {
        if size == 0 {
            return Err(JobError::InvalidConcurrency);
        }
        let (tx_jobs, rx_jobs) = unbounded::<JobTicket>();
        let abandoned = Arc::new(AtomicBool::new(false));
        let active = Arc::new(Mutex::new(HashSet::new()));

        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let rx = rx_jobs.clone();
            let encoder = encoder.clone();
            let events = events.clone();
            let abandoned = abandoned.clone();
            let active = active.clone();
            let handle = thread::Builder::new()
                .name(format!("encode-worker-{n}"))
                .spawn(move || worker_loop(rx, encoder.as_ref(), &events, &abandoned, &active))
                .map_err(|e| JobError::WorkerSpawn(e.to_string()))?;
            workers.push(handle);
        }
        tracing::debug!(size, "worker pool started");

        Ok(Self {
            tx_jobs: Some(tx_jobs),
            workers,
            abandoned,
            active,
        })
    }

    /// Queue a job. Never blocks; the job starts as soon as a worker is free.
    pub fn submit(&self, ticket: JobTicket) -> Result<(), JobError> {
        let tx = self.tx_jobs.as_ref().ok_or(JobError::PoolShutDown)?;
        tx.send(ticket).map_err(|_| JobError::PoolShutDown)
    }

    /// Stop accepting jobs.
    ///
    /// With `wait_for_in_flight` the queue is worked off and every worker is
    /// joined. Without it, queued jobs are never started and running jobs are
    /// left to finish on their own; their final events may or may not arrive.
    pub fn shutdown(&mut self, wait_for_in_flight: bool) {
        if !wait_for_in_flight {
            let _claims = self.active.lock();
            self.abandoned.store(true, Ordering::Release);
        }
        // workers exit once the queue is closed and empty
        self.tx_jobs.take();

        if wait_for_in_flight {
            for handle in self.workers.drain(..) {
                if handle.join().is_err() {
                    tracing::warn!("encode worker exited by panic");
                }
            }
        } else {
            let detached = self.workers.len();
            self.workers.clear();
            tracing::debug!(detached, "worker pool abandoned");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx_jobs.is_none()
    }

    /// Number of jobs claimed by a worker whose terminal event is not sent yet.
    pub fn busy(&self) -> usize {
        self.active.lock().len()
    }

    pub fn in_flight(&self) -> Vec<JobId> {
        self.active.lock().iter().copied().collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            self.shutdown(false);
        }
    }
}

fn worker_loop(
    rx: Receiver<JobTicket>,
    encoder: &dyn Encoder,
    events: &StatusSender,
    abandoned: &AtomicBool,
    active: &Mutex<HashSet<JobId>>,
) {
    while let Ok(ticket) = rx.recv() {
        {
            let mut claims = active.lock();
            if abandoned.load(Ordering::Acquire) {
                tracing::debug!(job = %ticket.id, "pool abandoned; job not started");
                break;
            }
            claims.insert(ticket.id);
        }
        run_job(encoder, &ticket, events);
        active.lock().remove(&ticket.id);
    }
}

/// Report `Processing`, encode, then report exactly one terminal status.
fn run_job(encoder: &dyn Encoder, ticket: &JobTicket, events: &StatusSender) {
    events.send(StatusEvent::processing(ticket.id));
    tracing::info!(job = %ticket.id.short(), source = %ticket.source.display(), "encoding");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| encode_and_measure(encoder, ticket)));
    let event = match outcome {
        Ok(Ok(event)) => event,
        Ok(Err(err)) => {
            tracing::error!(job = %ticket.id.short(), "encode fault: {err:#}");
            StatusEvent::errored(ticket.id, format!("{err:#}"))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(job = %ticket.id.short(), "encoder panicked: {message}");
            StatusEvent::errored(ticket.id, format!("encoder panicked: {message}"))
        }
    };
    events.send(event);
}

fn encode_and_measure(encoder: &dyn Encoder, ticket: &JobTicket) -> anyhow::Result<StatusEvent> {
    let output = ticket.settings.output_path_for(&ticket.source);
    let request = EncodeRequest {
        source: &ticket.source,
        output: &output,
        format: ticket.settings.format,
        quality: ticket.settings.quality,
        mute: ticket.settings.mute,
        cancel: &ticket.cancel,
    };

    match encoder.transcode(&request)? {
        EncodeOutcome::Success { output_path } => {
            let size = std::fs::metadata(&output_path)
                .with_context(|| format!("read size of {}", output_path.display()))?
                .len();
            Ok(StatusEvent::completed(ticket.id, size, output_path))
        }
        EncodeOutcome::Failure { diagnostic } => Ok(StatusEvent::failed(ticket.id, diagnostic)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StatusChannel;
    use crate::record::StatusUpdate;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// Writes a small output file after a short sleep and tracks overlap.
    struct SleepyEncoder {
        delay: Duration,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl SleepyEncoder {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }
    }

    impl Encoder for SleepyEncoder {
        fn transcode(&self, request: &EncodeRequest<'_>) -> anyhow::Result<EncodeOutcome> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.delay);
            std::fs::write(request.output, b"encoded")?;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(EncodeOutcome::Success {
                output_path: request.output.to_path_buf(),
            })
        }
    }

    struct FnEncoder<F>(F);

    fn encoder_fn<F>(f: F) -> Arc<FnEncoder<F>>
    where
        F: Fn(&EncodeRequest<'_>) -> anyhow::Result<EncodeOutcome> + Send + Sync,
    {
        Arc::new(FnEncoder(f))
    }

    impl<F> Encoder for FnEncoder<F>
    where
        F: Fn(&EncodeRequest<'_>) -> anyhow::Result<EncodeOutcome> + Send + Sync,
    {
        fn transcode(&self, request: &EncodeRequest<'_>) -> anyhow::Result<EncodeOutcome> {
            (self.0)(request)
        }
    }

    fn ticket(dir: &std::path::Path, name: &str) -> JobTicket {
        let source = dir.join(name);
        std::fs::write(&source, b"source bytes").unwrap();
        JobTicket {
            id: JobId::new(),
            source,
            settings: Arc::new(EncodeSettings::default()),
            cancel: CancelToken::new(),
        }
    }

    fn collect_until(channel: &StatusChannel, count: usize) -> Vec<StatusEvent> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut events = Vec::new();
        while events.len() < count && Instant::now() < deadline {
            events.extend(channel.drain_all());
            thread::sleep(Duration::from_millis(5));
        }
        events
    }

    #[test]
    fn test_zero_workers_rejected() {
        let channel = StatusChannel::new();
        let result = WorkerPool::start(0, Arc::new(FfmpegLike), channel.sender());
        assert!(matches!(result, Err(JobError::InvalidConcurrency)));
    }

    struct FfmpegLike;
    impl Encoder for FfmpegLike {
        fn transcode(&self, _request: &EncodeRequest<'_>) -> anyhow::Result<EncodeOutcome> {
            Ok(EncodeOutcome::Failure {
                diagnostic: "unused".into(),
            })
        }
    }

    #[test]
    fn test_concurrency_never_exceeds_pool_size() {
        let dir = tempfile::tempdir().unwrap();
        let channel = StatusChannel::new();
        let encoder = Arc::new(SleepyEncoder::new(Duration::from_millis(30)));
        let mut pool = WorkerPool::start(2, encoder.clone(), channel.sender()).unwrap();

        for i in 0..6 {
            pool.submit(ticket(dir.path(), &format!("clip{i}.mp4"))).unwrap();
        }
        pool.shutdown(true);

        assert_eq!(encoder.max_running.load(Ordering::SeqCst), 2);
        let events = channel.drain_all();
        assert_eq!(events.len(), 12);
        let completed = events
            .iter()
            .filter(|e| matches!(e.update, StatusUpdate::Completed { .. }))
            .count();
        assert_eq!(completed, 6);
    }

    #[test]
    fn test_processing_precedes_terminal_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let channel = StatusChannel::new();
        let encoder = Arc::new(SleepyEncoder::new(Duration::from_millis(5)));
        let mut pool = WorkerPool::start(3, encoder, channel.sender()).unwrap();
        let tickets: Vec<_> = (0..5)
            .map(|i| ticket(dir.path(), &format!("c{i}.mov")))
            .collect();
        for t in &tickets {
            pool.submit(t.clone()).unwrap();
        }
        pool.shutdown(true);

        let events = channel.drain_all();
        for t in &tickets {
            let mine: Vec<_> = events.iter().filter(|e| e.id == t.id).collect();
            assert_eq!(mine.len(), 2);
            assert_eq!(mine[0].update, StatusUpdate::Processing);
            assert!(mine[1].update.status().is_terminal());
        }
    }

    #[test]
    fn test_completed_carries_output_size() {
        let dir = tempfile::tempdir().unwrap();
        let channel = StatusChannel::new();
        let encoder = Arc::new(SleepyEncoder::new(Duration::ZERO));
        let mut pool = WorkerPool::start(1, encoder, channel.sender()).unwrap();
        let t = ticket(dir.path(), "holiday.mp4");
        pool.submit(t.clone()).unwrap();
        pool.shutdown(true);

        let events = channel.drain_all();
        assert_eq!(
            events[1].update,
            StatusUpdate::Completed {
                compressed_size: 7,
                output_path: dir.path().join("holiday_compressed.mp4"),
            }
        );
    }

    #[test]
    fn test_failure_fault_and_panic_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let channel = StatusChannel::new();
        let encoder = encoder_fn(|req| {
            let name = req.source.file_name().unwrap().to_string_lossy().into_owned();
            match name.as_str() {
                "audio.mp4" => Ok(EncodeOutcome::Failure {
                    diagnostic: "no video stream".into(),
                }),
                "fault.mp4" => Err(anyhow!("permission denied")),
                "panic.mp4" => panic!("decoder exploded"),
                // success without writing output: size lookup fails
                _ => Ok(EncodeOutcome::Success {
                    output_path: req.output.to_path_buf(),
                }),
            }
        });
        let mut pool = WorkerPool::start(1, encoder, channel.sender()).unwrap();
        let names = ["audio.mp4", "fault.mp4", "panic.mp4", "ghost.mp4"];
        let tickets: Vec<_> = names.iter().map(|n| ticket(dir.path(), n)).collect();
        for t in &tickets {
            pool.submit(t.clone()).unwrap();
        }
        pool.shutdown(true);

        let events = channel.drain_all();
        let terminal = |id: JobId| {
            events
                .iter()
                .find(|e| e.id == id && e.update.status().is_terminal())
                .map(|e| e.update.clone())
                .unwrap()
        };
        assert_eq!(
            terminal(tickets[0].id),
            StatusUpdate::Failed {
                detail: "no video stream".into()
            }
        );
        assert_eq!(
            terminal(tickets[1].id),
            StatusUpdate::Errored {
                detail: "permission denied".into()
            }
        );
        assert_eq!(
            terminal(tickets[2].id),
            StatusUpdate::Errored {
                detail: "encoder panicked: decoder exploded".into()
            }
        );
        assert!(matches!(
            terminal(tickets[3].id),
            StatusUpdate::Errored { detail } if detail.starts_with("read size of")
        ));
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let channel = StatusChannel::new();
        let mut pool = WorkerPool::start(1, Arc::new(FfmpegLike), channel.sender()).unwrap();
        pool.shutdown(true);
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            pool.submit(ticket(dir.path(), "late.mp4")),
            Err(JobError::PoolShutDown)
        );
    }

    #[test]
    fn test_abandon_skips_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let channel = StatusChannel::new();
        let (started_tx, started_rx) = crossbeam_channel::unbounded::<()>();
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let encoder = encoder_fn(move |req| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            std::fs::write(req.output, b"out")?;
            Ok(EncodeOutcome::Success {
                output_path: req.output.to_path_buf(),
            })
        });
        let mut pool = WorkerPool::start(1, encoder, channel.sender()).unwrap();
        let tickets: Vec<_> = (0..3)
            .map(|i| ticket(dir.path(), &format!("q{i}.mp4")))
            .collect();
        for t in &tickets {
            pool.submit(t.clone()).unwrap();
        }
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.in_flight(), vec![tickets[0].id]);

        pool.shutdown(false);
        assert_eq!(pool.busy(), 1);
        release_tx.send(()).unwrap();

        let events = collect_until(&channel, 2);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.id == tickets[0].id));
        thread::sleep(Duration::from_millis(50));
        assert!(channel.drain_all().is_empty());
        assert_eq!(pool.busy(), 0);
    }
}
