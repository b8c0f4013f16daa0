use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::JobError;
use crate::record::{JobId, JobRecord, JobStatus, StatusEvent, StatusUpdate};

#[derive(Default)]
struct StoreInner {
    records: Vec<JobRecord>,
    index: HashMap<JobId, usize>,
}

impl StoreInner {
    fn all_terminal(&self) -> bool {
        !self.records.is_empty() && self.records.iter().all(|r| r.status.is_terminal())
    }

    fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.records.len(),
            ..Progress::default()
        };
        for record in &self.records {
            match record.status {
                JobStatus::Pending => progress.pending += 1,
                JobStatus::Processing => progress.processing += 1,
                JobStatus::Completed => progress.completed += 1,
                JobStatus::Failed | JobStatus::Errored => progress.failed += 1,
            }
        }
        progress
    }
}

/// Counts per status bucket, taken from one consistent view of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl Progress {
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    /// Fraction of jobs in a terminal state; 0.0 for an empty store.
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.finished() as f32 / self.total as f32
        }
    }
}

/// What `apply_event` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated(JobStatus),
    /// No record with that id, e.g. the store was cleared after a cancel.
    UnknownJob,
    Rejected {
        from: JobStatus,
        to: JobStatus,
    },
}

/// Insertion-ordered job records keyed by [`JobId`].
///
/// Mutation needs `&mut self`, so whoever owns the store is its only writer.
/// Observers on other threads hold a [`StoreReader`].
#[derive(Default)]
pub struct JobStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader {
            inner: self.inner.clone(),
        }
    }

    pub fn register(&mut self, source_path: impl Into<PathBuf>) -> JobId {
        self.register_sized(source_path, None)
    }

    /// Register with the original size already known to the caller.
    pub fn register_sized(
        &mut self,
        source_path: impl Into<PathBuf>,
        original_size: Option<u64>,
    ) -> JobId {
        let record = JobRecord::new(source_path.into(), original_size);
        let id = record.id;
        let mut inner = self.inner.write();
        let pos = inner.records.len();
        inner.records.push(record);
        inner.index.insert(id, pos);
        id
    }

    pub fn apply_event(&mut self, event: StatusEvent) -> Applied {
        let mut inner = self.inner.write();
        let Some(&pos) = inner.index.get(&event.id) else {
            tracing::debug!(job = %event.id, "dropping event for unknown job");
            return Applied::UnknownJob;
        };
        let record = &mut inner.records[pos];
        let next = event.update.status();
        if !record.status.can_transition_to(next) {
            tracing::warn!(
                job = %event.id,
                from = %record.status,
                to = %next,
                "rejecting out-of-order status event"
            );
            return Applied::Rejected {
                from: record.status,
                to: next,
            };
        }

        record.status = next;
        match event.update {
            StatusUpdate::Processing => {}
            StatusUpdate::Completed {
                compressed_size,
                output_path,
            } => {
                record.compressed_size = Some(compressed_size);
                record.output_path = Some(output_path);
            }
            StatusUpdate::Failed { detail } | StatusUpdate::Errored { detail } => {
                record.failure_detail = Some(detail);
            }
        }
        Applied::Updated(next)
    }

    /// Remove every record. Refused while any record is not terminal.
    pub fn clear(&mut self) -> Result<usize, JobError> {
        let mut inner = self.inner.write();
        if !inner.records.is_empty() && !inner.all_terminal() {
            let unfinished = inner
                .records
                .iter()
                .filter(|r| !r.status.is_terminal())
                .count();
            return Err(JobError::OperationNotPermitted { unfinished });
        }
        let removed = inner.records.len();
        inner.records.clear();
        inner.index.clear();
        Ok(removed)
    }

    pub fn all_terminal(&self) -> bool {
        self.inner.read().all_terminal()
    }

    /// True when none of `ids` is still `Pending` or `Processing`. Ids that
    /// are no longer in the store count as finished.
    pub fn all_terminal_of(&self, ids: &[JobId]) -> bool {
        let inner = self.inner.read();
        ids.iter().all(|id| {
            inner
                .index
                .get(id)
                .map_or(true, |&pos| inner.records[pos].status.is_terminal())
        })
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.inner.read().records.clone()
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        let inner = self.inner.read();
        inner.index.get(&id).map(|&pos| inner.records[pos].clone())
    }

    pub fn progress(&self) -> Progress {
        self.inner.read().progress()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids and paths of every `Pending` record, in registration order.
    pub(crate) fn pending(&self) -> Vec<(JobId, PathBuf)> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.status == JobStatus::Pending)
            .map(|r| (r.id, r.source_path.clone()))
            .collect()
    }
}

/// Read-only handle onto a [`JobStore`], cheap to clone and send.
#[derive(Clone)]
pub struct StoreReader {
    inner: Arc<RwLock<StoreInner>>,
}

impl StoreReader {
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.inner.read().records.clone()
    }

    pub fn all_terminal(&self) -> bool {
        self.inner.read().all_terminal()
    }

    pub fn progress(&self) -> Progress {
        self.inner.read().progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(n: usize) -> (JobStore, Vec<JobId>) {
        let mut store = JobStore::new();
        let ids = (0..n)
            .map(|i| store.register(format!("/videos/clip{i}.mp4")))
            .collect();
        (store, ids)
    }

    #[test]
    fn test_register_keeps_insertion_order() {
        let (store, ids) = store_with(3);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
        assert!(snapshot.iter().all(|r| r.status == JobStatus::Pending));
    }

    #[test]
    fn test_duplicate_paths_get_distinct_records() {
        let mut store = JobStore::new();
        let a = store.register("/videos/same.mp4");
        let b = store.register("/videos/same.mp4");
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_apply_completed() {
        let (mut store, ids) = store_with(1);
        assert_eq!(
            store.apply_event(StatusEvent::processing(ids[0])),
            Applied::Updated(JobStatus::Processing)
        );
        store.apply_event(StatusEvent::completed(
            ids[0],
            2048,
            PathBuf::from("/videos/clip0_compressed.mp4"),
        ));
        let record = store.get(ids[0]).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.compressed_size, Some(2048));
        assert!(record.failure_detail.is_none());
    }

    #[test]
    fn test_apply_failed_sets_detail() {
        let (mut store, ids) = store_with(1);
        store.apply_event(StatusEvent::processing(ids[0]));
        store.apply_event(StatusEvent::failed(ids[0], "no video stream"));
        let record = store.get(ids[0]).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure_detail.as_deref(), Some("no video stream"));
        assert!(record.compressed_size.is_none());
    }

    #[test]
    fn test_unknown_job_is_noop() {
        let (mut store, _) = store_with(1);
        let before = store.snapshot();
        assert_eq!(
            store.apply_event(StatusEvent::processing(JobId::new())),
            Applied::UnknownJob
        );
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_out_of_order_events_rejected() {
        let (mut store, ids) = store_with(1);
        assert_eq!(
            store.apply_event(StatusEvent::completed(ids[0], 1, PathBuf::from("/o.mp4"))),
            Applied::Rejected {
                from: JobStatus::Pending,
                to: JobStatus::Completed
            }
        );
        store.apply_event(StatusEvent::processing(ids[0]));
        store.apply_event(StatusEvent::errored(ids[0], "disk full"));
        assert!(matches!(
            store.apply_event(StatusEvent::processing(ids[0])),
            Applied::Rejected { .. }
        ));
        assert_eq!(store.get(ids[0]).unwrap().status, JobStatus::Errored);
    }

    #[test]
    fn test_all_terminal() {
        let mut empty = JobStore::new();
        assert!(!empty.all_terminal());
        assert_eq!(empty.clear(), Ok(0));

        let (mut store, ids) = store_with(2);
        assert!(!store.all_terminal());
        for id in &ids {
            store.apply_event(StatusEvent::processing(*id));
        }
        assert!(!store.all_terminal());
        store.apply_event(StatusEvent::failed(ids[0], "bad input"));
        assert!(!store.all_terminal());
        store.apply_event(StatusEvent::completed(ids[1], 10, PathBuf::from("/o.mp4")));
        assert!(store.all_terminal());
    }

    #[test]
    fn test_clear_refused_until_terminal() {
        let (mut store, ids) = store_with(2);
        store.apply_event(StatusEvent::processing(ids[0]));
        store.apply_event(StatusEvent::completed(ids[0], 10, PathBuf::from("/o.mp4")));
        let before = store.snapshot();

        assert_eq!(
            store.clear(),
            Err(JobError::OperationNotPermitted { unfinished: 1 })
        );
        assert_eq!(store.snapshot(), before);

        store.apply_event(StatusEvent::processing(ids[1]));
        store.apply_event(StatusEvent::errored(ids[1], "boom"));
        assert_eq!(store.clear(), Ok(2));
        assert!(store.is_empty());
        assert_eq!(
            store.apply_event(StatusEvent::processing(ids[1])),
            Applied::UnknownJob
        );
    }

    #[test]
    fn test_progress_counts() {
        let (mut store, ids) = store_with(4);
        store.apply_event(StatusEvent::processing(ids[0]));
        store.apply_event(StatusEvent::processing(ids[1]));
        store.apply_event(StatusEvent::failed(ids[1], "x"));
        let progress = store.reader().progress();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.pending, 2);
        assert_eq!(progress.processing, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.finished(), 1);
        assert!((progress.fraction() - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_reader_snapshot_from_other_thread() {
        let (mut store, ids) = store_with(1);
        let reader = store.reader();
        store.apply_event(StatusEvent::processing(ids[0]));
        let handle = std::thread::spawn(move || reader.snapshot());
        let snapshot = handle.join().unwrap();
        assert_eq!(snapshot[0].status, JobStatus::Processing);
    }

    #[test]
    fn test_all_terminal_of_ignores_other_jobs() {
        let (mut store, ids) = store_with(3);
        store.apply_event(StatusEvent::processing(ids[0]));
        store.apply_event(StatusEvent::processing(ids[1]));
        store.apply_event(StatusEvent::failed(ids[1], "no video stream"));

        assert!(store.all_terminal_of(&ids[1..2]));
        assert!(!store.all_terminal_of(&ids[..2]));
        assert!(!store.all_terminal_of(&ids[2..]));
        assert!(!store.all_terminal());
        assert!(store.all_terminal_of(&[JobId::new()]));
    }
}
