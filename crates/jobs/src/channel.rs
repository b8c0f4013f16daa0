use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::record::StatusEvent;

/// Unbounded FIFO carrying status events from workers to the orchestrator.
///
/// The channel keeps one sender of its own, so it never disconnects while it
/// is alive and `drain_all` only ever sees "empty", never "closed".
pub struct StatusChannel {
    tx: Sender<StatusEvent>,
    rx: Receiver<StatusEvent>,
}

/// Producer half handed to workers. Sending never blocks.
#[derive(Clone)]
pub struct StatusSender {
    tx: Sender<StatusEvent>,
}

impl StatusSender {
    pub fn send(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("status channel closed; event dropped");
        }
    }
}

impl StatusChannel {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> StatusSender {
        StatusSender {
            tx: self.tx.clone(),
        }
    }

    /// Remove and return everything queued right now, oldest first.
    pub fn drain_all(&self) -> Vec<StatusEvent> {
        self.rx.try_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}
