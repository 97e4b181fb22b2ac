//! Cross-thread handoff between the worker and the host thread.
//!
//! Both channels are created per run. The worker only ever holds the sending
//! halves; the host thread owns the receiving halves and is the only side that
//! drains them.

use crate::error::LauncherError;
use crate::model::DeliveryItem;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Deferred action the host thread must react to.
#[derive(Debug)]
pub enum Completion {
    /// The procedure failed; replayed on the host thread with its message intact.
    Failed(LauncherError),
    /// Terminal action, sent exactly once per run.
    Stop,
}

pub(crate) fn completion_channel() -> (CompletionSender, CompletionQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionSender { tx }, CompletionQueue { rx })
}

pub(crate) fn delivery_channel() -> (DeliverySender, DeliveryQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliverySender { tx }, DeliveryQueue { rx })
}

/// Worker side of the completion channel.
pub(crate) struct CompletionSender {
    tx: UnboundedSender<Completion>,
}

impl CompletionSender {
    pub fn fail(&self, err: LauncherError) {
        tracing::debug!(error = %err, "queueing failure completion");
        // A closed channel means the host already tore the run down.
        let _ = self.tx.send(Completion::Failed(err));
    }

    /// Send the terminal action. Consumes the sender so it can only happen once.
    pub fn stop(self) {
        let _ = self.tx.send(Completion::Stop);
    }
}

/// Host side of the completion channel.
pub(crate) struct CompletionQueue {
    rx: UnboundedReceiver<Completion>,
}

impl CompletionQueue {
    pub fn try_next(&mut self) -> Result<Completion, TryRecvError> {
        self.rx.try_recv()
    }
}

/// Worker side of the delivery channel.
#[derive(Clone)]
pub struct DeliverySender {
    tx: UnboundedSender<DeliveryItem>,
}

impl DeliverySender {
    pub fn send(&self, item: DeliveryItem) {
        tracing::debug!(name = %item.name, path = %item.path.display(), "queueing delivery");
        if let Err(err) = self.tx.send(item) {
            tracing::warn!(name = %err.0.name, "delivery channel closed, dropping item");
        }
    }
}

/// Counters for one or more pump passes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub loaded: usize,
    pub failed: usize,
}

impl PumpStats {
    pub fn add(&mut self, other: PumpStats) {
        self.loaded += other.loaded;
        self.failed += other.failed;
    }
}

/// Host side of the delivery channel.
pub(crate) struct DeliveryQueue {
    rx: UnboundedReceiver<DeliveryItem>,
}

impl DeliveryQueue {
    /// Load every queued item in FIFO order.
    ///
    /// Stops taking new items once `cancel` is set; an item that was already
    /// popped is still loaded.
    pub fn pump(
        &mut self,
        cancel: &CancellationToken,
        loader: &mut dyn FnMut(&DeliveryItem) -> bool,
    ) -> PumpStats {
        let mut stats = PumpStats::default();
        while !cancel.is_cancelled() {
            let Ok(item) = self.rx.try_recv() else {
                break;
            };
            load_one(&item, loader, &mut stats);
        }
        stats
    }

    /// Load everything still queued, regardless of cancellation.
    pub fn drain(&mut self, loader: &mut dyn FnMut(&DeliveryItem) -> bool) -> PumpStats {
        let mut stats = PumpStats::default();
        while let Ok(item) = self.rx.try_recv() {
            load_one(&item, loader, &mut stats);
        }
        stats
    }

    /// Close the channel and drop whatever is still queued.
    pub fn discard(&mut self) -> usize {
        self.rx.close();
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

fn load_one(
    item: &DeliveryItem,
    loader: &mut dyn FnMut(&DeliveryItem) -> bool,
    stats: &mut PumpStats,
) {
    tracing::info!("Loading {}...", item.name);
    if loader(item) {
        tracing::info!("done loading {}", item.name);
        stats.loaded += 1;
    } else {
        tracing::warn!(path = %item.path.display(), "Error loading {}", item.name);
        stats.failed += 1;
    }
}
