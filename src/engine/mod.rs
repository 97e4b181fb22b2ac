//! Units of work executed on the worker thread.
//!
//! A procedure only touches the filesystem, the network and the external
//! toolkit. Everything it produces goes through the delivery channel; host
//! state is never reached from here.

pub(crate) mod algorithm;
pub(crate) mod download;
mod software;

pub(crate) use algorithm::{AlgorithmJob, AlgorithmLibrary, DriverCommand, FileVolume, RunRequest};
pub(crate) use download::{DownloadJob, Fetcher, HttpFetcher};

use crate::error::{LauncherError, Result};
use crate::model::{DeliveryItem, RunKind};
use crate::orchestrator::DeliverySender;
use tokio_util::sync::CancellationToken;

pub trait Procedure: Send + 'static {
    fn kind(&self) -> RunKind;

    fn run(self: Box<Self>, ctx: &WorkerContext) -> Result<()>;
}

/// What a procedure may use while running on the worker thread.
pub struct WorkerContext {
    delivery: DeliverySender,
    cancel: CancellationToken,
    /// Names the run in abort errors.
    label: String,
}

impl WorkerContext {
    pub fn new(delivery: DeliverySender, cancel: CancellationToken) -> Self {
        Self {
            delivery,
            cancel,
            label: "Run".to_string(),
        }
    }

    pub fn with_kind(mut self, kind: &RunKind) -> Self {
        self.label = kind.to_string();
        self
    }

    /// Safe point: fail with [`LauncherError::Aborted`] once an abort was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(LauncherError::Aborted(self.label.clone()));
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deliver(&self, item: DeliveryItem) {
        self.delivery.send(item);
    }
}
