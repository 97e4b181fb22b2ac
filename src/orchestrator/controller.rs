//! Run lifecycle controller.
//!
//! Owns the single worker slot, starts runs, and tears them down on the host
//! thread once the worker reports completion.

use super::channels::{
    completion_channel, delivery_channel, Completion, CompletionQueue, CompletionSender,
    DeliveryQueue, PumpStats,
};
use crate::config::Settings;
use crate::engine::{
    AlgorithmJob, AlgorithmLibrary, DownloadJob, Fetcher, Procedure, RunRequest, WorkerContext,
};
use crate::error::{LauncherError, Result};
use crate::host::HostCallbacks;
use crate::model::{RunKind, RunOutcome, RunStatus};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Host-side state of the run in flight.
struct ActiveRun {
    kind: RunKind,
    cancel: CancellationToken,
    completions: CompletionQueue,
    deliveries: DeliveryQueue,
    started: Instant,
    next_pump: Instant,
    status: RunStatus,
    error: Option<String>,
    stats: PumpStats,
}

impl ActiveRun {
    /// Execute every queued completion. Returns true once the terminal one was seen.
    fn drain_completions(&mut self, host: &mut dyn HostCallbacks) -> bool {
        loop {
            match self.completions.try_next() {
                Ok(Completion::Failed(err)) => {
                    self.status = if err.is_aborted() {
                        RunStatus::Aborted
                    } else {
                        RunStatus::Failed
                    };
                    self.error = Some(err.to_string());
                    if let Err(e) = host.on_run_failed(&err) {
                        tracing::warn!("Error in completion handler: \"{e:#}\"");
                    }
                }
                Ok(Completion::Stop) => return true,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => {
                    tracing::warn!("worker exited without signalling completion");
                    self.status = RunStatus::Failed;
                    self.error
                        .get_or_insert_with(|| "worker exited unexpectedly".to_string());
                    return true;
                }
            }
        }
    }

    fn pump(&mut self, host: &mut dyn HostCallbacks) {
        let stats = self
            .deliveries
            .pump(&self.cancel, &mut |item| host.load_file(item));
        self.stats.add(stats);
    }
}

/// Control surface for front ends.
///
/// All methods are called from the host thread. At most one worker thread
/// exists at any time.
pub struct Launcher {
    settings: Settings,
    library: Arc<dyn AlgorithmLibrary>,
    fetcher: Arc<dyn Fetcher>,
    worker: Option<JoinHandle<()>>,
    active: Option<ActiveRun>,
}

impl Launcher {
    pub fn new(
        settings: Settings,
        library: Arc<dyn AlgorithmLibrary>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            settings,
            library,
            fetcher,
            worker: None,
            active: None,
        }
    }

    /// True while a worker is alive or its run has not been torn down yet.
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_idle(&self) -> bool {
        !self.is_busy()
    }

    pub fn current_kind(&self) -> Option<&RunKind> {
        self.active.as_ref().map(|run| &run.kind)
    }

    /// Validate `request` on this thread, then run it in the background.
    pub fn start_run(&mut self, request: RunRequest) -> Result<()> {
        self.ensure_idle()?;
        let job = AlgorithmJob::prepare(request, &self.settings, self.library.clone())?;
        tracing::debug!(images = job.images().len(), "prepared algorithm run");
        self.start(Box::new(job))
    }

    /// Download the files listed in catalog `catalog` in the background.
    pub fn start_download(&mut self, catalog: &str) -> Result<()> {
        self.ensure_idle()?;
        let job = DownloadJob::new(catalog, &self.settings, self.fetcher.clone());
        self.start(Box::new(job))
    }

    /// Run `procedure` on a fresh worker thread.
    pub fn start(&mut self, procedure: Box<dyn Procedure>) -> Result<()> {
        self.ensure_idle()?;

        let kind = procedure.kind();
        let cancel = CancellationToken::new();
        let (completion_tx, completions) = completion_channel();
        let (delivery_tx, deliveries) = delivery_channel();
        let ctx = WorkerContext::new(delivery_tx, cancel.clone()).with_kind(&kind);

        let handle = thread::Builder::new()
            .name("lowrank-worker".into())
            .spawn(move || run_worker(procedure, ctx, completion_tx))
            .map_err(|e| LauncherError::ExternalTool(format!("failed to spawn worker: {e}")))?;

        tracing::info!(run = %kind, "run started");
        let now = Instant::now();
        self.worker = Some(handle);
        self.active = Some(ActiveRun {
            kind,
            cancel,
            completions,
            deliveries,
            started: now,
            next_pump: now,
            status: RunStatus::Finished,
            error: None,
            stats: PumpStats::default(),
        });
        Ok(())
    }

    /// Ask the worker to stop at its next safe point.
    pub fn request_abort(&self) {
        match &self.active {
            Some(run) => {
                tracing::info!("{}", run.kind.abort_notice());
                run.cancel.cancel();
            }
            None => tracing::debug!("abort requested with no run in flight"),
        }
    }

    /// One scheduler step; the host event loop calls this repeatedly.
    ///
    /// Drains the completion channel on every call and pumps deliveries once
    /// per pump interval. When the terminal completion arrives the worker is
    /// joined, every remaining delivery is loaded, and the host is notified.
    pub fn tick(&mut self, now: Instant, host: &mut dyn HostCallbacks) {
        let Some(run) = self.active.as_mut() else {
            return;
        };

        let stopped = run.drain_completions(host);
        if now >= run.next_pump {
            run.pump(host);
            run.next_pump = now + self.settings.pump_interval;
        }
        if stopped {
            self.finish(host);
        }
    }

    /// Tear down the current run without delivering what is still queued.
    pub fn shutdown(&mut self) {
        if let Some(run) = self.active.as_mut() {
            run.cancel.cancel();
        }
        self.join_worker();
        if let Some(mut run) = self.active.take() {
            let dropped = run.deliveries.discard();
            if dropped > 0 {
                tracing::info!(dropped, "discarded undelivered files");
            }
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_busy() {
            tracing::warn!("Processing is already running");
            return Err(LauncherError::AlreadyRunning);
        }
        Ok(())
    }

    fn finish(&mut self, host: &mut dyn HostCallbacks) {
        self.join_worker();
        let Some(mut run) = self.active.take() else {
            return;
        };

        // The worker sent everything before its terminal completion.
        let stats = run.deliveries.drain(&mut |item| host.load_file(item));
        run.stats.add(stats);
        tracing::info!("Done loading images");

        let outcome = RunOutcome {
            finished_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            kind: run.kind,
            status: run.status,
            error: run.error,
            loaded: run.stats.loaded,
            failed_loads: run.stats.failed,
            elapsed: run.started.elapsed(),
        };
        tracing::info!(run = %outcome.kind, status = ?outcome.status, "run ended");
        if let Err(e) = host.on_run_finished(&outcome) {
            tracing::warn!("Error in completion handler: \"{e:#}\"");
        }
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker thread body: run the procedure and always end with `Stop`.
fn run_worker(procedure: Box<dyn Procedure>, ctx: WorkerContext, completions: CompletionSender) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| procedure.run(&ctx)))
        .unwrap_or_else(|payload| {
            Err(LauncherError::ExternalTool(format!(
                "worker panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

    if let Err(err) = result {
        ctx.cancel();
        // Let the host thread take its turn before the failure is queued.
        thread::yield_now();
        completions.fail(err);
    }
    completions.stop();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
