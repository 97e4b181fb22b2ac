//! The host side: the single thread that owns the scene.
//!
//! A front end implements [`HostCallbacks`] and calls [`Launcher::tick`] from its
//! event loop. [`ConsoleHost`] is the front end used by the command line.

use crate::error::LauncherError;
use crate::model::{DeliveryItem, RunKind, RunOutcome, RunStatus};
use crate::orchestrator::Launcher;
use anyhow::Result;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

/// Callbacks the launcher invokes on the host thread.
pub trait HostCallbacks {
    /// The run has been torn down; the host is ready for a new one.
    fn on_run_finished(&mut self, outcome: &RunOutcome) -> Result<()>;

    /// The worker reported an error (including a user abort).
    fn on_run_failed(&mut self, error: &LauncherError) -> Result<()>;

    /// Load one produced or downloaded file into the scene.
    fn load_file(&mut self, item: &DeliveryItem) -> bool;
}

/// Requests sent to the host thread from elsewhere (signal handlers, other UIs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostCommand {
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedVolume {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Scene and status for the command-line front end.
#[derive(Debug, Default)]
pub struct ConsoleHost {
    scene: Vec<LoadedVolume>,
    busy: bool,
    status: String,
    last_outcome: Option<RunOutcome>,
}

impl ConsoleHost {
    /// Switch to the busy state for a run that was just started.
    pub fn begin(&mut self, kind: &RunKind) {
        self.busy = true;
        self.status = format!("Running: {kind}");
        tracing::info!("Status: {}", self.status);
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn scene(&self) -> &[LoadedVolume] {
        &self.scene
    }

    pub fn last_outcome(&self) -> Option<&RunOutcome> {
        self.last_outcome.as_ref()
    }
}

impl HostCallbacks for ConsoleHost {
    fn on_run_finished(&mut self, outcome: &RunOutcome) -> Result<()> {
        self.busy = false;
        if outcome.status == RunStatus::Finished {
            self.status = "Idle".to_string();
        }
        self.last_outcome = Some(outcome.clone());
        Ok(())
    }

    fn on_run_failed(&mut self, error: &LauncherError) -> Result<()> {
        self.status = error.to_string();
        if error.is_aborted() {
            tracing::info!("{error}");
        } else {
            tracing::error!("{error}");
        }
        Ok(())
    }

    fn load_file(&mut self, item: &DeliveryItem) -> bool {
        match fs::metadata(&item.path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                self.scene.push(LoadedVolume {
                    name: item.name.clone(),
                    path: item.path.clone(),
                    bytes: meta.len(),
                });
                true
            }
            Ok(_) => false,
            Err(err) => {
                tracing::debug!(path = %item.path.display(), %err, "cannot read volume");
                false
            }
        }
    }
}

/// Drive the launcher until its current run has been torn down.
///
/// Polls with a short sleep to keep the loop responsive without spinning.
pub(crate) fn run_host_loop<H: HostCallbacks>(
    launcher: &mut Launcher,
    host: &mut H,
    commands: &mut UnboundedReceiver<HostCommand>,
    poll: Duration,
) {
    loop {
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                HostCommand::Abort => launcher.request_abort(),
            }
        }

        launcher.tick(Instant::now(), host);
        if launcher.is_idle() {
            break;
        }
        std::thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::algorithm::Invocation;
    use crate::engine::{AlgorithmLibrary, Fetcher, Procedure, WorkerContext};
    use crate::model::Algorithm;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Unused;

    impl AlgorithmLibrary for Unused {
        fn run(&self, _invocation: &Invocation<'_>) -> crate::error::Result<()> {
            unreachable!("toolkit is not used here")
        }
    }

    impl Fetcher for Unused {
        fn fetch(&self, _url: &str, _target: &Path) -> crate::error::Result<u64> {
            unreachable!("network is not used here")
        }
    }

    /// Delivers one file, then blocks until the run is aborted.
    struct WaitForAbort {
        output: PathBuf,
    }

    impl Procedure for WaitForAbort {
        fn kind(&self) -> RunKind {
            RunKind::Algorithm(Algorithm::Uab)
        }

        fn run(self: Box<Self>, ctx: &WorkerContext) -> crate::error::Result<()> {
            ctx.deliver(DeliveryItem::new("L_0", &self.output));
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            ctx.check_cancelled()
        }
    }

    #[test]
    fn test_load_requires_non_empty_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let full = dir.path().join("full.nrrd");
        let empty = dir.path().join("empty.nrrd");
        fs::write(&full, "voxels").unwrap();
        fs::write(&empty, "").unwrap();

        let mut host = ConsoleHost::default();
        assert!(host.load_file(&DeliveryItem::new("full", &full)));
        assert!(!host.load_file(&DeliveryItem::new("empty", &empty)));
        assert!(!host.load_file(&DeliveryItem::new("gone", dir.path().join("gone"))));
        assert!(!host.load_file(&DeliveryItem::new("dir", dir.path())));

        assert_eq!(
            host.scene(),
            [LoadedVolume {
                name: "full".into(),
                path: full,
                bytes: 6
            }]
        );
    }

    #[test]
    fn test_failure_keeps_error_text_and_clears_busy() {
        let mut host = ConsoleHost::default();
        host.begin(&RunKind::Algorithm(Algorithm::Uab));
        assert!(host.is_busy());

        host.on_run_failed(&LauncherError::ExternalTool("exit 2".into()))
            .unwrap();
        host.on_run_finished(&RunOutcome {
            finished_utc: "now".into(),
            kind: RunKind::Algorithm(Algorithm::Uab),
            status: RunStatus::Failed,
            error: Some("External tool failed: exit 2".into()),
            loaded: 0,
            failed_loads: 0,
            elapsed: Duration::ZERO,
        })
        .unwrap();

        assert!(!host.is_busy());
        assert_eq!(host.status(), "External tool failed: exit 2");
        assert_eq!(host.last_outcome().unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn test_abort_command_ends_host_loop() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = dir.path().join("L_0.nrrd");
        fs::write(&output, "voxels").unwrap();

        let unused = Arc::new(Unused);
        let mut launcher = Launcher::new(Settings::default(), unused.clone(), unused);
        let mut host = ConsoleHost::default();
        launcher.start(Box::new(WaitForAbort { output })).unwrap();
        host.begin(launcher.current_kind().unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(HostCommand::Abort).unwrap();
        run_host_loop(&mut launcher, &mut host, &mut rx, Duration::from_millis(1));

        assert!(launcher.is_idle());
        assert!(!host.is_busy());
        let outcome = host.last_outcome().unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(outcome.loaded, 1);
        let expected = format!("{} aborted", Algorithm::Uab.display_name());
        assert_eq!(host.status(), expected);
        assert_eq!(outcome.error.as_deref(), Some(expected.as_str()));
    }
}
