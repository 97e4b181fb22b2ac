use crate::config::{self, Settings};
use crate::engine::algorithm::SceneVolume;
use crate::engine::download::Catalog;
use crate::engine::{DriverCommand, FileVolume, HttpFetcher, RunRequest};
use crate::host::{run_host_loop, ConsoleHost, HostCommand, LoadedVolume};
use crate::model::{Algorithm, DataBundle, RunOutcome, RunStatus};
use crate::orchestrator::Launcher;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Poll period of the host loop between two scheduler ticks.
const HOST_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Parser, Clone)]
#[command(
    name = "lowrank-decomposition",
    version,
    about = "Run low-rank image decomposition algorithms and fetch their sample data"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print the run outcome as JSON instead of a text summary
    #[arg(long, global = true)]
    pub json: bool,

    /// Cache directory for downloaded sample data
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Directory holding the download catalogs (<bundle>.json)
    #[arg(long, global = true)]
    pub catalog_dir: Option<PathBuf>,

    /// Directory with bundled registration tools, searched before PATH
    #[arg(long, global = true)]
    pub external_bin: Option<PathBuf>,

    /// Program that runs the decomposition toolkit
    #[arg(long, global = true, default_value = "pyLAR")]
    pub driver: PathBuf,

    /// Download files again even when a cached copy exists
    #[arg(long, global = true)]
    pub force_redownload: bool,

    /// How often produced files are loaded while a run is in progress
    #[arg(long, global = true, default_value = "500ms")]
    pub pump_interval: humantime::Duration,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run an algorithm on the images listed by a configuration file
    Run {
        /// Configuration file (JSON)
        #[arg(long)]
        config: PathBuf,

        #[arg(long, value_enum, default_value_t = Algorithm::Lr)]
        algorithm: Algorithm,

        /// Additional image appended to the file list and selection
        #[arg(long)]
        extra_image: Option<PathBuf>,
    },
    /// Download a sample data bundle into the cache directory
    Download {
        #[arg(value_enum)]
        bundle: DataBundle,
    },
    /// Write an example configuration and file list for a data bundle
    ExampleConfig {
        #[arg(long, value_enum, default_value_t = Algorithm::Lr)]
        algorithm: Algorithm,

        #[arg(long, value_enum, default_value_t = DataBundle::Bullseye)]
        bundle: DataBundle,

        /// Where to write the configuration file
        #[arg(long)]
        output: PathBuf,

        /// Directory holding the bundle's images (defaults to the cache directory)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

/// Build launcher `Settings` from CLI arguments.
pub fn build_settings(args: &Cli) -> Settings {
    let defaults = Settings::default();
    Settings {
        cache_dir: args.cache_dir.clone().unwrap_or(defaults.cache_dir),
        catalog_dir: args.catalog_dir.clone().unwrap_or(defaults.catalog_dir),
        force_redownload: args.force_redownload,
        external_bin_dir: args.external_bin.clone().or(defaults.external_bin_dir),
        driver: args.driver.clone(),
        pump_interval: Duration::from(args.pump_interval),
    }
}

/// What the host thread starts once it owns the launcher.
enum SessionAction {
    Run(RunRequest),
    Download(String),
}

#[derive(Serialize)]
struct SessionReport<'a> {
    outcome: &'a RunOutcome,
    scene: &'a [LoadedVolume],
}

pub async fn run(args: Cli) -> Result<RunStatus> {
    let settings = build_settings(&args);
    tracing::debug!(?settings, "resolved settings");

    let action = match &args.command {
        Command::ExampleConfig {
            algorithm,
            bundle,
            output,
            data_dir,
        } => {
            let catalog_path = Catalog::path_for(&settings.catalog_dir, bundle.catalog_name());
            let catalog = Catalog::load(&catalog_path)?;
            let data_dir = data_dir.clone().unwrap_or_else(|| settings.cache_dir.clone());
            config::write_example_config(output, *algorithm, &catalog, &data_dir)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("{}", output.display());
            return Ok(RunStatus::Finished);
        }
        Command::Run {
            config,
            algorithm,
            extra_image,
        } => SessionAction::Run(RunRequest {
            algorithm: *algorithm,
            config_path: config.clone(),
            extra_image: extra_image
                .clone()
                .map(|p| Box::new(FileVolume::new(p)) as Box<dyn SceneVolume>),
        }),
        Command::Download { bundle } => SessionAction::Download(bundle.catalog_name().to_string()),
    };

    let (outcome, scene) = run_session(settings, action).await?;
    if args.json {
        let report = SessionReport {
            outcome: &outcome,
            scene: &scene,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in crate::text_summary::build_text_summary(&outcome, &scene).lines {
            println!("{line}");
        }
    }
    Ok(outcome.status)
}

/// Drive one run on a dedicated host thread; Ctrl-C requests an abort.
async fn run_session(
    settings: Settings,
    action: SessionAction,
) -> Result<(RunOutcome, Vec<LoadedVolume>)> {
    let fetcher = Arc::new(HttpFetcher::new(tokio::runtime::Handle::current())?);
    let library = Arc::new(DriverCommand::new(settings.driver.clone()));
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<HostCommand>();

    let host_thread = std::thread::Builder::new()
        .name("lowrank-host".into())
        .spawn(move || -> Result<ConsoleHost> {
            let mut launcher = Launcher::new(settings, library, fetcher);
            let mut host = ConsoleHost::default();
            match action {
                SessionAction::Run(request) => launcher.start_run(request)?,
                SessionAction::Download(catalog) => launcher.start_download(&catalog)?,
            }
            if let Some(kind) = launcher.current_kind() {
                host.begin(kind);
            }
            run_host_loop(&mut launcher, &mut host, &mut cmd_rx, HOST_POLL);
            Ok(host)
        })
        .context("failed to spawn host thread")?;

    let mut join = tokio::task::spawn_blocking(move || host_thread.join());
    let joined = loop {
        tokio::select! {
            res = &mut join => break res.context("host thread task failed")?,
            _ = tokio::signal::ctrl_c() => {
                let _ = cmd_tx.send(HostCommand::Abort);
            }
        }
    };
    let host = joined.map_err(|_| anyhow!("host thread panicked"))??;
    if host.is_busy() {
        anyhow::bail!("host loop returned while a run was still active");
    }
    tracing::info!("Status: {}", host.status());

    let outcome = host
        .last_outcome()
        .cloned()
        .context("run ended without an outcome")?;
    Ok((outcome, host.scene().to_vec()))
}
