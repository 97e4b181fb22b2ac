//! Algorithm runs through the external toolkit.
//!
//! Preparation (configuration, file list, result directory, extra image) runs
//! on the host thread so that configuration mistakes are reported before any
//! thread is spawned. Only the toolkit call and the manifest read happen on the
//! worker.

use super::software::SoftwarePaths;
use super::{Procedure, WorkerContext};
use crate::config::{self, AlgorithmConfig, Settings};
use crate::error::{LauncherError, Result};
use crate::model::{Algorithm, DeliveryItem, RunKind};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Manifest of produced images written by the toolkit into the result directory.
pub const OUTPUT_MANIFEST: &str = "list_outputs.txt";

/// Request file handed to the toolkit driver.
pub const INVOCATION_FILE: &str = "invocation.json";

const EXTRA_IMAGE_STEM: &str = "ExtraImage";
const STDERR_TAIL_LINES: usize = 20;

/// An image owned by the host scene that can be written to disk.
pub trait SceneVolume: Send {
    /// File extension used when saving, without the dot.
    fn extension(&self) -> &str {
        "nrrd"
    }

    fn save(&self, path: &Path) -> Result<()>;
}

/// A volume that already exists on disk; saving copies it.
pub struct FileVolume {
    source: PathBuf,
}

impl FileVolume {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl SceneVolume for FileVolume {
    fn extension(&self) -> &str {
        self.source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("nrrd")
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::copy(&self.source, path).map_err(|e| LauncherError::io(&self.source, e))?;
        Ok(())
    }
}

/// What the user asked for when pressing "Apply".
pub struct RunRequest {
    pub algorithm: Algorithm,
    pub config_path: PathBuf,
    pub extra_image: Option<Box<dyn SceneVolume>>,
}

/// Everything the toolkit receives for one run.
#[derive(Debug, Serialize)]
pub struct Invocation<'a> {
    pub algorithm: Algorithm,
    pub config: &'a AlgorithmConfig,
    pub software: &'a SoftwarePaths,
    pub images: &'a [PathBuf],
    pub result_dir: &'a Path,
    pub config_file: &'a Path,
    pub file_list_file_name: &'a Path,
}

/// Boundary to the external registration/decomposition toolkit.
///
/// Implementations block until the toolkit is done; a running call cannot be
/// interrupted.
pub trait AlgorithmLibrary: Send + Sync {
    fn run(&self, invocation: &Invocation<'_>) -> Result<()>;
}

/// Runs the toolkit through a driver program: `<program> <algorithm> <invocation.json>`.
pub struct DriverCommand {
    program: PathBuf,
}

impl DriverCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl AlgorithmLibrary for DriverCommand {
    fn run(&self, invocation: &Invocation<'_>) -> Result<()> {
        let request = invocation.result_dir.join(INVOCATION_FILE);
        let text = serde_json::to_string_pretty(invocation)
            .map_err(|e| LauncherError::json(&request, e))?;
        fs::write(&request, text).map_err(|e| LauncherError::io(&request, e))?;

        tracing::info!(
            program = %self.program.display(),
            algorithm = invocation.algorithm.id(),
            images = invocation.images.len(),
            "starting toolkit"
        );
        let output = Command::new(&self.program)
            .arg(invocation.algorithm.id())
            .arg(&request)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                LauncherError::ExternalTool(format!(
                    "failed to start {}: {e}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            return Err(LauncherError::ExternalTool(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                tail.trim()
            )));
        }
        Ok(())
    }
}

/// A prepared algorithm run, ready to be moved onto the worker thread.
pub struct AlgorithmJob {
    algorithm: Algorithm,
    config: AlgorithmConfig,
    config_path: PathBuf,
    software: SoftwarePaths,
    images: Vec<PathBuf>,
    library: Arc<dyn AlgorithmLibrary>,
}

impl AlgorithmJob {
    /// Validate the request and lay out the result directory.
    pub fn prepare(
        request: RunRequest,
        settings: &Settings,
        library: Arc<dyn AlgorithmLibrary>,
    ) -> Result<Self> {
        let RunRequest {
            algorithm,
            config_path,
            extra_image,
        } = request;

        let mut config = AlgorithmConfig::load(&config_path)?;
        let mut images = config::read_list(&config.file_list_path())?;

        let result_dir = config.result_dir.clone();
        if config.clean && result_dir.exists() {
            tracing::info!(dir = %result_dir.display(), "cleaning result directory");
            fs::remove_dir_all(&result_dir).map_err(|e| LauncherError::io(&result_dir, e))?;
        }
        fs::create_dir_all(&result_dir).map_err(|e| LauncherError::io(&result_dir, e))?;

        if let Some(volume) = extra_image {
            let path = result_dir.join(format!("{EXTRA_IMAGE_STEM}.{}", volume.extension()));
            volume.save(&path)?;
            config.append_selection(images.len());
            images.push(path);
        }

        let software = SoftwarePaths::resolve(settings.external_bin_dir.as_deref());
        Ok(Self {
            algorithm,
            config,
            config_path,
            software,
            images,
            library,
        })
    }

    pub fn images(&self) -> &[PathBuf] {
        &self.images
    }
}

impl Procedure for AlgorithmJob {
    fn kind(&self) -> RunKind {
        RunKind::Algorithm(self.algorithm)
    }

    fn run(self: Box<Self>, ctx: &WorkerContext) -> Result<()> {
        // Only safe point: the toolkit call cannot be interrupted, and once it
        // returned its outputs are complete.
        ctx.check_cancelled()?;

        let result_dir = self.config.result_dir.as_path();
        self.library.run(&Invocation {
            algorithm: self.algorithm,
            config: &self.config,
            software: &self.software,
            images: &self.images,
            result_dir,
            config_file: &self.config_path,
            file_list_file_name: &self.config.file_list_file_name,
        })?;

        let outputs = config::read_list(&result_dir.join(OUTPUT_MANIFEST))?;
        tracing::info!(outputs = outputs.len(), "toolkit finished");
        for output in outputs {
            let path = if output.is_relative() {
                result_dir.join(output)
            } else {
                output
            };
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            ctx.deliver(DeliveryItem::new(name, path));
        }
        Ok(())
    }
}
