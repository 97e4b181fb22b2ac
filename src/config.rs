//! Algorithm configuration files and launcher settings.
//!
//! Algorithm configuration is a flat JSON key/value document. Only the keys the
//! launcher needs are typed; every other key is opaque and passed through to the
//! toolkit untouched, in its original order.

use crate::engine::download::Catalog;
use crate::error::{LauncherError, Result};
use crate::model::Algorithm;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keys every configuration file must define.
pub const REQUIRED_KEYS: [&str; 3] = ["data_dir", "file_list_file_name", "result_dir"];

/// File list written next to the sample data by the example writer.
pub const EXAMPLE_FILE_LIST: &str = "fileList.txt";

/// Interval between two delivery pumps on the host thread.
pub const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    pub data_dir: PathBuf,
    pub file_list_file_name: PathBuf,
    pub result_dir: PathBuf,
    /// Remove a pre-existing result directory before running.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clean: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AlgorithmConfig {
    /// Load and validate a configuration file.
    ///
    /// Every missing required key is reported in a single
    /// [`LauncherError::Configuration`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| LauncherError::io(path, e))?;
        let value: Value = serde_json::from_str(&text).map_err(|e| LauncherError::json(path, e))?;

        let Some(map) = value.as_object() else {
            return Err(LauncherError::Configuration(format!(
                "{} is not a key/value document",
                path.display()
            )));
        };
        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !map.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(LauncherError::Configuration(format!(
                "{} is missing required keys: {}",
                path.display(),
                missing.join(", ")
            )));
        }

        serde_json::from_value(value).map_err(|e| LauncherError::json(path, e))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LauncherError::io(parent, e))?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|e| LauncherError::json(path, e))?;
        fs::write(path, text).map_err(|e| LauncherError::io(path, e))
    }

    /// Location of the list of input images.
    pub fn file_list_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_list_file_name)
    }

    /// Mark the image at `index` of the input list as selected.
    pub fn append_selection(&mut self, index: usize) {
        match self.extra.get_mut("selection") {
            Some(Value::Array(items)) => items.push(json!(index)),
            _ => {
                self.extra.insert("selection".into(), json!([index]));
            }
        }
    }
}

/// Read a text list, one entry per non-empty line.
pub fn read_list(path: &Path) -> Result<Vec<PathBuf>> {
    let text = fs::read_to_string(path).map_err(|e| LauncherError::io(path, e))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

pub fn write_list(path: &Path, items: &[PathBuf]) -> Result<()> {
    let mut text = String::new();
    for item in items {
        text.push_str(&item.to_string_lossy());
        text.push('\n');
    }
    fs::write(path, text).map_err(|e| LauncherError::io(path, e))
}

/// Build the example configuration for `algo` over the images of `catalog`,
/// expected to be downloaded into `data_dir`.
pub fn example_config(
    algo: Algorithm,
    catalog: &Catalog,
    data_dir: &Path,
) -> Result<(AlgorithmConfig, Vec<PathBuf>)> {
    let images: Vec<PathBuf> = catalog
        .files
        .iter()
        .map(|entry| data_dir.join(&entry.name))
        .collect();
    let Some(reference) = images.first() else {
        return Err(LauncherError::Configuration(
            "catalog does not list any file".into(),
        ));
    };

    let mut extra = Map::new();
    extra.insert(
        "reference_im_fn".into(),
        Value::String(reference.to_string_lossy().into_owned()),
    );
    extra.insert("modality".into(), json!("Simu"));
    extra.insert("lamda".into(), json!(2.0));
    extra.insert("verbose".into(), json!(true));
    extra.insert("selection".into(), json!([1, 2, 3]));
    extra.insert("ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS".into(), json!(2));
    match algo {
        Algorithm::Lr => {
            extra.insert("registration".into(), json!("affine"));
            extra.insert("histogram_matching".into(), json!(false));
            extra.insert("sigma".into(), json!(0));
        }
        Algorithm::Uab | Algorithm::Nglra => {
            extra.insert("num_of_iterations_per_level".into(), json!(4));
            extra.insert("num_of_levels".into(), json!(1));
            extra.insert("number_of_cpu".into(), json!(2));
            extra.insert(
                "ants_params".into(),
                json!({
                    "Convergence": "[100x50x25,1e-6,10]",
                    "Dimension": 3,
                    "ShrinkFactors": "4x2x1",
                    "SmoothingSigmas": "2x1x0vox",
                    "Transform": "SyN[0.1,1,0]",
                    "Metric": "MeanSquares[fixedIm,movingIm,1,0]"
                }),
            );
            if algo == Algorithm::Nglra {
                extra.insert("use_healthy_atlas".into(), json!(false));
                extra.insert("sigma".into(), json!(0));
                extra.insert("registration_type".into(), json!("ANTS"));
            }
        }
    }

    let config = AlgorithmConfig {
        data_dir: data_dir.to_path_buf(),
        file_list_file_name: PathBuf::from(EXAMPLE_FILE_LIST),
        result_dir: data_dir.join("output"),
        clean: false,
        extra,
    };
    Ok((config, images))
}

/// Write an example configuration to `output` together with its file list.
pub fn write_example_config(
    output: &Path,
    algo: Algorithm,
    catalog: &Catalog,
    data_dir: &Path,
) -> Result<AlgorithmConfig> {
    let (config, images) = example_config(algo, catalog, data_dir)?;
    fs::create_dir_all(data_dir).map_err(|e| LauncherError::io(data_dir, e))?;
    write_list(&config.file_list_path(), &images)?;
    config.save(output)?;
    tracing::info!(
        config = %output.display(),
        algorithm = algo.id(),
        images = images.len(),
        "wrote example configuration"
    );
    Ok(config)
}

/// Launcher-wide settings, built from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Where downloaded sample data is cached.
    pub cache_dir: PathBuf,
    /// Directory holding the `<bundle>.json` download catalogs.
    pub catalog_dir: PathBuf,
    /// Re-download files even when a non-empty copy is cached.
    pub force_redownload: bool,
    /// Bundled tool directory searched before `PATH`.
    pub external_bin_dir: Option<PathBuf>,
    /// Program that drives the external toolkit.
    pub driver: PathBuf,
    pub pump_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            catalog_dir: default_install_dir("Data"),
            force_redownload: false,
            external_bin_dir: Some(default_install_dir("ExternalBin")).filter(|p| p.is_dir()),
            driver: PathBuf::from("pyLAR"),
            pump_interval: DEFAULT_PUMP_INTERVAL,
        }
    }
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lowrank-decomposition")
}

/// `<install>/<name>`, where `<install>` is the parent of the executable's directory.
fn default_install_dir(name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(Path::parent).map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(name)
}
