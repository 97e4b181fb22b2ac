use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Algorithms exposed by the external toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Unbiased atlas creation
    Uab,
    /// Low-rank/sparse decomposition
    Lr,
    /// Low-rank (non-greedy) atlas creation
    Nglra,
}

impl Algorithm {
    /// Identifier understood by the toolkit driver.
    pub fn id(self) -> &'static str {
        match self {
            Algorithm::Uab => "uab",
            Algorithm::Lr => "lr",
            Algorithm::Nglra => "nglra",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Algorithm::Uab => "Unbiased Atlas Creation",
            Algorithm::Lr => "Low Rank/Sparse Decomposition",
            Algorithm::Nglra => "Low Rank Atlas Creation",
        }
    }
}

/// Sample data sets published as download catalogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DataBundle {
    /// Synthetic bull's eye images
    Bullseye,
    /// Healthy volunteers, T1-Flash
    T1Flash,
    /// Healthy volunteers, T1-MPRage
    T1Mprage,
    /// Healthy volunteers, T2
    T2,
    /// Healthy volunteers, MRA
    Mra,
}

impl DataBundle {
    /// Catalog name; the catalog document lives at `<catalog_dir>/<name>.json`.
    pub fn catalog_name(self) -> &'static str {
        match self {
            DataBundle::Bullseye => "Bullseye",
            DataBundle::T1Flash => "HealthyVolunteers-T1-Flash",
            DataBundle::T1Mprage => "HealthyVolunteers-T1-MPRage",
            DataBundle::T2 => "HealthyVolunteers-T2",
            DataBundle::Mra => "HealthyVolunteers-MRA",
        }
    }
}

/// A file ready to be loaded into the host scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryItem {
    pub name: String,
    pub path: PathBuf,
}

impl DeliveryItem {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// What a run is doing, for status lines and summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Algorithm(Algorithm),
    Download { catalog: String },
}

impl RunKind {
    /// What the user is told when an abort is requested.
    pub fn abort_notice(&self) -> String {
        match self {
            RunKind::Download { .. } => "Download will stop after current file.".to_string(),
            RunKind::Algorithm(_) => format!("{self} will stop once the toolkit returns."),
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Algorithm(algo) => write!(f, "{}", algo.display_name()),
            RunKind::Download { catalog } => write!(f, "Download {catalog}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finished,
    Failed,
    Aborted,
}

/// Terminal report handed to the host once a run has been torn down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub finished_utc: String,
    pub kind: RunKind,
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub loaded: usize,
    pub failed_loads: usize,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}
