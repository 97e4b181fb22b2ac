//! Lookup of the registration tools the toolkit shells out to.

use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Tools the toolkit expects to find, keyed `EXE_<name>` in the invocation.
pub const TOOLS: [&str; 10] = [
    "BRAINSFit",
    "BRAINSDemonWarp",
    "BSplineDeformableRegistration",
    "BRAINSResample",
    "antsRegistration",
    "AverageImages",
    "ComposeMultiTransform",
    "WarpImageMultiTransform",
    "CreateJacobianDeterminantImage",
    "InvertDeformationField",
];

/// Resolved tool locations; `None` when a tool could not be found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SoftwarePaths {
    tools: BTreeMap<String, Option<PathBuf>>,
}

impl SoftwarePaths {
    /// Search `bundled` first, then `PATH`. The process environment is left untouched.
    pub fn resolve(bundled: Option<&Path>) -> Self {
        let path_var = std::env::var_os("PATH");
        Self::resolve_in(bundled, path_var.as_deref())
    }

    fn resolve_in(bundled: Option<&Path>, path_var: Option<&OsStr>) -> Self {
        let mut dirs: Vec<PathBuf> = bundled.map(Path::to_path_buf).into_iter().collect();
        if let Some(path_var) = path_var {
            dirs.extend(std::env::split_paths(path_var));
        }

        let tools = TOOLS
            .iter()
            .map(|tool| (format!("EXE_{tool}"), find_executable(tool, &dirs)))
            .collect();
        let paths = Self { tools };
        let missing: Vec<&str> = paths.missing().collect();
        if !missing.is_empty() {
            tracing::debug!(?missing, "some registration tools were not found");
        }
        paths
    }

    #[cfg(test)]
    fn get(&self, tool: &str) -> Option<&Path> {
        self.tools
            .get(&format!("EXE_{tool}"))
            .and_then(|p| p.as_deref())
    }

    /// Names of the tools that could not be resolved.
    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.tools
            .iter()
            .filter(|(_, path)| path.is_none())
            .map(|(key, _)| key.trim_start_matches("EXE_"))
    }
}

fn find_executable(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter().find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
