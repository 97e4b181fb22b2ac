//! Text summary builder for CLI output.

use crate::host::LoadedVolume;
use crate::model::{RunOutcome, RunStatus};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(outcome: &RunOutcome, scene: &[LoadedVolume]) -> TextSummary {
    let mut lines = Vec::new();

    let status = match outcome.status {
        RunStatus::Finished => "finished",
        RunStatus::Failed => "failed",
        RunStatus::Aborted => "aborted",
    };
    lines.push(format!(
        "{}: {status} after {}",
        outcome.kind,
        humantime::format_duration(round_to_millis(outcome.elapsed))
    ));
    if let Some(error) = outcome.error.as_deref() {
        lines.push(format!("Error: {error}"));
    }

    lines.push(format!(
        "Loaded {} file(s), {} failed",
        outcome.loaded, outcome.failed_loads
    ));
    for volume in scene {
        lines.push(format!(
            "  {:<32} {:>12} B  {}",
            volume.name,
            volume.bytes,
            volume.path.display()
        ));
    }
    lines.push(format!("Finished at {}", outcome.finished_utc));

    TextSummary { lines }
}

fn round_to_millis(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Algorithm, RunKind};
    use std::path::PathBuf;
    use std::time::Duration;

    fn outcome(status: RunStatus, error: Option<&str>) -> RunOutcome {
        RunOutcome {
            finished_utc: "2024-05-01T10:00:00Z".into(),
            kind: RunKind::Download {
                catalog: "Bullseye".into(),
            },
            status,
            error: error.map(str::to_string),
            loaded: 1,
            failed_loads: 0,
            elapsed: Duration::from_micros(1_500_700),
        }
    }

    #[test]
    fn test_finished_summary_lists_scene() {
        let scene = [LoadedVolume {
            name: "a.nrrd".into(),
            path: PathBuf::from("/cache/a.nrrd"),
            bytes: 42,
        }];
        let summary = build_text_summary(&outcome(RunStatus::Finished, None), &scene);

        assert_eq!(summary.lines[0], "Download Bullseye: finished after 1s 500ms");
        assert_eq!(summary.lines[1], "Loaded 1 file(s), 0 failed");
        assert!(summary.lines[2].contains("/cache/a.nrrd"));
        assert_eq!(summary.lines.len(), 4);
    }

    #[test]
    fn test_failed_summary_carries_error() {
        let mut failed = outcome(RunStatus::Failed, Some("External tool failed: exit 2"));
        failed.kind = RunKind::Algorithm(Algorithm::Nglra);
        let summary = build_text_summary(&failed, &[]);

        assert!(summary.lines[0].ends_with("failed after 1s 500ms"));
        assert_eq!(summary.lines[1], "Error: External tool failed: exit 2");
    }
}
