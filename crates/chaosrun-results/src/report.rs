//! Human-readable trial report.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chaosrun_core::{ChaosError, ChaosResult, TrialMetadata};
use tracing::info;

use crate::atomic::write_atomic;
use crate::{CONSOLE_LOG_FILE, CSV_FILE, FAULT_DEFINITION_FILE, METADATA_FILE, REPORT_FILE};

/// Renders `report.md`. `metadata_note` replaces the metadata link when the
/// metadata file could not be written.
pub fn render_report(metadata: &TrialMetadata, metadata_note: Option<&str>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Experiment Report: Timeout {}s\n", metadata.timeout);

    out.push_str("## Test Configuration\n");
    for (key, value) in metadata.entries() {
        let _ = writeln!(out, "- **{}**: {}", title_case(key), value);
    }
    out.push('\n');

    out.push_str("## Basic Information\n");
    let _ = writeln!(out, "- **Timeout (s)**: {}", metadata.timeout);
    let _ = writeln!(out, "- **Chaos Experiment**: {}", FAULT_DEFINITION_FILE);
    let _ = writeln!(out, "- **Locust Script**: {}", metadata.load_script);
    let _ = writeln!(out, "- **Locust Log CSV**: {}", CSV_FILE);
    let _ = writeln!(out, "- **Console Log**: {}", CONSOLE_LOG_FILE);

    match metadata_note {
        None => {
            let _ = writeln!(out, "\n*all saved in [{0}]({0})*", METADATA_FILE);
        }
        Some(note) => {
            let _ = writeln!(out, "\n*Error in saving: {}*", note);
        }
    }
    out
}

/// Writes `metadata.json` and `report.md` into `result_dir`. The report is
/// written even if the metadata file fails; the failure is still returned.
pub fn write_report(result_dir: &Path, metadata: &TrialMetadata) -> ChaosResult<PathBuf> {
    let metadata_path = result_dir.join(METADATA_FILE);
    let metadata_result = serde_json::to_vec_pretty(metadata)
        .map_err(ChaosError::from)
        .and_then(|json| write_atomic(&metadata_path, &json).map_err(ChaosError::from));

    let note = metadata_result.as_ref().err().map(ToString::to_string);
    let report_path = result_dir.join(REPORT_FILE);
    write_atomic(&report_path, render_report(metadata, note.as_deref()).as_bytes())?;
    info!(report = %report_path.display(), "Report generated");

    match metadata_result {
        Ok(()) => Ok(report_path),
        Err(e) => Err(ChaosError::ArtifactCapture(format!(
            "failed to write {}: {}",
            metadata_path.display(),
            e
        ))),
    }
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
