//! Best-effort artifact capture for one trial.

use std::path::{Path, PathBuf};

use chaosrun_core::{
    ChaosError, ChaosResult, ClusterTopology, FaultDefinition, ResultStore, TrialMetadata,
};
use tracing::{info, warn};

/// Inputs of one capture pass.
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest<'a> {
    pub result_dir: &'a Path,
    pub fault: &'a FaultDefinition,
    pub remote_csv: &'a str,
    pub remote_console_log: &'a str,
    pub metadata: &'a TrialMetadata,
    pub summary_name: Option<&'a str>,
    pub topology: ClusterTopology,
}

/// Result of every capture step. Steps run independently, so each keeps
/// its own outcome.
#[derive(Debug)]
pub struct CaptureReport {
    pub fault_definition: ChaosResult<PathBuf>,
    pub csv: ChaosResult<PathBuf>,
    pub console_log: ChaosResult<PathBuf>,
    pub report: ChaosResult<PathBuf>,
    pub summary: ChaosResult<PathBuf>,
}

impl CaptureReport {
    pub fn steps(&self) -> [(&'static str, &ChaosResult<PathBuf>); 5] {
        [
            ("fault_definition", &self.fault_definition),
            ("csv", &self.csv),
            ("console_log", &self.console_log),
            ("report", &self.report),
            ("summary", &self.summary),
        ]
    }

    pub fn failures(&self) -> Vec<(&'static str, &ChaosError)> {
        self.steps()
            .into_iter()
            .filter_map(|(step, result)| result.as_ref().err().map(|e| (step, e)))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.steps().iter().all(|(_, result)| result.is_ok())
    }
}

/// Runs every capture step into `request.result_dir`. The summary runs last
/// because it reads what the downloads produced.
pub async fn capture_trial(store: &dyn ResultStore, request: CaptureRequest<'_>) -> CaptureReport {
    let dir = request.result_dir;

    let report = CaptureReport {
        fault_definition: store.copy_fault_definition(request.fault, dir).await,
        csv: store.download_csv(request.remote_csv, dir).await,
        console_log: store
            .download_console_log(request.remote_console_log, dir)
            .await,
        report: store.write_report(dir, request.metadata).await,
        summary: store
            .write_summary(dir, request.summary_name, request.topology)
            .await,
    };

    for (step, error) in report.failures() {
        warn!(step, result_dir = %dir.display(), error = %error, "Artifact capture step failed");
    }
    if report.is_complete() {
        info!(result_dir = %dir.display(), "Captured trial artifacts");
    }

    report
}
