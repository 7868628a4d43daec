//! [`ResultStore`] backed by the local filesystem.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chaosrun_core::{
    ChaosError, ChaosResult, ClusterTopology, FaultDefinition, RemoteExecutor, ResultStore,
    TrialMetadata,
};
use tracing::{info, warn};

use crate::atomic::{partial_path, write_atomic_async};
use crate::{report, summary, CONSOLE_LOG_FILE, CSV_FILE, FAULT_DEFINITION_FILE};

/// Console logs above this size are captured as a head/tail excerpt.
pub const CONSOLE_LOG_EXCERPT_THRESHOLD: u64 = 1_000_000;

/// Lines of CSV kept by the fallback download, after the header.
const CSV_FALLBACK_TAIL_LINES: usize = 5000;

const LOG_HEAD_LINES: usize = 50;
const LOG_TAIL_LINES: usize = 300;

const CRITICAL_PATTERN: &str =
    "Error|Exception|WARNING|CRITICAL|run-time limit|Shutting down|Aggregated|percentiles|occurrences";

/// Remote file state reported by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteFile {
    Missing,
    Present { size: Option<u64> },
}

/// Writes trial artifacts below local result directories. Load-generator
/// files are fetched from `load_host`; fault definitions that only exist on
/// the control host are fetched from `control_host` when one is set.
pub struct FsResultStore {
    load_host: Arc<dyn RemoteExecutor>,
    control_host: Option<Arc<dyn RemoteExecutor>>,
}

impl FsResultStore {
    pub fn new(load_host: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            load_host,
            control_host: None,
        }
    }

    #[must_use]
    pub fn with_control_host(mut self, control_host: Arc<dyn RemoteExecutor>) -> Self {
        self.control_host = Some(control_host);
        self
    }

    async fn stat(&self, remote: &str) -> ChaosResult<RemoteFile> {
        let check = format!(
            "[ -f {0} ] && stat -c %s {0} || echo 'Not Found'",
            remote
        );
        let output = self.load_host.run_command(&check).await?;
        if output.stdout.contains("Not Found") {
            return Ok(RemoteFile::Missing);
        }
        let size = output.stdout.trim().parse().ok();
        if size.is_none() {
            warn!(remote, output = %output.stdout.trim(), "Could not determine remote file size");
        }
        Ok(RemoteFile::Present { size })
    }

    /// Downloads through a staged local file so `local` only ever holds a
    /// complete copy.
    async fn download(
        executor: &dyn RemoteExecutor,
        remote: &str,
        local: &Path,
    ) -> ChaosResult<()> {
        let partial = partial_path(local);
        if let Err(e) = executor.download_file(remote, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        tokio::fs::rename(&partial, local).await?;
        Ok(())
    }

    /// Builds a file on the load host with `build`, downloads it, removes it.
    async fn download_derived(&self, build: String, scratch: &str, local: &Path) -> ChaosResult<()> {
        let output = self.load_host.run_command(&build).await?;
        if !output.success() {
            return Err(ChaosError::ArtifactCapture(format!(
                "failed to prepare {} (exit {}): {}",
                scratch,
                output.exit_status,
                output.stderr.trim()
            )));
        }
        let result = Self::download(self.load_host.as_ref(), scratch, local).await;
        if let Err(e) = self.load_host.run_command(&format!("rm -f {}", scratch)).await {
            warn!(scratch, error = %e, "Failed to remove remote scratch file");
        }
        result
    }
}

fn scratch_path(prefix: &str, extension: &str) -> String {
    format!(
        "/tmp/{}_{}.{}",
        prefix,
        chrono::Utc::now().timestamp(),
        extension
    )
}

#[async_trait]
impl ResultStore for FsResultStore {
    async fn copy_fault_definition(
        &self,
        fault: &FaultDefinition,
        result_dir: &Path,
    ) -> ChaosResult<PathBuf> {
        let dest = result_dir.join(FAULT_DEFINITION_FILE);
        match tokio::fs::read(fault.path()).await {
            Ok(contents) => write_atomic_async(&dest, &contents).await?,
            Err(e) => {
                let control = self.control_host.as_ref().ok_or_else(|| {
                    ChaosError::ArtifactCapture(format!(
                        "cannot read {}: {}",
                        fault.path().display(),
                        e
                    ))
                })?;
                let remote = fault.path().display().to_string();
                Self::download(control.as_ref(), &remote, &dest).await?;
            }
        }
        info!(dest = %dest.display(), "Copied fault definition");
        Ok(dest)
    }

    async fn download_csv(&self, remote_csv: &str, result_dir: &Path) -> ChaosResult<PathBuf> {
        let local = result_dir.join(CSV_FILE);
        if self.stat(remote_csv).await? == RemoteFile::Missing {
            return Err(ChaosError::ArtifactCapture(format!(
                "remote CSV {} does not exist",
                remote_csv
            )));
        }

        match Self::download(self.load_host.as_ref(), remote_csv, &local).await {
            Ok(()) => {
                info!(local = %local.display(), "CSV log downloaded");
                Ok(local)
            }
            Err(e) => {
                warn!(error = %e, "CSV download failed, fetching header and tail only");
                let scratch = scratch_path("csv_partial", "csv");
                let build = format!(
                    "head -n 1 {remote} > {scratch} && tail -n {lines} {remote} >> {scratch}",
                    remote = remote_csv,
                    scratch = scratch,
                    lines = CSV_FALLBACK_TAIL_LINES
                );
                self.download_derived(build, &scratch, &local).await?;
                info!(local = %local.display(), "Partial CSV log downloaded");
                Ok(local)
            }
        }
    }

    async fn download_console_log(
        &self,
        remote_log: &str,
        result_dir: &Path,
    ) -> ChaosResult<PathBuf> {
        let local = result_dir.join(CONSOLE_LOG_FILE);

        let attempt = match self.stat(remote_log).await {
            Ok(RemoteFile::Missing) => {
                return Err(ChaosError::ArtifactCapture(format!(
                    "remote log {} does not exist",
                    remote_log
                )))
            }
            Ok(RemoteFile::Present { size: Some(size) }) if size > CONSOLE_LOG_EXCERPT_THRESHOLD => {
                info!(size, "Console log is large, downloading head and tail only");
                let scratch = scratch_path("log_partial", "log");
                let build = format!(
                    "echo '=== LOG HEAD (FIRST {head} LINES) ===' > {scratch} && \
                     head -n {head} {remote} >> {scratch} && \
                     echo '=== LOG MIDDLE OMITTED ===' >> {scratch} && \
                     echo '=== LOG TAIL (LAST {tail} LINES) ===' >> {scratch} && \
                     tail -n {tail} {remote} >> {scratch}",
                    head = LOG_HEAD_LINES,
                    tail = LOG_TAIL_LINES,
                    remote = remote_log,
                    scratch = scratch
                );
                self.download_derived(build, &scratch, &local).await
            }
            Ok(RemoteFile::Present { .. }) => {
                Self::download(self.load_host.as_ref(), remote_log, &local).await
            }
            Err(e) => Err(e),
        };

        match attempt {
            Ok(()) => {
                info!(local = %local.display(), "Console log downloaded");
                Ok(local)
            }
            Err(e) => {
                warn!(error = %e, "Console log download failed, fetching critical lines only");
                let scratch = scratch_path("log_critical", "log");
                let build = format!(
                    "echo '=== CRITICAL LOG PARTS ===' > {scratch} && \
                     grep -E '{pattern}' {remote} | tail -n {tail} >> {scratch}",
                    scratch = scratch,
                    pattern = CRITICAL_PATTERN,
                    remote = remote_log,
                    tail = LOG_TAIL_LINES
                );
                self.download_derived(build, &scratch, &local).await?;
                info!(local = %local.display(), "Critical parts of console log downloaded");
                Ok(local)
            }
        }
    }

    async fn write_report(
        &self,
        result_dir: &Path,
        metadata: &TrialMetadata,
    ) -> ChaosResult<PathBuf> {
        let dir = result_dir.to_path_buf();
        let metadata = metadata.clone();
        tokio::task::spawn_blocking(move || report::write_report(&dir, &metadata))
            .await
            .map_err(|e| ChaosError::ArtifactCapture(format!("report task failed: {}", e)))?
    }

    async fn write_summary(
        &self,
        result_dir: &Path,
        experiment_name: Option<&str>,
        topology: ClusterTopology,
    ) -> ChaosResult<PathBuf> {
        let dir = result_dir.to_path_buf();
        let name = experiment_name.map(str::to_string);
        tokio::task::spawn_blocking(move || summary::write_summary(&dir, name.as_deref(), topology))
            .await
            .map_err(|e| ChaosError::ArtifactCapture(format!("summary task failed: {}", e)))?
    }
}
