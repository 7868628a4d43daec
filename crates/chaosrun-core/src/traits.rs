use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ChaosResult;
use crate::experiment::{ClusterTopology, FaultDefinition, TrialMetadata};

/// Result of one remote shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(exit_status: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_status,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Runs commands and moves files on one remote host.
///
/// Implementations serialize their own commands: callers may share an
/// executor but never observe interleaved output.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Host this executor talks to, used in logs and errors.
    fn host(&self) -> &str;

    /// Establishes the session. Calling it on a connected executor is a no-op.
    async fn connect(&self) -> ChaosResult<()>;

    /// Runs a shell command bounded by the executor's default command timeout.
    ///
    /// A non-zero exit status is returned in [`CommandOutput`], not as an error.
    async fn run_command(&self, command: &str) -> ChaosResult<CommandOutput>;

    /// Runs a shell command with an explicit bound.
    async fn run_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> ChaosResult<CommandOutput>;

    /// Copies a local file to `remote_path`.
    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> ChaosResult<()>;

    /// Copies `remote_path` to a local file.
    async fn download_file(&self, remote_path: &str, local_path: &Path) -> ChaosResult<()>;

    /// Tears the session down. Safe to call more than once.
    async fn close(&self) -> ChaosResult<()>;
}

/// Persists the artifacts of one trial into its result directory.
///
/// Every method is independent: a failure in one must not prevent the others.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Copies the fault definition into the result directory.
    async fn copy_fault_definition(
        &self,
        fault: &FaultDefinition,
        result_dir: &Path,
    ) -> ChaosResult<PathBuf>;

    /// Fetches the load generator CSV from its host.
    async fn download_csv(&self, remote_csv: &str, result_dir: &Path) -> ChaosResult<PathBuf>;

    /// Fetches the load generator console log from its host.
    async fn download_console_log(
        &self,
        remote_log: &str,
        result_dir: &Path,
    ) -> ChaosResult<PathBuf>;

    /// Writes the human-readable report and the metadata file.
    async fn write_report(&self, result_dir: &Path, metadata: &TrialMetadata)
        -> ChaosResult<PathBuf>;

    /// Writes the summary CSV derived from previously captured artifacts.
    async fn write_summary(
        &self,
        result_dir: &Path,
        experiment_name: Option<&str>,
        topology: ClusterTopology,
    ) -> ChaosResult<PathBuf>;
}
