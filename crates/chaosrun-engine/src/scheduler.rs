//! Experiment grid walk.
//!
//! For every experiment the scheduler applies the fault, then walks
//! user counts × timeouts in order. Between timeouts the fault is reset and
//! reapplied so each trial starts from a fresh injection; between user counts
//! the application is restarted as well. Failures are contained at the
//! narrowest scope possible: a failed trial fails its cell, a failed reapply
//! truncates the current user count or experiment, a failed apply aborts the
//! experiment. Only the initial health gate can abort the whole run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chaosrun_core::{
    ChaosError, ChaosResult, ChaosRunConfig, ExperimentSpec, RemoteExecutor, RequestRateMode,
    ResultLayout, ResultStore, TrialClassification, TrialContext, TrialMetadata,
};
use indicatif::ProgressBar;
use tracing::{error, info, warn};

use crate::capture::{capture_trial, CaptureRequest};
use crate::chaos::{ChaosHandle, ChaosLifecycleController};
use crate::command;
use crate::health::ClusterHealthMonitor;
use crate::load_test::LoadTestExecutor;
use crate::metrics::GRID_CELLS;

/// Knobs of the grid walk, resolved from configuration.
#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    /// Disables every health check and deployment restart.
    pub skip_checks: bool,
    pub continue_on_fail: bool,
    pub wait_for_ready: bool,
    pub max_wait_attempts: u32,
    pub health_retry_interval: Duration,
    pub check_before_each_experiment: bool,
    pub check_after_recovery: bool,
    pub check_between_timeouts: bool,
    /// Attempt budget of one cell.
    pub trial_attempts: u32,
    pub retry_delay: Duration,
    pub test_duration_minutes: u64,
    pub load_generator: String,
    /// Run on the load-generator host after the last experiment.
    pub scratch_cleanup: Option<String>,
}

impl SchedulerPolicy {
    pub fn from_config(config: &ChaosRunConfig) -> Self {
        let checks = &config.cluster_checks;
        let cleanup = config.load_generator.scratch_cleanup.trim();
        Self {
            skip_checks: checks.skip,
            continue_on_fail: checks.continue_on_fail,
            wait_for_ready: checks.wait_for_ready,
            max_wait_attempts: checks.max_wait_attempts,
            health_retry_interval: checks.retry_interval(),
            check_before_each_experiment: checks.check_before_each_experiment,
            check_after_recovery: checks.check_after_recovery,
            check_between_timeouts: config.check_between_timeouts,
            trial_attempts: checks.locust_retry_count.max(1),
            retry_delay: config.load_generator.retry_delay(),
            test_duration_minutes: config.test_duration_minutes,
            load_generator: config.load_generator.executable.clone(),
            scratch_cleanup: (!cleanup.is_empty()).then(|| cleanup.to_string()),
        }
    }
}

/// Why a cell never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Health gate before the experiment failed.
    HealthGate,
    /// The experiment's first apply failed.
    ApplyFailed,
    /// Reapplying the fault for this cell failed.
    ReapplyFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthGate => "health_gate",
            Self::ApplyFailed => "apply_failed",
            Self::ReapplyFailed => "reapply_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellStatus {
    Completed(TrialClassification),
    /// Every attempt failed, or the failure was not retryable.
    Failed(String),
    Skipped(SkipReason),
}

impl CellStatus {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

/// Final state of one (experiment, user count, timeout) cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRecord {
    pub experiment: String,
    pub user_count: u32,
    pub timeout: u64,
    pub status: CellStatus,
    pub attempts: u32,
    pub result_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExperimentStatus {
    Completed,
    /// Health gate failed; nothing was applied.
    Skipped,
    /// Fault could not be applied.
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentRecord {
    pub label: String,
    pub status: ExperimentStatus,
}

/// Everything a run did, in visiting order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub experiments: Vec<ExperimentRecord>,
    pub cells: Vec<CellRecord>,
    pub nodes_recovered: bool,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.count(|status| matches!(status, CellStatus::Completed(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|status| matches!(status, CellStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|status| matches!(status, CellStatus::Skipped(_)))
    }

    fn count(&self, predicate: impl Fn(&CellStatus) -> bool) -> usize {
        self.cells.iter().filter(|cell| predicate(&cell.status)).count()
    }
}

/// Fault state of the experiment being walked.
enum FaultState {
    Active(ChaosHandle),
    Inactive,
}

impl FaultState {
    fn take(&mut self) -> Option<ChaosHandle> {
        match std::mem::replace(self, FaultState::Inactive) {
            FaultState::Active(handle) => Some(handle),
            FaultState::Inactive => None,
        }
    }
}

/// Outcome of the retry loop of one cell.
struct TrialRun {
    classification: TrialClassification,
    attempts: u32,
    error: Option<ChaosError>,
}

/// Walks experiments sequentially against one control host and one
/// load-generator host.
pub struct ExperimentScheduler {
    monitor: ClusterHealthMonitor,
    controller: ChaosLifecycleController,
    client: Arc<dyn RemoteExecutor>,
    store: Arc<dyn ResultStore>,
    layout: ResultLayout,
    policy: SchedulerPolicy,
    progress: ProgressBar,
}

impl ExperimentScheduler {
    pub fn new(
        monitor: ClusterHealthMonitor,
        controller: ChaosLifecycleController,
        client: Arc<dyn RemoteExecutor>,
        store: Arc<dyn ResultStore>,
        layout: ResultLayout,
        policy: SchedulerPolicy,
    ) -> Self {
        Self {
            monitor,
            controller,
            client,
            store,
            layout,
            policy,
            progress: ProgressBar::hidden(),
        }
    }

    /// Advance `progress` by one per visited cell.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Runs every experiment. Returns `Err` only when the initial health gate
    /// fails; every later failure is recorded in the summary.
    pub async fn run(&self, experiments: &[ExperimentSpec]) -> ChaosResult<RunSummary> {
        let total: usize = experiments.iter().map(ExperimentSpec::cell_count).sum();
        self.progress.set_length(total as u64);

        if !self.policy.skip_checks {
            info!(scope = "run", "Checking cluster health before starting experiments");
            if !self.health_gate("run").await {
                if !self.policy.continue_on_fail {
                    error!(scope = "run", "Cluster is not healthy, aborting run");
                    return Err(ChaosError::Precondition(
                        "cluster health checks failed before the first experiment".to_string(),
                    ));
                }
                warn!(scope = "run", "Proceeding despite failed health checks");
            }
        }

        let mut summary = RunSummary::default();
        for experiment in experiments {
            let status = self.run_experiment(experiment, &mut summary).await;
            summary.experiments.push(ExperimentRecord {
                label: experiment.label.clone(),
                status,
            });
        }

        summary.nodes_recovered = self.final_cleanup().await;
        self.progress.finish_with_message("done");

        info!(
            experiments = summary.experiments.len(),
            completed = summary.completed(),
            failed = summary.failed(),
            skipped = summary.skipped(),
            "Run finished"
        );
        Ok(summary)
    }

    async fn run_experiment(
        &self,
        experiment: &ExperimentSpec,
        summary: &mut RunSummary,
    ) -> ExperimentStatus {
        let label = experiment.label.as_str();
        info!(experiment = %label, kind = experiment.fault.kind(), "Starting experiment");
        self.progress.set_message(label.to_string());

        if !self.policy.skip_checks {
            self.restart_deployments().await;

            if self.policy.check_before_each_experiment && !self.health_gate("experiment").await {
                if !self.policy.continue_on_fail {
                    warn!(scope = "experiment", experiment = %label, "Skipping experiment, cluster is not healthy");
                    self.skip_cells(experiment, &experiment.user_counts, SkipReason::HealthGate, summary);
                    return ExperimentStatus::Skipped;
                }
                warn!(scope = "experiment", experiment = %label, "Proceeding despite failed health checks");
            }
        }

        let handle = match self
            .controller
            .apply(&experiment.fault, experiment.schedule_name.as_deref())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(scope = "experiment", experiment = %label, error = %e, "Failed to apply chaos, aborting experiment");
                self.skip_cells(experiment, &experiment.user_counts, SkipReason::ApplyFailed, summary);
                return ExperimentStatus::Aborted(e.to_string());
            }
        };
        let mut fault = FaultState::Active(handle);

        let load = LoadTestExecutor::new(
            self.client.clone(),
            experiment.load_script.clone(),
            experiment.load_csv.clone(),
        )
        .with_executable(self.policy.load_generator.clone());

        let user_counts = &experiment.user_counts;
        for (idx, &user_count) in user_counts.iter().enumerate() {
            info!(experiment = %label, user_count, "Running tests for user count");
            self.run_timeouts(experiment, &load, user_count, &mut fault, summary)
                .await;

            if let Some(handle) = fault.take() {
                self.controller.reset(&handle).await;
            }

            let remaining = &user_counts[idx + 1..];
            if remaining.is_empty() {
                break;
            }

            if !self.policy.skip_checks {
                self.restart_deployments().await;
            }
            info!(
                wait_secs = experiment.recovery_wait.as_secs(),
                "Waiting for recovery between user counts"
            );
            tokio::time::sleep(experiment.recovery_wait).await;
            if !self.policy.skip_checks {
                self.health_gate("user_count").await;
            }

            match self.reapply(experiment).await {
                Some(handle) => fault = FaultState::Active(handle),
                None => {
                    error!(
                        scope = "experiment",
                        experiment = %label,
                        next_user_count = remaining[0],
                        "Failed to reapply chaos, skipping remaining user counts"
                    );
                    self.skip_cells(experiment, remaining, SkipReason::ReapplyFailed, summary);
                    break;
                }
            }
        }

        if let Some(handle) = fault.take() {
            self.controller.reset(&handle).await;
        }
        if !self.policy.skip_checks {
            self.restart_deployments().await;
        }
        if !experiment.recovery_wait.is_zero() {
            info!(
                wait_secs = experiment.recovery_wait.as_secs(),
                "Waiting for recovery between experiments"
            );
            tokio::time::sleep(experiment.recovery_wait).await;
            if self.policy.check_after_recovery && !self.policy.skip_checks {
                self.health_gate("experiment_recovery").await;
            }
        }

        info!(experiment = %label, "Experiment finished");
        ExperimentStatus::Completed
    }

    /// Walks the timeouts of one user count. On return the fault may be
    /// active or not; the caller resets it.
    async fn run_timeouts(
        &self,
        experiment: &ExperimentSpec,
        load: &LoadTestExecutor,
        user_count: u32,
        fault: &mut FaultState,
        summary: &mut RunSummary,
    ) {
        let label = experiment.label.as_str();
        let timeouts = &experiment.timeouts;

        for (idx, &timeout) in timeouts.iter().enumerate() {
            info!(experiment = %label, user_count, timeout, "Running trial");
            let record = self.run_cell(experiment, load, user_count, timeout).await;
            self.record(record, summary);

            let remaining = &timeouts[idx + 1..];
            if remaining.is_empty() {
                break;
            }

            if let Some(handle) = fault.take() {
                self.controller.reset(&handle).await;
            }
            info!(
                wait_secs = experiment.timeout_recovery.as_secs(),
                "Waiting for recovery between timeouts"
            );
            tokio::time::sleep(experiment.timeout_recovery).await;
            if self.policy.check_between_timeouts && !self.policy.skip_checks {
                self.health_gate("timeout").await;
            }

            match self.reapply(experiment).await {
                Some(handle) => *fault = FaultState::Active(handle),
                None => {
                    error!(
                        scope = "user_count",
                        experiment = %label,
                        user_count,
                        next_timeout = remaining[0],
                        "Failed to reapply chaos, skipping remaining timeouts"
                    );
                    for &timeout in remaining {
                        self.record(
                            skipped_cell(label, user_count, timeout, SkipReason::ReapplyFailed),
                            summary,
                        );
                    }
                    break;
                }
            }
        }
    }

    /// Runs one cell to completion, then captures its artifacts whatever the outcome.
    async fn run_cell(
        &self,
        experiment: &ExperimentSpec,
        load: &LoadTestExecutor,
        user_count: u32,
        timeout: u64,
    ) -> CellRecord {
        let label = experiment.label.as_str();
        let context = TrialContext {
            experiment: label.to_string(),
            user_count,
            timeout,
            rate_mode: experiment.rate_mode,
            attempt: 1,
        };

        let run = self.run_trial(load, context).await;
        let status = match &run.error {
            None => CellStatus::Completed(run.classification),
            Some(e) => {
                error!(
                    scope = "cell",
                    experiment = %label,
                    user_count,
                    timeout,
                    attempts = run.attempts,
                    error = %e,
                    "Trial failed"
                );
                CellStatus::Failed(e.to_string())
            }
        };

        let plan = load.plan(experiment.rate_mode);
        let result_dir = match self
            .create_trial_dir(label, user_count, experiment.rate_mode, timeout)
            .await
        {
            Ok(dir) => {
                info!(result_dir = %dir.display(), "Created result directory");
                let metadata = TrialMetadata::new(
                    user_count,
                    timeout,
                    self.policy.test_duration_minutes,
                    experiment.rate_mode,
                )
                .with_outcome(run.classification, run.attempts)
                .with_load_script(remote_file_name(&plan.script_path))
                .with_application(self.monitor.app_namespace());
                let summary_name = experiment.summary_name();

                capture_trial(
                    self.store.as_ref(),
                    CaptureRequest {
                        result_dir: &dir,
                        fault: &experiment.fault,
                        remote_csv: &plan.csv_path,
                        remote_console_log: &plan.console_log_path,
                        metadata: &metadata,
                        summary_name: summary_name.as_deref(),
                        topology: experiment.topology,
                    },
                )
                .await;
                Some(dir)
            }
            Err(e) => {
                error!(scope = "cell", error = %e, "Failed to create result directory, artifacts not captured");
                None
            }
        };

        CellRecord {
            experiment: label.to_string(),
            user_count,
            timeout,
            status,
            attempts: run.attempts,
            result_dir,
        }
    }

    /// Retry loop. Successes and non-retryable failures end it early.
    async fn run_trial(&self, load: &LoadTestExecutor, mut context: TrialContext) -> TrialRun {
        let max_attempts = self.policy.trial_attempts;
        let plan = load.plan(context.rate_mode);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                info!(
                    attempt,
                    max_attempts,
                    delay_secs = self.policy.retry_delay.as_secs(),
                    "Retrying load test"
                );
                tokio::time::sleep(self.policy.retry_delay).await;
            }
            context.attempt = attempt;

            let error = match load.run(&context, self.policy.test_duration_minutes).await {
                Ok(outcome) => match outcome.failure(&plan, load.executable()) {
                    None => {
                        return TrialRun {
                            classification: outcome.classification,
                            attempts: attempt,
                            error: None,
                        }
                    }
                    Some(e) => e,
                },
                Err(e) => e,
            };

            warn!(attempt, max_attempts, error = %error, "Load test attempt failed");
            let retryable = error.is_retryable();
            last_error = Some(error);
            if !retryable {
                warn!(scope = "cell", "Failure is not retryable, giving up");
                return TrialRun {
                    classification: TrialClassification::Failure,
                    attempts: attempt,
                    error: last_error,
                };
            }
        }

        TrialRun {
            classification: TrialClassification::Failure,
            attempts: max_attempts,
            error: Some(last_error.unwrap_or_else(|| {
                ChaosError::trial_failure(format!("all {} attempts failed", max_attempts))
            })),
        }
    }

    async fn create_trial_dir(
        &self,
        label: &str,
        user_count: u32,
        rate_mode: RequestRateMode,
        timeout: u64,
    ) -> ChaosResult<PathBuf> {
        let layout = self.layout.clone();
        let label = label.to_string();
        let now = chrono::Local::now();
        tokio::task::spawn_blocking(move || {
            layout.create_trial_dir(&label, user_count, rate_mode, timeout, now)
        })
        .await
        .map_err(|e| ChaosError::ArtifactCapture(format!("result directory task failed: {}", e)))?
    }

    async fn reapply(&self, experiment: &ExperimentSpec) -> Option<ChaosHandle> {
        match self
            .controller
            .apply(&experiment.fault, experiment.schedule_name.as_deref())
            .await
        {
            Ok(handle) => {
                info!(handle = %handle, "Chaos reapplied");
                Some(handle)
            }
            Err(e) => {
                error!(experiment = %experiment.label, error = %e, "Failed to reapply chaos");
                None
            }
        }
    }

    /// One health check, followed by a bounded wait when configured.
    async fn health_gate(&self, scope: &'static str) -> bool {
        if self.monitor.check().await.is_healthy() {
            return true;
        }
        if !self.policy.wait_for_ready {
            warn!(scope, "Cluster health checks failed");
            return false;
        }
        warn!(scope, "Cluster health checks failed, waiting for cluster to become ready");
        self.monitor
            .wait_until_healthy(self.policy.max_wait_attempts, self.policy.health_retry_interval)
            .await
    }

    async fn restart_deployments(&self) {
        let namespace = self.monitor.app_namespace();
        if !self.monitor.restart_deployments(namespace).await {
            warn!(namespace, "Cluster not fully healthy after deployment restart");
        }
    }

    /// Scratch cleanup on the load generator, then node recovery. Returns
    /// whether the recovery succeeded.
    async fn final_cleanup(&self) -> bool {
        if let Some(cleanup) = &self.policy.scratch_cleanup {
            info!("Cleaning up load generator scratch files");
            match command::run(self.client.as_ref(), cleanup).await {
                Ok(output) if output.success() => {}
                Ok(output) => warn!(exit_status = output.exit_status, "Scratch cleanup failed"),
                Err(e) => warn!(error = %e, "Scratch cleanup failed"),
            }
        }

        info!(scope = "run", "Performing final node recovery");
        self.controller.recover_nodes().await
    }

    fn skip_cells(
        &self,
        experiment: &ExperimentSpec,
        user_counts: &[u32],
        reason: SkipReason,
        summary: &mut RunSummary,
    ) {
        for &user_count in user_counts {
            for &timeout in &experiment.timeouts {
                self.record(
                    skipped_cell(&experiment.label, user_count, timeout, reason),
                    summary,
                );
            }
        }
    }

    fn record(&self, cell: CellRecord, summary: &mut RunSummary) {
        GRID_CELLS
            .with_label_values(&[cell.status.metric_label()])
            .inc();
        self.progress.inc(1);
        summary.cells.push(cell);
    }
}

fn skipped_cell(experiment: &str, user_count: u32, timeout: u64, reason: SkipReason) -> CellRecord {
    CellRecord {
        experiment: experiment.to_string(),
        user_count,
        timeout,
        status: CellStatus::Skipped(reason),
        attempts: 0,
        result_dir: None,
    }
}

fn remote_file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
