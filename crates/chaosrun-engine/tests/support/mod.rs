//! Shared fixtures for scheduler tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chaosrun_core::{
    ChaosError, ChaosResult, ClusterTopology, CommandOutput, ExperimentSpec, FaultDefinition,
    RequestRateMode, ResultLayout, ResultStore, TrialMetadata,
};
use chaosrun_engine::{
    ChaosLifecycleController, ClusterHealthMonitor, ExperimentScheduler, SchedulerPolicy,
};
use chaosrun_remote::MockExecutor;
use tempfile::TempDir;

pub const NODES_READY: &str = "\
NAME       STATUS   ROLES           AGE   VERSION   INTERNAL-IP
master-1   Ready    control-plane   30d   v1.28.2   10.0.0.1
worker-1   Ready    <none>          30d   v1.28.2   10.0.0.2
";

pub const NODES_NOT_READY: &str = "\
NAME       STATUS     ROLES           AGE   VERSION   INTERNAL-IP
master-1   Ready      control-plane   30d   v1.28.2   10.0.0.1
worker-1   NotReady   <none>          30d   v1.28.2   10.0.0.2
";

pub const PODS_READY: &str = "\
NAME                        READY   STATUS    RESTARTS   AGE
detector-6d4cf56db6-abcde   1/1     Running   0          1h
";

/// One recorded `ResultStore` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub operation: &'static str,
    pub result_dir: PathBuf,
}

/// In-memory result store recording every call.
#[derive(Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<StoreCall>>,
    reports: Mutex<Vec<TrialMetadata>>,
    failing: Mutex<Vec<&'static str>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `operation` fail.
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().push(operation);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, result_dir: &Path) -> Vec<&'static str> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.result_dir == result_dir)
            .map(|call| call.operation)
            .collect()
    }

    pub fn reports(&self) -> Vec<TrialMetadata> {
        self.reports.lock().clone()
    }

    fn record(&self, operation: &'static str, result_dir: &Path, file: &str) -> ChaosResult<PathBuf> {
        self.calls.lock().push(StoreCall {
            operation,
            result_dir: result_dir.to_path_buf(),
        });
        if self.failing.lock().contains(&operation) {
            return Err(ChaosError::ArtifactCapture(format!("{} failed", operation)));
        }
        Ok(result_dir.join(file))
    }
}

#[async_trait]
impl ResultStore for RecordingStore {
    async fn copy_fault_definition(
        &self,
        _fault: &FaultDefinition,
        result_dir: &Path,
    ) -> ChaosResult<PathBuf> {
        self.record("copy_fault_definition", result_dir, "chaos_config.yaml")
    }

    async fn download_csv(&self, _remote_csv: &str, result_dir: &Path) -> ChaosResult<PathBuf> {
        self.record("download_csv", result_dir, "locust_log.csv")
    }

    async fn download_console_log(
        &self,
        _remote_log: &str,
        result_dir: &Path,
    ) -> ChaosResult<PathBuf> {
        self.record("download_console_log", result_dir, "console_output.log")
    }

    async fn write_report(
        &self,
        result_dir: &Path,
        metadata: &TrialMetadata,
    ) -> ChaosResult<PathBuf> {
        self.reports.lock().push(metadata.clone());
        self.record("write_report", result_dir, "report.md")
    }

    async fn write_summary(
        &self,
        result_dir: &Path,
        _experiment_name: Option<&str>,
        _topology: ClusterTopology,
    ) -> ChaosResult<PathBuf> {
        self.record("write_summary", result_dir, "locust_log_summary.csv")
    }
}

/// Policy with health checks off and short waits.
pub fn quiet_policy() -> SchedulerPolicy {
    SchedulerPolicy {
        skip_checks: true,
        continue_on_fail: false,
        wait_for_ready: false,
        max_wait_attempts: 3,
        health_retry_interval: Duration::from_secs(10),
        check_before_each_experiment: false,
        check_after_recovery: true,
        check_between_timeouts: true,
        trial_attempts: 3,
        retry_delay: Duration::from_secs(5),
        test_duration_minutes: 1,
        load_generator: "/home/ubuntu/.local/bin/locust".to_string(),
        scratch_cleanup: Some("rm -f /home/ubuntu/*.csv /home/ubuntu/*.log".to_string()),
    }
}

/// Manifest experiment whose definition lives on the control host.
pub fn manifest_experiment(schedule: &str, timeouts: Vec<u64>, user_counts: Vec<u32>) -> ExperimentSpec {
    ExperimentSpec {
        label: schedule.to_string(),
        fault: FaultDefinition::from_path(format!("/remote/chaos/{}.yaml", schedule)),
        schedule_name: Some(schedule.to_string()),
        load_script: "/home/ubuntu/locust/locustfile.py".to_string(),
        load_csv: "/home/ubuntu/locust_log.csv".to_string(),
        timeouts,
        user_counts,
        rate_mode: RequestRateMode::FixedInterval(1.0),
        recovery_wait: Duration::from_secs(30),
        timeout_recovery: Duration::from_secs(120),
        topology: ClusterTopology::default(),
    }
}

pub fn script_experiment(timeouts: Vec<u64>, user_counts: Vec<u32>) -> ExperimentSpec {
    let fault = FaultDefinition::from_path("/remote/chaos/stop_kubelet.sh");
    ExperimentSpec {
        label: fault.file_name(),
        fault,
        schedule_name: None,
        ..manifest_experiment("unused", timeouts, user_counts)
    }
}

/// Mocks for both hosts plus a scheduler writing below a temp directory.
pub struct Harness {
    pub master: MockExecutor,
    pub client: MockExecutor,
    pub store: Arc<RecordingStore>,
    pub results: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            master: MockExecutor::new("master"),
            client: MockExecutor::new("client"),
            store: Arc::new(RecordingStore::new()),
            results: TempDir::new().unwrap(),
        }
    }

    /// Answer every health query as healthy.
    pub fn healthy_cluster(&self) {
        self.master
            .respond("kubectl get nodes", CommandOutput::new(0, NODES_READY, ""));
        self.master.respond(
            "kubectl get schedules",
            CommandOutput::new(1, "", "No resources found in chaos-mesh namespace.\n"),
        );
        self.master
            .respond("kubectl get pods", CommandOutput::new(0, PODS_READY, ""));
        self.master.respond(
            "kubectl get deployments",
            CommandOutput::new(0, "deployment.apps/detector\n", ""),
        );
    }

    pub fn scheduler(&self, policy: SchedulerPolicy) -> ExperimentScheduler {
        let master = Arc::new(self.master.clone());
        ExperimentScheduler::new(
            ClusterHealthMonitor::new(master.clone(), "image-detection", "chaos-mesh"),
            ChaosLifecycleController::new(master, "chaos-mesh"),
            Arc::new(self.client.clone()),
            self.store.clone(),
            ResultLayout::new(self.results.path()),
            policy,
        )
    }
}
