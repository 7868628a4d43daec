//! Cluster health verification.
//!
//! Every check is a read-only `kubectl` query whose text output is parsed by
//! a pure function. Query failures degrade to a failing check; they are
//! never returned as errors.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chaosrun_core::{CommandOutput, RemoteExecutor};
use tracing::{error, info, warn};

use crate::command;
use crate::metrics::HEALTH_CHECKS;

/// Marker kubectl prints when a listing is empty.
const NO_RESOURCES: &str = "No resources found";

/// The fixed battery of health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthCheck {
    NodesReady,
    NoActiveChaosSchedules,
    ApplicationPodsReady,
}

impl HealthCheck {
    pub const ALL: [HealthCheck; 3] = [
        HealthCheck::NodesReady,
        HealthCheck::NoActiveChaosSchedules,
        HealthCheck::ApplicationPodsReady,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodesReady => "nodes_ready",
            Self::NoActiveChaosSchedules => "no_active_chaos_schedules",
            Self::ApplicationPodsReady => "application_pods_ready",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::NodesReady => "Nodes Ready",
            Self::NoActiveChaosSchedules => "No Active Chaos Schedules",
            Self::ApplicationPodsReady => "Application Pods Ready",
        }
    }
}

/// Per-check results of one health pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    results: BTreeMap<HealthCheck, bool>,
}

impl HealthReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, check: HealthCheck, passed: bool) {
        self.results.insert(check, passed);
    }

    pub fn passed(&self, check: HealthCheck) -> Option<bool> {
        self.results.get(&check).copied()
    }

    /// Aggregate verdict: true iff every recorded check passed.
    pub fn is_healthy(&self) -> bool {
        self.results.values().all(|passed| *passed)
    }

    pub fn failing(&self) -> Vec<HealthCheck> {
        self.results
            .iter()
            .filter(|(_, passed)| !**passed)
            .map(|(check, _)| *check)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HealthCheck, bool)> + '_ {
        self.results.iter().map(|(check, passed)| (*check, *passed))
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (check, passed) in self.iter() {
            writeln!(f, "{}: {}", check.title(), if passed { "✓" } else { "✗" })?;
        }
        write!(
            f,
            "Overall Status: {}",
            if self.is_healthy() { "PASSED" } else { "FAILED" }
        )
    }
}

/// Readiness verdict over a `kubectl get` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every listed resource is ready.
    Ready { count: usize },
    /// Names of resources that are not ready.
    NotReady { offenders: Vec<String> },
    /// The listing contained no resources.
    Empty,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    fn from_rows(count: usize, offenders: Vec<String>) -> Self {
        if count == 0 {
            Self::Empty
        } else if offenders.is_empty() {
            Self::Ready { count }
        } else {
            Self::NotReady { offenders }
        }
    }
}

/// Parses `kubectl get nodes -o wide`. A node is ready iff its STATUS is exactly `Ready`.
pub fn parse_node_readiness(output: &str) -> Readiness {
    let mut count = 0;
    let mut offenders = Vec::new();

    for line in output.trim().lines().skip(1) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 2 {
            continue;
        }
        count += 1;
        if columns[1] != "Ready" {
            offenders.push(columns[0].to_string());
        }
    }

    Readiness::from_rows(count, offenders)
}

/// Parses `kubectl get pods`. A pod is ready iff READY is `n/n` and STATUS is `Running`.
pub fn parse_pod_readiness(output: &str) -> Readiness {
    let mut count = 0;
    let mut offenders = Vec::new();

    for line in output.trim().lines().skip(1) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 3 {
            continue;
        }
        count += 1;

        let ready = match columns[1].split_once('/') {
            Some((ready, total)) => ready == total && columns[2] == "Running",
            None => false,
        };
        if !ready {
            offenders.push(columns[0].to_string());
        }
    }

    Readiness::from_rows(count, offenders)
}

/// Outcome of listing chaos-mesh schedules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleListing {
    /// No schedule exists.
    Clear,
    /// Names of schedules still present.
    Active(Vec<String>),
    /// The query itself failed.
    QueryFailed(String),
}

impl ScheduleListing {
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear)
    }
}

/// Parses `kubectl get schedules`. kubectl reports an empty listing on
/// stderr, sometimes with a non-zero exit.
pub fn parse_schedule_listing(output: &CommandOutput) -> ScheduleListing {
    if output.stderr.contains(NO_RESOURCES) || output.stdout.contains(NO_RESOURCES) {
        return ScheduleListing::Clear;
    }
    if !output.success() {
        return ScheduleListing::QueryFailed(output.stderr.trim().to_string());
    }

    let names: Vec<String> = output
        .stdout
        .trim()
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect();

    if names.is_empty() {
        ScheduleListing::Clear
    } else {
        ScheduleListing::Active(names)
    }
}

/// Read-only health checks plus the deployment restart used as a forced reset.
pub struct ClusterHealthMonitor {
    executor: Arc<dyn RemoteExecutor>,
    app_namespace: String,
    chaos_namespace: String,
    rollout_timeout: Duration,
}

impl ClusterHealthMonitor {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        app_namespace: impl Into<String>,
        chaos_namespace: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            app_namespace: app_namespace.into(),
            chaos_namespace: chaos_namespace.into(),
            rollout_timeout: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_rollout_timeout(mut self, timeout: Duration) -> Self {
        self.rollout_timeout = timeout;
        self
    }

    pub fn app_namespace(&self) -> &str {
        &self.app_namespace
    }

    /// Runs every check against the configured application namespace.
    pub async fn check(&self) -> HealthReport {
        self.check_namespace(&self.app_namespace).await
    }

    /// Runs every check, looking for application pods in `namespace`.
    pub async fn check_namespace(&self, namespace: &str) -> HealthReport {
        info!(namespace, "Performing cluster health checks");

        let mut report = HealthReport::new();
        report.record(HealthCheck::NodesReady, self.check_nodes().await);
        report.record(
            HealthCheck::NoActiveChaosSchedules,
            self.check_schedules().await,
        );
        report.record(
            HealthCheck::ApplicationPodsReady,
            self.check_pods(namespace).await,
        );

        for (check, passed) in report.iter() {
            HEALTH_CHECKS
                .with_label_values(&[check.as_str(), if passed { "pass" } else { "fail" }])
                .inc();
        }

        if report.is_healthy() {
            info!("Cluster health checks passed");
        } else {
            let failing: Vec<&str> = report.failing().iter().map(HealthCheck::as_str).collect();
            warn!(failing = ?failing, "Cluster health checks failed");
        }
        report
    }

    /// Polls [`check`](Self::check) until it passes or `max_attempts` are used.
    /// Sleeps `retry_interval` between attempts, never after the last one.
    pub async fn wait_until_healthy(&self, max_attempts: u32, retry_interval: Duration) -> bool {
        info!(
            max_attempts,
            retry_interval_secs = retry_interval.as_secs(),
            "Waiting for cluster to become healthy"
        );

        for attempt in 1..=max_attempts {
            if self.check().await.is_healthy() {
                info!(attempt, "Cluster became healthy");
                return true;
            }
            if attempt < max_attempts {
                info!(attempt, max_attempts, "Cluster not healthy yet, retrying");
                tokio::time::sleep(retry_interval).await;
            }
        }

        warn!(max_attempts, "Cluster still unhealthy after maximum wait");
        false
    }

    /// Rolling-restarts every deployment in `namespace`, waits for the
    /// rollout, then returns the aggregate of a fresh health check.
    pub async fn restart_deployments(&self, namespace: &str) -> bool {
        info!(namespace, "Restarting deployments");

        let list = format!("kubectl get deployments -n {} -o name", namespace);
        let deployments = match command::run(self.executor.as_ref(), &list).await {
            Ok(output) if output.success() => output.stdout,
            Ok(output) => {
                error!(namespace, stderr = %output.stderr.trim(), "Failed to list deployments");
                return false;
            }
            Err(e) => {
                error!(namespace, error = %e, "Failed to list deployments");
                return false;
            }
        };

        let names: Vec<&str> = deployments.split_whitespace().collect();
        if names.is_empty() {
            info!(namespace, "No deployments to restart");
            return true;
        }
        info!(namespace, deployments = ?names, "Restarting all deployments");

        let restart = format!("kubectl rollout restart deployment -n {}", namespace);
        match command::run(self.executor.as_ref(), &restart).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(namespace, stderr = %output.stderr.trim(), "Rollout restart failed"),
            Err(e) => warn!(namespace, error = %e, "Rollout restart failed"),
        }

        let status = format!(
            "kubectl rollout status deployment -n {} --timeout={}s",
            namespace,
            self.rollout_timeout.as_secs()
        );
        // The remote side enforces the rollout deadline; allow a margin on top.
        let bound = self.rollout_timeout + Duration::from_secs(60);
        match command::run_bounded(self.executor.as_ref(), &status, bound).await {
            Ok(output) if output.success() => info!(namespace, "All deployments rolled out"),
            Ok(output) => warn!(
                namespace,
                stderr = %output.stderr.trim(),
                "Some deployments may not be fully ready"
            ),
            Err(e) => warn!(namespace, error = %e, "Rollout status failed"),
        }

        self.check_namespace(namespace).await.is_healthy()
    }

    async fn check_nodes(&self) -> bool {
        let output = match self.query("kubectl get nodes -o wide").await {
            Some(output) => output,
            None => return false,
        };
        match parse_node_readiness(&output.stdout) {
            Readiness::Ready { count } => {
                info!(nodes = count, "All nodes are Ready");
                true
            }
            Readiness::NotReady { offenders } => {
                warn!(nodes = ?offenders, "Some nodes are not Ready");
                false
            }
            Readiness::Empty => {
                warn!("No nodes found in cluster");
                false
            }
        }
    }

    async fn check_schedules(&self) -> bool {
        let query = format!("kubectl get schedules -n {}", self.chaos_namespace);
        let output = match command::run(self.executor.as_ref(), &query).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Failed to query chaos schedules");
                return false;
            }
        };
        match parse_schedule_listing(&output) {
            ScheduleListing::Clear => true,
            ScheduleListing::Active(names) => {
                warn!(schedules = ?names, "Found active chaos schedules");
                false
            }
            ScheduleListing::QueryFailed(stderr) => {
                warn!(stderr = %stderr, "Failed to check chaos schedules");
                false
            }
        }
    }

    async fn check_pods(&self, namespace: &str) -> bool {
        let output = match self.query(&format!("kubectl get pods -n {}", namespace)).await {
            Some(output) => output,
            None => return false,
        };
        match parse_pod_readiness(&output.stdout) {
            Readiness::Ready { count } => {
                info!(namespace, pods = count, "All pods are running and ready");
                true
            }
            Readiness::NotReady { offenders } => {
                warn!(namespace, pods = ?offenders, "Some pods are not ready");
                false
            }
            Readiness::Empty => {
                warn!(namespace, "No pods found");
                false
            }
        }
    }

    /// Runs a query, returning `None` on transport failure or non-zero exit.
    async fn query(&self, query: &str) -> Option<CommandOutput> {
        match command::run(self.executor.as_ref(), query).await {
            Ok(output) if output.success() => Some(output),
            Ok(output) => {
                warn!(query, stderr = %output.stderr.trim(), "Health query failed");
                None
            }
            Err(e) => {
                warn!(query, error = %e, "Health query failed");
                None
            }
        }
    }
}
