//! Load-test trials on the load-generator host.
//!
//! A trial is one headless locust invocation. Its verdict comes from the
//! pure [`classify`] function over the exit status and the console tail;
//! retrying is left to the caller.

use std::sync::Arc;
use std::time::Duration;

use chaosrun_core::{
    ChaosError, ChaosResult, CommandOutput, RemoteExecutor, RequestRateMode, TrialClassification, TrialContext,
};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::command;
use crate::metrics::{TRIAL_ATTEMPTS, TRIAL_DURATION};

/// Lines of console output kept for classification.
pub const CONSOLE_TAIL_LINES: usize = 300;

/// Grace period between SIGTERM and SIGKILL for a hung generator.
const KILL_AFTER_SECS: u64 = 15;

const PIGGYBACK_SCRIPT: &str = "locust_piggy_timeout.py";
const PIGGYBACK_CSV: &str = "locust_log_piggyback_timeout.csv";

/// Markers of a run that produced results despite a non-zero exit.
const SUCCESS_MARKERS: [&str; 5] = [
    "Successfully written all response times",
    "All users spawned",
    "Test finished",
    "Shutting down",
    "Percentile response time",
];

/// Classifies a finished trial.
///
/// - exit 0 is a success;
/// - exit 1 after the run-time limit was reached is a success;
/// - any other exit with success markers or request statistics in the
///   output is a success with warnings;
/// - everything else is a failure.
pub fn classify(exit_status: i32, output: &str) -> TrialClassification {
    if exit_status == 0 {
        return TrialClassification::Success;
    }

    let ran_to_limit = output.contains("--run-time limit reached") || output.contains("Shutting down");
    if exit_status == 1 && ran_to_limit {
        return TrialClassification::Success;
    }

    let has_marker = SUCCESS_MARKERS.iter().any(|marker| output.contains(marker));
    let has_result_data =
        !output.trim().is_empty() && (output.contains("Request") || output.contains("requests"));
    if has_marker || has_result_data {
        TrialClassification::SuccessWithWarnings
    } else {
        TrialClassification::Failure
    }
}

/// What was found when a trial failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDiagnostic {
    /// First of the last error-looking console lines.
    pub first_error_line: Option<String>,
    /// `None` when the check itself could not run.
    pub script_present: Option<bool>,
    pub generator_present: Option<bool>,
}

impl FailureDiagnostic {
    /// True only when a check ran and reported the file absent.
    pub fn missing_prerequisite(&self) -> bool {
        self.script_present == Some(false) || self.generator_present == Some(false)
    }
}

/// Verdict and evidence of one trial attempt.
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub context: TrialContext,
    pub classification: TrialClassification,
    pub exit_status: i32,
    pub console_tail: String,
    pub diagnostic: Option<FailureDiagnostic>,
    pub duration: Duration,
}

impl TrialOutcome {
    /// The error a failed trial stands for; `None` for successes.
    pub fn failure(&self, plan: &LoadTestPlan, executable: &str) -> Option<ChaosError> {
        if self.classification.is_success() {
            return None;
        }

        let mut message = format!("load test exited with status {}", self.exit_status);
        let diagnostic = match &self.diagnostic {
            Some(diagnostic) => diagnostic,
            None => return Some(ChaosError::trial_failure(message)),
        };
        if let Some(line) = &diagnostic.first_error_line {
            message.push_str(&format!(": {}", line));
        }
        if diagnostic.script_present == Some(false) {
            message.push_str(&format!(". Script not found at {}", plan.script_path));
        }
        if diagnostic.generator_present == Some(false) {
            message.push_str(&format!(". Load generator not found at {}", executable));
        }

        Some(if diagnostic.missing_prerequisite() {
            ChaosError::missing_prerequisite(message)
        } else {
            ChaosError::trial_failure(message)
        })
    }
}

/// Remote paths used by one rate mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTestPlan {
    /// Directory the generator runs in.
    pub script_dir: String,
    /// Script actually passed to the generator.
    pub script_path: String,
    /// CSV the run writes.
    pub csv_path: String,
    pub console_log_path: String,
}

impl LoadTestPlan {
    /// Piggyback mode swaps in the piggyback script and CSV next to the
    /// configured ones, unless the configured script is already a piggyback one.
    pub fn new(script: &str, csv: &str, rate_mode: RequestRateMode) -> Self {
        let script_dir = non_empty_dir(script);
        let csv_dir = non_empty_dir(csv);
        let console_log_path = join_remote(&csv_dir, "console_output.log");

        let (script_path, csv_path) =
            if rate_mode.is_piggyback() && !script.to_lowercase().contains("piggy") {
                (
                    join_remote(remote_dirname(script), PIGGYBACK_SCRIPT),
                    join_remote(remote_dirname(csv), PIGGYBACK_CSV),
                )
            } else {
                (script.to_string(), csv.to_string())
            };

        Self {
            script_dir,
            script_path,
            csv_path,
            console_log_path,
        }
    }

    /// Full shell command for one trial.
    pub fn command(&self, context: &TrialContext, duration_minutes: u64, executable: &str) -> String {
        let mut env = format!("env PIGGY_TIMEOUT={} ", context.timeout);
        if let Some(interval) = context.rate_mode.interval() {
            env.push_str(&format!("CONSTANT_RATE_INTERVAL={} ", interval));
        }

        format!(
            "cd {dir} && {env}timeout --kill-after={kill}s {deadline}s {exe} -f {script} \
             --headless -u {users} --run-time {duration}m --csv {csv} > {console} 2>&1",
            dir = self.script_dir,
            env = env,
            kill = KILL_AFTER_SECS,
            deadline = kill_deadline(duration_minutes).as_secs(),
            exe = executable,
            script = remote_basename(&self.script_path),
            users = context.user_count,
            duration = duration_minutes,
            csv = self.csv_path.strip_suffix(".csv").unwrap_or(&self.csv_path),
            console = self.console_log_path,
        )
    }
}

/// Deadline after which `timeout` kills the generator: one minute past the run time.
pub fn kill_deadline(duration_minutes: u64) -> Duration {
    Duration::from_secs((duration_minutes + 1) * 60)
}

/// Runs trials of one experiment's load test.
pub struct LoadTestExecutor {
    executor: Arc<dyn RemoteExecutor>,
    script: String,
    csv: String,
    executable: String,
}

impl LoadTestExecutor {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        script: impl Into<String>,
        csv: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            script: script.into(),
            csv: csv.into(),
            executable: "/home/ubuntu/.local/bin/locust".to_string(),
        }
    }

    #[must_use]
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn plan(&self, rate_mode: RequestRateMode) -> LoadTestPlan {
        LoadTestPlan::new(&self.script, &self.csv, rate_mode)
    }

    /// Runs one trial. Only transport failures of the main invocation are
    /// returned as errors; a failed run is an `Ok` outcome classified `Failure`.
    pub async fn run(&self, context: &TrialContext, duration_minutes: u64) -> ChaosResult<TrialOutcome> {
        let plan = self.plan(context.rate_mode);
        let executor = self.executor.as_ref();

        let cleanup = format!("rm -f {} {}", plan.console_log_path, plan.csv_path);
        if let Err(e) = command::run(executor, &cleanup).await {
            warn!(error = %e, "Failed to clean previous load-test output");
        }

        let invocation = plan.command(context, duration_minutes, &self.executable);
        info!(
            experiment = %context.experiment,
            user_count = context.user_count,
            timeout = context.timeout,
            attempt = context.attempt,
            mode = %context.rate_mode,
            duration_minutes,
            "Running load test"
        );

        let started = Instant::now();
        // `timeout` on the remote side enforces the deadline; the local bound only
        // catches a hung session.
        let bound = kill_deadline(duration_minutes) + Duration::from_secs(KILL_AFTER_SECS + 60);
        let exit_status = match command::run_bounded(executor, &invocation, bound).await {
            Ok(output) => output.exit_status,
            Err(e) => {
                TRIAL_ATTEMPTS.with_label_values(&["transport_error"]).inc();
                return Err(e);
            }
        };
        let duration = started.elapsed();
        info!(exit_status, "Load test command finished");

        let tail = format!("tail -n {} {}", CONSOLE_TAIL_LINES, plan.console_log_path);
        let console_tail = match command::run(executor, &tail).await {
            Ok(output) => output.stdout,
            Err(e) => {
                warn!(error = %e, "Could not read console log tail");
                String::new()
            }
        };

        let classification = classify(exit_status, &console_tail);
        let diagnostic = match classification {
            TrialClassification::Failure => Some(self.diagnose(&plan).await),
            TrialClassification::SuccessWithWarnings => {
                warn!(exit_status, "Load test exited non-zero but results look valid");
                None
            }
            TrialClassification::Success => {
                if exit_status != 0 {
                    warn!("Load test exited with 1 after reaching its run-time limit");
                }
                None
            }
        };

        if classification.is_success() && console_tail.trim().is_empty() {
            self.report_empty_output(&plan).await;
        }

        TRIAL_ATTEMPTS
            .with_label_values(&[classification.as_str()])
            .inc();
        TRIAL_DURATION
            .with_label_values(&[classification.as_str()])
            .observe(duration.as_secs_f64());

        Ok(TrialOutcome {
            context: context.clone(),
            classification,
            exit_status,
            console_tail,
            diagnostic,
            duration,
        })
    }

    async fn diagnose(&self, plan: &LoadTestPlan) -> FailureDiagnostic {
        let executor = self.executor.as_ref();

        let grep = format!(
            "grep -E 'Error|Exception|CRITICAL|WARNING' {} | tail -n 10",
            plan.console_log_path
        );
        let first_error_line = match command::run(executor, &grep).await {
            Ok(output) => output
                .stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string),
            Err(_) => None,
        };

        let script_present = presence(
            "script",
            command::run(executor, &format!("ls -la {}", plan.script_path)).await,
        );
        let generator_present = presence(
            "load generator",
            command::run(executor, &format!("which {}", self.executable)).await,
        );

        let diagnostic = FailureDiagnostic {
            first_error_line,
            script_present,
            generator_present,
        };
        warn!(?diagnostic, "Load test failed");
        diagnostic
    }

    async fn report_empty_output(&self, plan: &LoadTestPlan) {
        warn!("Load test exited successfully but produced no console output");

        let check = format!(
            "[ -f {csv} ] && echo 'CSV exists' || echo 'CSV missing'",
            csv = plan.csv_path
        );
        let exists = matches!(
            command::run(self.executor.as_ref(), &check).await,
            Ok(output) if output.stdout.contains("CSV exists")
        );
        if !exists {
            warn!(csv = %plan.csv_path, "Load test CSV is missing");
            return;
        }

        if let Ok(output) =
            command::run(self.executor.as_ref(), &format!("wc -l {}", plan.csv_path)).await
        {
            info!(stats = %output.stdout.trim(), "Load test CSV present");
        }
    }
}

/// Exit status of an existence check; a transport error leaves it unknown.
fn presence(what: &str, result: ChaosResult<CommandOutput>) -> Option<bool> {
    match result {
        Ok(output) => Some(output.success()),
        Err(e) => {
            warn!(what, error = %e, "Could not check whether prerequisite exists");
            None
        }
    }
}

fn remote_dirname(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => "",
    }
}

fn remote_basename(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

fn non_empty_dir(path: &str) -> String {
    match remote_dirname(path) {
        "" => ".".to_string(),
        dir => dir.to_string(),
    }
}

fn join_remote(dir: &str, file: &str) -> String {
    match dir {
        "" => file.to_string(),
        "/" => format!("/{}", file),
        dir => format!("{}/{}", dir.trim_end_matches('/'), file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaosrun_remote::{MockExecutor, MockResponse};

    const SCRIPT: &str = "/home/ubuntu/locust/locustfile.py";
    const CSV: &str = "/home/ubuntu/locust_log.csv";

    fn context(rate_mode: RequestRateMode) -> TrialContext {
        TrialContext {
            experiment: "pod-kill".to_string(),
            user_count: 5,
            timeout: 10,
            rate_mode,
            attempt: 1,
        }
    }

    fn executor(mock: &MockExecutor) -> LoadTestExecutor {
        LoadTestExecutor::new(Arc::new(mock.clone()), SCRIPT, CSV)
    }

    #[test]
    fn test_classify_exit_zero() {
        assert_eq!(classify(0, ""), TrialClassification::Success);
        assert_eq!(classify(0, "Traceback: Error"), TrialClassification::Success);
    }

    #[test]
    fn test_classify_run_time_limit() {
        assert_eq!(
            classify(1, "--run-time limit reached, shutting down"),
            TrialClassification::Success
        );
        assert_eq!(classify(1, "Shutting down (exit code 1)"), TrialClassification::Success);
        // Only exit 1 gets the run-time-limit exemption.
        assert_eq!(
            classify(2, "--run-time limit reached"),
            TrialClassification::Failure
        );
    }

    #[test]
    fn test_classify_warnings() {
        assert_eq!(
            classify(124, "All users spawned: {\"User\": 5}"),
            TrialClassification::SuccessWithWarnings
        );
        assert_eq!(
            classify(137, "Type Name # requests # fails"),
            TrialClassification::SuccessWithWarnings
        );
        assert_eq!(
            classify(2, "Shutting down"),
            TrialClassification::SuccessWithWarnings
        );
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(classify(1, ""), TrialClassification::Failure);
        assert_eq!(classify(127, "   \n"), TrialClassification::Failure);
        assert_eq!(
            classify(1, "ImportError: No module named locust"),
            TrialClassification::Failure
        );
    }

    #[test]
    fn test_plan_paths() {
        let plan = LoadTestPlan::new(SCRIPT, CSV, RequestRateMode::Concurrent);
        assert_eq!(plan.script_dir, "/home/ubuntu/locust");
        assert_eq!(plan.script_path, SCRIPT);
        assert_eq!(plan.csv_path, CSV);
        assert_eq!(plan.console_log_path, "/home/ubuntu/console_output.log");

        let piggy = LoadTestPlan::new(SCRIPT, CSV, RequestRateMode::Piggyback);
        assert_eq!(piggy.script_path, "/home/ubuntu/locust/locust_piggy_timeout.py");
        assert_eq!(piggy.csv_path, "/home/ubuntu/locust_log_piggyback_timeout.csv");
        assert_eq!(piggy.script_dir, "/home/ubuntu/locust");

        let already = LoadTestPlan::new("/opt/piggyback.py", CSV, RequestRateMode::Piggyback);
        assert_eq!(already.script_path, "/opt/piggyback.py");

        let relative = LoadTestPlan::new("locustfile.py", "log.csv", RequestRateMode::Concurrent);
        assert_eq!(relative.script_dir, ".");
        assert_eq!(relative.console_log_path, "./console_output.log");
    }

    #[test]
    fn test_command_fixed_interval() {
        let plan = LoadTestPlan::new(SCRIPT, CSV, RequestRateMode::FixedInterval(0.5));
        let command = plan.command(
            &context(RequestRateMode::FixedInterval(0.5)),
            10,
            "/home/ubuntu/.local/bin/locust",
        );
        assert_eq!(
            command,
            "cd /home/ubuntu/locust && env PIGGY_TIMEOUT=10 CONSTANT_RATE_INTERVAL=0.5 \
             timeout --kill-after=15s 660s /home/ubuntu/.local/bin/locust -f locustfile.py \
             --headless -u 5 --run-time 10m --csv /home/ubuntu/locust_log \
             > /home/ubuntu/console_output.log 2>&1"
        );
    }

    #[test]
    fn test_command_whole_interval_has_no_fraction() {
        let plan = LoadTestPlan::new(SCRIPT, CSV, RequestRateMode::FixedInterval(2.0));
        let command = plan.command(&context(RequestRateMode::FixedInterval(2.0)), 1, "locust");
        assert!(command.contains("CONSTANT_RATE_INTERVAL=2 timeout"));
    }

    #[test]
    fn test_command_concurrent_has_no_interval() {
        let plan = LoadTestPlan::new(SCRIPT, CSV, RequestRateMode::Concurrent);
        let command = plan.command(&context(RequestRateMode::Concurrent), 1, "locust");
        assert!(command.contains("env PIGGY_TIMEOUT=10 timeout --kill-after=15s 120s"));
        assert!(!command.contains("CONSTANT_RATE_INTERVAL"));
    }

    #[tokio::test]
    async fn test_run_success() {
        let mock = MockExecutor::new("client");
        mock.respond("tail -n 300", CommandOutput::new(0, "Aggregated 100 0(0.00%) | 42\n", ""));

        let outcome = executor(&mock)
            .run(&context(RequestRateMode::Concurrent), 10)
            .await
            .unwrap();

        assert_eq!(outcome.classification, TrialClassification::Success);
        assert!(outcome.diagnostic.is_none());
        let commands = mock.commands();
        assert_eq!(
            commands[0],
            "rm -f /home/ubuntu/console_output.log /home/ubuntu/locust_log.csv"
        );
        assert!(commands[1].contains("--headless -u 5"));
        assert_eq!(commands[2], "tail -n 300 /home/ubuntu/console_output.log");
        assert_eq!(commands.len(), 3);
    }

    #[tokio::test]
    async fn test_run_failure_collects_diagnostic() {
        let mock = MockExecutor::new("client");
        mock.respond("timeout --kill-after", CommandOutput::new(1, "", ""));
        mock.respond("tail -n 300", CommandOutput::new(0, "", ""));
        mock.respond(
            "grep -E",
            CommandOutput::new(0, "ConnectionError: refused\nWARNING: retrying\n", ""),
        );

        let load = executor(&mock);
        let outcome = load
            .run(&context(RequestRateMode::Concurrent), 10)
            .await
            .unwrap();

        assert_eq!(outcome.classification, TrialClassification::Failure);
        let diagnostic = outcome.diagnostic.clone().unwrap();
        assert_eq!(
            diagnostic.first_error_line.as_deref(),
            Some("ConnectionError: refused")
        );
        assert!(!diagnostic.missing_prerequisite());

        let err = outcome
            .failure(&load.plan(RequestRateMode::Concurrent), load.executable())
            .unwrap();
        assert!(matches!(err, ChaosError::TrialFailure { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_generator_is_not_retryable() {
        let mock = MockExecutor::new("client");
        mock.respond("timeout --kill-after", CommandOutput::new(127, "", ""));
        mock.respond("tail -n 300", CommandOutput::new(0, "", ""));
        mock.respond("which ", CommandOutput::new(1, "", ""));

        let load = executor(&mock);
        let outcome = load
            .run(&context(RequestRateMode::Concurrent), 10)
            .await
            .unwrap();

        let err = outcome
            .failure(&load.plan(RequestRateMode::Concurrent), load.executable())
            .unwrap();
        assert!(matches!(err, ChaosError::MissingPrerequisite { .. }));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Load generator not found"));
    }

    #[tokio::test]
    async fn test_unreachable_prerequisite_check_stays_retryable() {
        let mock = MockExecutor::new("client");
        mock.respond("timeout --kill-after", CommandOutput::new(1, "", ""));
        mock.respond("tail -n 300", CommandOutput::new(0, "", ""));
        mock.respond_sequence("which ", vec![MockResponse::transport("connection reset")]);

        let load = executor(&mock);
        let outcome = load
            .run(&context(RequestRateMode::Concurrent), 10)
            .await
            .unwrap();

        let diagnostic = outcome.diagnostic.clone().unwrap();
        assert_eq!(diagnostic.script_present, Some(true));
        assert_eq!(diagnostic.generator_present, None);
        assert!(!diagnostic.missing_prerequisite());

        let err = outcome
            .failure(&load.plan(RequestRateMode::Concurrent), load.executable())
            .unwrap();
        assert!(matches!(err, ChaosError::TrialFailure { .. }));
        assert!(!err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_run_transport_error() {
        let mock = MockExecutor::new("client");
        mock.respond_sequence(
            "timeout --kill-after",
            vec![MockResponse::transport("connection lost")],
        );

        let result = executor(&mock)
            .run(&context(RequestRateMode::Concurrent), 10)
            .await;
        assert!(matches!(result, Err(ChaosError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_empty_output_checks_csv() {
        let mock = MockExecutor::new("client");
        mock.respond("echo 'CSV exists'", CommandOutput::new(0, "CSV exists\n", ""));

        let outcome = executor(&mock)
            .run(&context(RequestRateMode::Piggyback), 10)
            .await
            .unwrap();

        assert_eq!(outcome.classification, TrialClassification::Success);
        assert_eq!(
            mock.count_matching("wc -l /home/ubuntu/locust_log_piggyback_timeout.csv"),
            1
        );
    }
}
