//! Experiment domain types shared by the engine and the result store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ChaosError;

/// A fault to inject, decided once when the configuration is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultDefinition {
    /// Declarative chaos-mesh manifest applied with `kubectl apply`.
    Manifest { path: PathBuf },
    /// Shell script launched in the background on the control host.
    Script { path: PathBuf },
}

impl FaultDefinition {
    /// Classifies a configured path. Anything ending in `.sh` is a script.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.extension().map(|ext| ext == "sh").unwrap_or(false) {
            Self::Script { path }
        } else {
            Self::Manifest { path }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Manifest { path } | Self::Script { path } => path,
        }
    }

    pub fn is_script(&self) -> bool {
        matches!(self, Self::Script { .. })
    }

    /// File name of the definition, or the full path if it has none.
    pub fn file_name(&self) -> String {
        self.path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path().display().to_string())
    }

    /// Short kind label used in reports and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Manifest { .. } => "yaml",
            Self::Script { .. } => "shell_script",
        }
    }
}

/// Request issuance policy for a trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRequestRate", into = "RawRequestRate")]
pub enum RequestRateMode {
    /// Fixed number of seconds between requests of one user.
    FixedInterval(f64),
    /// No delay between requests.
    Concurrent,
    /// Request timing driven by the piggyback timeout script.
    Piggyback,
}

/// Wire form accepted in configuration: legacy numbers or mode names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawRequestRate {
    Number(f64),
    Name(String),
}

impl TryFrom<RawRequestRate> for RequestRateMode {
    type Error = ChaosError;

    fn try_from(raw: RawRequestRate) -> Result<Self, Self::Error> {
        match raw {
            RawRequestRate::Number(value) => Self::from_legacy(value),
            RawRequestRate::Name(name) => match name.trim().to_ascii_lowercase().as_str() {
                "concurrent" => Ok(Self::Concurrent),
                "piggyback" => Ok(Self::Piggyback),
                other => other
                    .parse::<f64>()
                    .map_err(|_| {
                        ChaosError::Config(format!(
                            "unknown request_rate '{}', expected a positive number, 'concurrent' or 'piggyback'",
                            name
                        ))
                    })
                    .and_then(Self::from_legacy),
            },
        }
    }
}

impl From<RequestRateMode> for RawRequestRate {
    fn from(mode: RequestRateMode) -> Self {
        match mode {
            RequestRateMode::FixedInterval(seconds) => Self::Number(seconds),
            RequestRateMode::Concurrent => Self::Name("concurrent".to_string()),
            RequestRateMode::Piggyback => Self::Name("piggyback".to_string()),
        }
    }
}

impl RequestRateMode {
    /// Decodes the numeric form: `-1` concurrent, `-2` piggyback, positive fixed interval.
    pub fn from_legacy(value: f64) -> Result<Self, ChaosError> {
        if value == -1.0 {
            Ok(Self::Concurrent)
        } else if value == -2.0 {
            Ok(Self::Piggyback)
        } else if value > 0.0 && value.is_finite() {
            Ok(Self::FixedInterval(value))
        } else {
            Err(ChaosError::Config(format!(
                "request_rate {} is invalid: use a positive interval, -1 (concurrent) or -2 (piggyback)",
                value
            )))
        }
    }

    /// Directory segment below `users_<n>`.
    pub fn dir_segment(&self) -> String {
        match self {
            Self::FixedInterval(seconds) => format!("rate_{}s", seconds),
            Self::Concurrent => "concurrent_mode".to_string(),
            Self::Piggyback => "piggyback_mode".to_string(),
        }
    }

    /// Inverse of [`dir_segment`](Self::dir_segment).
    pub fn from_dir_segment(segment: &str) -> Option<Self> {
        match segment {
            "concurrent_mode" => Some(Self::Concurrent),
            "piggyback_mode" => Some(Self::Piggyback),
            other => other
                .strip_prefix("rate_")
                .and_then(|rest| rest.strip_suffix('s'))
                .and_then(|value| value.parse::<f64>().ok())
                .filter(|value| *value > 0.0)
                .map(Self::FixedInterval),
        }
    }

    pub fn is_piggyback(&self) -> bool {
        matches!(self, Self::Piggyback)
    }

    /// Interval passed to the generator as `CONSTANT_RATE_INTERVAL`, if any.
    pub fn interval(&self) -> Option<f64> {
        match self {
            Self::FixedInterval(seconds) => Some(*seconds),
            _ => None,
        }
    }
}

impl fmt::Display for RequestRateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedInterval(seconds) => write!(f, "rate={}s", seconds),
            Self::Concurrent => write!(f, "concurrent mode"),
            Self::Piggyback => write!(f, "piggyback mode"),
        }
    }
}

/// Cluster shape recorded in summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub master_count: u32,
    pub worker_count: u32,
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self {
            master_count: 1,
            worker_count: 3,
        }
    }
}

/// One fully-resolved experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSpec {
    /// Label used for logging and as the top-level result directory.
    pub label: String,
    pub fault: FaultDefinition,
    /// Chaos-mesh schedule created by the manifest, if any.
    pub schedule_name: Option<String>,
    /// Load-test script path on the load-generator host.
    pub load_script: String,
    /// CSV written by the load generator on its host.
    pub load_csv: String,
    pub timeouts: Vec<u64>,
    pub user_counts: Vec<u32>,
    pub rate_mode: RequestRateMode,
    /// Pause between user counts and after the experiment.
    pub recovery_wait: Duration,
    /// Pause between timeouts of one user count.
    pub timeout_recovery: Duration,
    pub topology: ClusterTopology,
}

impl ExperimentSpec {
    /// Experiment name written into summaries: the schedule for manifests,
    /// the script file name for scripts.
    pub fn summary_name(&self) -> Option<String> {
        match &self.fault {
            FaultDefinition::Script { .. } => Some(self.fault.file_name()),
            FaultDefinition::Manifest { .. } => self.schedule_name.clone(),
        }
    }

    /// Number of (user count, timeout) cells in the grid.
    pub fn cell_count(&self) -> usize {
        self.user_counts.len() * self.timeouts.len()
    }
}

/// Immutable identity of one trial attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialContext {
    pub experiment: String,
    pub user_count: u32,
    pub timeout: u64,
    pub rate_mode: RequestRateMode,
    pub attempt: u32,
}

/// Verdict for a single load-test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialClassification {
    Success,
    SuccessWithWarnings,
    Failure,
}

impl TrialClassification {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SuccessWithWarnings => "success_with_warnings",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for TrialClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat description of a captured trial, written to `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMetadata {
    pub user_count: u32,
    pub timeout: u64,
    pub test_duration_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TrialClassification>,
    #[serde(default)]
    pub attempts: u32,
    /// Load-test script file name, shown in the report.
    #[serde(default)]
    pub load_script: String,
    /// Namespace of the application under test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
}

impl TrialMetadata {
    pub fn new(
        user_count: u32,
        timeout: u64,
        test_duration_minutes: u64,
        rate_mode: RequestRateMode,
    ) -> Self {
        let (request_mode, request_rate) = match rate_mode {
            RequestRateMode::FixedInterval(seconds) => (None, Some(seconds)),
            RequestRateMode::Concurrent => (Some("concurrent".to_string()), None),
            RequestRateMode::Piggyback => (Some("piggyback".to_string()), None),
        };
        Self {
            user_count,
            timeout,
            test_duration_minutes,
            request_mode,
            request_rate,
            outcome: None,
            attempts: 0,
            load_script: String::new(),
            application: None,
        }
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: TrialClassification, attempts: u32) -> Self {
        self.outcome = Some(outcome);
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_load_script(mut self, script: impl Into<String>) -> Self {
        self.load_script = script.into();
        self
    }

    #[must_use]
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    /// Rate mode recovered from the flat fields.
    pub fn rate_mode(&self) -> Option<RequestRateMode> {
        match self.request_mode.as_deref() {
            Some("concurrent") => Some(RequestRateMode::Concurrent),
            Some("piggyback") => Some(RequestRateMode::Piggyback),
            _ => self.request_rate.map(RequestRateMode::FixedInterval),
        }
    }

    /// Ordered key/value pairs for human-readable output.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = Vec::new();
        if let Some(application) = &self.application {
            entries.push(("application", application.clone()));
        }
        entries.extend([
            ("user_count", self.user_count.to_string()),
            ("timeout", self.timeout.to_string()),
            ("test_duration_minutes", self.test_duration_minutes.to_string()),
        ]);
        if let Some(mode) = &self.request_mode {
            entries.push(("request_mode", mode.clone()));
        }
        if let Some(rate) = self.request_rate {
            entries.push(("request_rate", format!("{:?}", rate)));
        }
        if let Some(outcome) = self.outcome {
            entries.push(("outcome", outcome.to_string()));
            entries.push(("attempts", self.attempts.to_string()));
        }
        entries
    }
}
