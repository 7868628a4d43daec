//! Configuration management for chaos runs
//!
//! Configuration is read from a YAML file, overlaid with `CHAOSRUN_*`
//! environment variables (`__` separates nested keys), and validated before
//! any remote host is contacted.

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChaosError, ChaosResult};
use crate::experiment::{ClusterTopology, ExperimentSpec, FaultDefinition, RequestRateMode};

/// Lower bound applied to every inter-timeout recovery pause.
pub const MIN_TIMEOUT_RECOVERY_SECS: u64 = 120;

/// Root configuration for a chaos run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChaosRunConfig {
    /// Control host with `kubectl` access.
    pub master: HostConfig,

    /// Host running the load generator.
    pub client: HostConfig,

    pub result_base: PathBuf,

    pub app_namespace: String,

    pub chaos_namespace: String,

    /// Global pause between timeouts, floored at [`MIN_TIMEOUT_RECOVERY_SECS`].
    pub timeout_recovery_seconds: u64,

    pub check_between_timeouts: bool,

    pub test_duration_minutes: u64,

    #[serde(default)]
    pub cluster_checks: ClusterCheckConfig,

    #[serde(default)]
    pub load_generator: LoadGeneratorConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub experiments: Vec<ExperimentConfig>,
}

/// SSH endpoint of one host.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    pub host: String,
    pub user: String,
    pub key_path: PathBuf,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

/// Health gating policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterCheckConfig {
    /// Disable every health check and deployment restart.
    pub skip: bool,
    pub continue_on_fail: bool,
    pub wait_for_ready: bool,
    pub max_wait_attempts: u32,
    /// Seconds between health polls.
    pub retry_interval: u64,
    /// Attempt budget for one load-test cell.
    pub locust_retry_count: u32,
    pub check_before_each_experiment: bool,
    pub check_after_recovery: bool,
    pub rollout_timeout_seconds: u64,
}

impl Default for ClusterCheckConfig {
    fn default() -> Self {
        Self {
            skip: false,
            continue_on_fail: false,
            wait_for_ready: true,
            max_wait_attempts: 30,
            retry_interval: 10,
            locust_retry_count: 3,
            check_before_each_experiment: false,
            check_after_recovery: true,
            rollout_timeout_seconds: 300,
        }
    }
}

impl ClusterCheckConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

/// Load generator invocation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadGeneratorConfig {
    pub executable: String,
    pub retry_delay_seconds: u64,
    /// Command run on the client after all experiments to free disk space.
    pub scratch_cleanup: String,
}

impl Default for LoadGeneratorConfig {
    fn default() -> Self {
        Self {
            executable: "/home/ubuntu/.local/bin/locust".to_string(),
            retry_delay_seconds: 5,
            scratch_cleanup:
                "rm -f /home/ubuntu/*.csv /home/ubuntu/*.log /home/ubuntu/console_output.log"
                    .to_string(),
        }
    }
}

impl LoadGeneratorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

/// Bounds for remote operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    pub connect_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    pub transfer_timeout_seconds: u64,
    pub keepalive_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 200,
            command_timeout_seconds: 900,
            transfer_timeout_seconds: 300,
            keepalive_seconds: 15,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_seconds)
    }
}

/// One experiment as written in the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentConfig {
    /// Chaos manifest or `.sh` script.
    pub chaos_yaml: PathBuf,

    /// Schedule created by the manifest, deleted on reset.
    #[serde(default)]
    pub delete_schedule: Option<String>,

    pub locust_script: String,

    pub locust_log: String,

    #[serde(default)]
    pub timeouts: Vec<u64>,

    #[serde(default = "default_user_counts")]
    pub user_counts: Vec<u32>,

    #[serde(default)]
    pub recovery_wait_seconds: u64,

    #[serde(default = "default_request_rate")]
    pub request_rate: RequestRateMode,

    /// Overrides the global inter-timeout pause.
    #[serde(default)]
    pub timeout_recovery_seconds: Option<u64>,

    #[serde(default = "default_master_count")]
    pub master_count: u32,

    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
}

fn default_user_counts() -> Vec<u32> {
    vec![1]
}

fn default_request_rate() -> RequestRateMode {
    RequestRateMode::FixedInterval(1.0)
}

fn default_master_count() -> u32 {
    1
}

fn default_worker_count() -> u32 {
    3
}

impl ChaosRunConfig {
    /// Load configuration with precedence:
    /// 1. `CHAOSRUN_*` environment variables
    /// 2. The given file, or the file named by `CHAOSRUN_CONFIG`, or `./config.yaml`
    /// 3. Defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults(Config::builder())?;

        builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => match std::env::var("CHAOSRUN_CONFIG") {
                Ok(path) => builder.add_source(File::with_name(&path)),
                Err(_) => builder.add_source(File::with_name("config.yaml")),
            },
        };

        // Example: CHAOSRUN_CLUSTER_CHECKS__SKIP=true
        builder = builder.add_source(
            Environment::with_prefix("CHAOSRUN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ChaosRunConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document on top of the defaults, without environment overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ChaosRunConfig = Self::set_defaults(Config::builder())?
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("master.port", 22)?
            .set_default("client.port", 22)?
            .set_default("result_base", "results")?
            .set_default("app_namespace", "image-detection")?
            .set_default("chaos_namespace", "chaos-mesh")?
            .set_default("timeout_recovery_seconds", 60)?
            .set_default("check_between_timeouts", true)?
            .set_default("test_duration_minutes", 10)?
            // Cluster checks
            .set_default("cluster_checks.skip", false)?
            .set_default("cluster_checks.continue_on_fail", false)?
            .set_default("cluster_checks.wait_for_ready", true)?
            .set_default("cluster_checks.max_wait_attempts", 30)?
            .set_default("cluster_checks.retry_interval", 10)?
            .set_default("cluster_checks.locust_retry_count", 3)?
            .set_default("cluster_checks.check_before_each_experiment", false)?
            .set_default("cluster_checks.check_after_recovery", true)?
            .set_default("cluster_checks.rollout_timeout_seconds", 300)?
            // Load generator
            .set_default("load_generator.executable", "/home/ubuntu/.local/bin/locust")?
            .set_default("load_generator.retry_delay_seconds", 5)?
            .set_default(
                "load_generator.scratch_cleanup",
                "rm -f /home/ubuntu/*.csv /home/ubuntu/*.log /home/ubuntu/console_output.log",
            )?
            // Transport
            .set_default("transport.connect_timeout_seconds", 200)?
            .set_default("transport.command_timeout_seconds", 900)?
            .set_default("transport.transfer_timeout_seconds", 300)?
            .set_default("transport.keepalive_seconds", 15)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (role, host) in [("master", &self.master), ("client", &self.client)] {
            if host.host.trim().is_empty() {
                return Err(ConfigError::Message(format!("{}.host must not be empty", role)));
            }
            if host.user.trim().is_empty() {
                return Err(ConfigError::Message(format!("{}.user must not be empty", role)));
            }
            if host.key_path.as_os_str().is_empty() {
                return Err(ConfigError::Message(format!(
                    "{}.key_path must not be empty",
                    role
                )));
            }
        }

        if self.cluster_checks.max_wait_attempts == 0 {
            return Err(ConfigError::Message(
                "cluster_checks.max_wait_attempts must be > 0".to_string(),
            ));
        }

        if self.cluster_checks.locust_retry_count == 0 {
            return Err(ConfigError::Message(
                "cluster_checks.locust_retry_count must be > 0".to_string(),
            ));
        }

        if self.test_duration_minutes == 0 {
            return Err(ConfigError::Message(
                "test_duration_minutes must be > 0".to_string(),
            ));
        }

        for (idx, experiment) in self.experiments.iter().enumerate() {
            let position = idx + 1;
            if experiment.timeouts.is_empty() {
                return Err(ConfigError::Message(format!(
                    "experiments[{}].timeouts must not be empty",
                    position
                )));
            }
            if experiment.timeouts.iter().any(|timeout| *timeout == 0) {
                return Err(ConfigError::Message(format!(
                    "experiments[{}].timeouts must all be > 0",
                    position
                )));
            }
            if experiment.user_counts.is_empty() {
                return Err(ConfigError::Message(format!(
                    "experiments[{}].user_counts must not be empty",
                    position
                )));
            }
            if experiment.user_counts.iter().any(|users| *users == 0) {
                return Err(ConfigError::Message(format!(
                    "experiments[{}].user_counts must all be > 0",
                    position
                )));
            }
            if experiment.locust_script.trim().is_empty() || experiment.locust_log.trim().is_empty()
            {
                return Err(ConfigError::Message(format!(
                    "experiments[{}] needs locust_script and locust_log",
                    position
                )));
            }
        }

        Ok(())
    }

    /// Effective inter-timeout pause for an experiment.
    pub fn timeout_recovery(&self, experiment: &ExperimentConfig) -> Duration {
        let seconds = experiment
            .timeout_recovery_seconds
            .unwrap_or(self.timeout_recovery_seconds)
            .max(MIN_TIMEOUT_RECOVERY_SECS);
        Duration::from_secs(seconds)
    }

    /// Resolve the configured experiments into their runnable form.
    pub fn experiments(&self) -> ChaosResult<Vec<ExperimentSpec>> {
        self.experiments
            .iter()
            .enumerate()
            .map(|(idx, raw)| {
                let fault = FaultDefinition::from_path(raw.chaos_yaml.clone());
                let schedule_name = raw
                    .delete_schedule
                    .as_ref()
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty());

                let label = if fault.is_script() {
                    fault.file_name()
                } else {
                    schedule_name
                        .clone()
                        .unwrap_or_else(|| format!("experiment_{}", idx + 1))
                };

                if raw.timeouts.is_empty() || raw.user_counts.is_empty() {
                    return Err(ChaosError::Config(format!(
                        "experiment '{}' has an empty grid",
                        label
                    )));
                }

                Ok(ExperimentSpec {
                    label,
                    fault,
                    schedule_name,
                    load_script: raw.locust_script.clone(),
                    load_csv: raw.locust_log.clone(),
                    timeouts: raw.timeouts.clone(),
                    user_counts: raw.user_counts.clone(),
                    rate_mode: raw.request_rate,
                    recovery_wait: Duration::from_secs(raw.recovery_wait_seconds),
                    timeout_recovery: self.timeout_recovery(raw),
                    topology: ClusterTopology {
                        master_count: raw.master_count,
                        worker_count: raw.worker_count,
                    },
                })
            })
            .collect()
    }
}
