use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use chaosrun_core::{
    ChaosError, ChaosRunConfig, ClusterTopology, RemoteExecutor, ResultLayout, ResultStore,
};
use chaosrun_engine::{
    export_prometheus, ChaosLifecycleController, ClusterHealthMonitor, ExperimentScheduler,
    RunSummary, SchedulerPolicy,
};
use chaosrun_remote::SshExecutor;
use chaosrun_results::FsResultStore;

#[derive(Parser, Debug)]
#[command(name = "chaosrun")]
#[command(about = "Chaos experiment orchestration for Kubernetes clusters", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every configured experiment
    Run {
        /// Configuration file (defaults to $CHAOSRUN_CONFIG or ./config.yaml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write Prometheus metrics to this file when the run ends
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },

    /// Run one cluster health pass against the control host
    Check {
        /// Configuration file (defaults to $CHAOSRUN_CONFIG or ./config.yaml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Application namespace to check (defaults to app_namespace)
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Generate a configuration template
    GenerateConfig {
        /// Output configuration file path
        #[arg(long, default_value = "config.yaml")]
        output: String,
    },

    /// Regenerate the summary CSV of an existing trial directory
    Summarize {
        /// Trial result directory
        dir: PathBuf,

        /// Experiment name written to the summary (defaults to the directory label)
        #[arg(long)]
        schedule: Option<String>,

        /// Number of control-plane nodes
        #[arg(long, default_value = "1")]
        masters: u32,

        /// Number of worker nodes
        #[arg(long, default_value = "3")]
        workers: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            metrics_file,
        } => {
            let config = ChaosRunConfig::load(config.as_deref())?;
            let experiments = config.experiments()?;
            info!(
                experiments = experiments.len(),
                result_base = %config.result_base.display(),
                "Loaded configuration"
            );

            let master: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(
                config.master.clone(),
                config.transport.clone(),
            ));
            let client: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(
                config.client.clone(),
                config.transport.clone(),
            ));

            if let Err(e) = connect_all(&[&master, &client]).await {
                error!(error = %e, "Failed to connect to remote hosts");
                close_all(&[&master, &client]).await;
                std::process::exit(1);
            }

            let result = run_experiments(&config, &experiments, master.clone(), client.clone()).await;
            close_all(&[&master, &client]).await;

            if let Some(path) = metrics_file {
                write_metrics(&path)?;
            }

            match result {
                Ok(summary) => {
                    print_summary(&summary);
                    Ok(())
                }
                Err(ChaosError::Precondition(reason)) => {
                    println!("\n⚠️  Run aborted: {}", reason);
                    std::process::exit(1);
                }
                Err(e) => Err(e.into()),
            }
        }

        Commands::Check { config, namespace } => {
            let config = ChaosRunConfig::load(config.as_deref())?;
            let master: Arc<dyn RemoteExecutor> =
                Arc::new(SshExecutor::new(config.master.clone(), config.transport.clone()));

            if let Err(e) = master.connect().await {
                error!(host = %config.master.host, error = %e, "Failed to connect to control host");
                std::process::exit(1);
            }

            let monitor = ClusterHealthMonitor::new(
                master.clone(),
                config.app_namespace.clone(),
                config.chaos_namespace.clone(),
            );
            let namespace = namespace.unwrap_or_else(|| config.app_namespace.clone());
            println!("🔍 Checking cluster health (namespace: {})...\n", namespace);

            let report = monitor.check_namespace(&namespace).await;
            if let Err(e) = master.close().await {
                warn!(error = %e, "Failed to close control host session");
            }

            println!("{}", report);
            if !report.is_healthy() {
                println!("\n⚠️  Cluster is not healthy!");
                std::process::exit(1);
            }

            Ok(())
        }

        Commands::GenerateConfig { output } => {
            println!("📝 Generating chaosrun configuration template...");

            let template = r#"# chaosrun configuration
# Every key can be overridden with CHAOSRUN_<KEY>, nested keys joined by "__"
# (e.g. CHAOSRUN_CLUSTER_CHECKS__SKIP=true).

# Control host with kubectl access
master:
  host: 10.0.0.10
  user: ubuntu
  key_path: ~/.ssh/id_rsa
  port: 22

# Host running the load generator
client:
  host: 10.0.0.20
  user: ubuntu
  key_path: ~/.ssh/id_rsa
  port: 22

result_base: results
app_namespace: image-detection
chaos_namespace: chaos-mesh
timeout_recovery_seconds: 120  # pause between timeouts, never below 120
check_between_timeouts: true
test_duration_minutes: 10

cluster_checks:
  skip: false
  continue_on_fail: false
  wait_for_ready: true
  max_wait_attempts: 30
  retry_interval: 10  # seconds between health polls
  locust_retry_count: 3  # attempts per grid cell
  check_before_each_experiment: false
  check_after_recovery: true
  rollout_timeout_seconds: 300

load_generator:
  executable: /home/ubuntu/.local/bin/locust
  retry_delay_seconds: 5
  scratch_cleanup: "rm -f /home/ubuntu/*.csv /home/ubuntu/*.log /home/ubuntu/console_output.log"

transport:
  connect_timeout_seconds: 200
  command_timeout_seconds: 900
  transfer_timeout_seconds: 300
  keepalive_seconds: 15

experiments:
  # Chaos Mesh schedule, deleted between trials
  - chaos_yaml: chaos/pod-kill.yaml
    delete_schedule: pod-kill-schedule
    locust_script: /home/ubuntu/locust/locustfile.py
    locust_log: /home/ubuntu/locust_log.csv
    timeouts: [5, 10]
    user_counts: [1, 5]
    request_rate: 1.0  # seconds between requests; -1 concurrent, -2 piggyback
    recovery_wait_seconds: 60
    master_count: 1
    worker_count: 3

  # Node fault script, run on the control host
  - chaos_yaml: chaos/stop_kubelet.sh
    locust_script: /home/ubuntu/locust/locustfile.py
    locust_log: /home/ubuntu/locust_log.csv
    timeouts: [10]
    user_counts: [1]
    recovery_wait_seconds: 120
    timeout_recovery_seconds: 180
"#;

            std::fs::write(&output, template)?;
            println!("✅ Configuration template written to: {}", output);
            println!("\nEdit the file and use it with:");
            println!("  chaosrun check --config {}", output);
            println!("  chaosrun run --config {}", output);

            Ok(())
        }

        Commands::Summarize {
            dir,
            schedule,
            masters,
            workers,
        } => {
            let topology = ClusterTopology {
                master_count: masters,
                worker_count: workers,
            };
            let path = chaosrun_results::write_summary(&dir, schedule.as_deref(), topology)?;
            println!("✅ Summary written to: {}", path.display());

            Ok(())
        }
    }
}

async fn run_experiments(
    config: &ChaosRunConfig,
    experiments: &[chaosrun_core::ExperimentSpec],
    master: Arc<dyn RemoteExecutor>,
    client: Arc<dyn RemoteExecutor>,
) -> Result<RunSummary, ChaosError> {
    let monitor = ClusterHealthMonitor::new(
        master.clone(),
        config.app_namespace.clone(),
        config.chaos_namespace.clone(),
    )
    .with_rollout_timeout(std::time::Duration::from_secs(
        config.cluster_checks.rollout_timeout_seconds,
    ));
    let controller = ChaosLifecycleController::new(master.clone(), config.chaos_namespace.clone())
        .with_node_user(config.master.user.clone());
    let store: Arc<dyn ResultStore> =
        Arc::new(FsResultStore::new(client.clone()).with_control_host(master));

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} cells {msg}")
            .map_err(|e| ChaosError::Config(format!("invalid progress template: {}", e)))?
            .progress_chars("#>-"),
    );

    let scheduler = ExperimentScheduler::new(
        monitor,
        controller,
        client,
        store,
        ResultLayout::new(config.result_base.clone()),
        SchedulerPolicy::from_config(config),
    )
    .with_progress(progress.clone());

    let result = scheduler.run(experiments).await;
    progress.finish_and_clear();
    result
}

async fn connect_all(hosts: &[&Arc<dyn RemoteExecutor>]) -> Result<(), ChaosError> {
    for host in hosts {
        host.connect().await?;
    }
    Ok(())
}

async fn close_all(hosts: &[&Arc<dyn RemoteExecutor>]) {
    for host in hosts {
        if let Err(e) = host.close().await {
            warn!(error = %e, "Failed to close remote session");
        }
    }
}

fn write_metrics(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, export_prometheus())?;
    info!(path = %path.display(), "Metrics written");
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("\n📊 Run summary:");
    println!("  Experiments: {}", summary.experiments.len());
    println!("  Cells completed: {}", summary.completed());
    println!("  Cells failed: {}", summary.failed());
    println!("  Cells skipped: {}", summary.skipped());
    println!(
        "  Node recovery: {}",
        if summary.nodes_recovered { "ok" } else { "failed" }
    );
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}
