use std::time::Duration;

use chaosrun_core::{ChaosResult, CommandOutput, RemoteExecutor};
use tracing::debug;

use crate::metrics::REMOTE_COMMANDS;

/// Runs a command and records its outcome.
pub(crate) async fn run(executor: &dyn RemoteExecutor, command: &str) -> ChaosResult<CommandOutput> {
    let result = executor.run_command(command).await;
    record(executor.host(), command, &result);
    result
}

/// Runs a command with an explicit bound and records its outcome.
pub(crate) async fn run_bounded(
    executor: &dyn RemoteExecutor,
    command: &str,
    timeout: Duration,
) -> ChaosResult<CommandOutput> {
    let result = executor.run_command_with_timeout(command, timeout).await;
    record(executor.host(), command, &result);
    result
}

fn record(host: &str, command: &str, result: &ChaosResult<CommandOutput>) {
    let outcome = match result {
        Ok(output) if output.success() => "ok",
        Ok(output) => {
            debug!(host, command, exit_status = output.exit_status, "Remote command exited non-zero");
            "nonzero"
        }
        Err(e) => {
            debug!(host, command, error = %e, "Remote command failed");
            "transport"
        }
    };
    REMOTE_COMMANDS.with_label_values(&[host, outcome]).inc();
}
