//! OpenSSH-backed executor.
//!
//! One multiplexed master connection is opened per host (`ControlMaster`),
//! and every command, upload and download reuses it. Commands on one
//! executor are serialized behind an async mutex.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use chaosrun_core::{
    ChaosError, ChaosResult, CommandOutput, HostConfig, RemoteExecutor, TransportConfig,
};

/// Exit status OpenSSH reserves for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Executes commands on a host through the system `ssh` and `scp` binaries.
pub struct SshExecutor {
    host: HostConfig,
    transport: TransportConfig,
    key_path: PathBuf,
    control_path: PathBuf,
    session: Mutex<bool>,
}

impl SshExecutor {
    pub fn new(host: HostConfig, transport: TransportConfig) -> Self {
        let key_path = expand_home(&host.key_path);
        let control_path = std::env::temp_dir().join(format!(
            "chaosrun-{}-{}@{}-{}.sock",
            std::process::id(),
            host.user,
            host.host,
            host.port
        ));
        Self {
            host,
            transport,
            key_path,
            control_path,
            session: Mutex::new(false),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.host.user, self.host.host)
    }

    /// Options shared by `ssh` and `scp`.
    fn common_options(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.transport.connect_timeout_seconds),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.transport.keepalive_seconds),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ]
    }

    fn ssh_command(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .args(self.common_options())
            .arg("-p")
            .arg(self.host.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn scp_command(&self) -> Command {
        let mut command = Command::new("scp");
        command
            .arg("-q")
            .args(self.common_options())
            .arg("-P")
            .arg(self.host.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Runs a prepared process under a deadline and collects its output.
    async fn execute(
        &self,
        mut command: Command,
        operation: &str,
        timeout: Duration,
    ) -> ChaosResult<CommandOutput> {
        let child = command.spawn().map_err(|e| {
            ChaosError::transport(&self.host.host, format!("failed to spawn {}: {}", operation, e))
        })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ChaosError::timeout(operation, timeout.as_secs()))?
            .map_err(|e| {
                ChaosError::transport(&self.host.host, format!("{} failed: {}", operation, e))
            })?;

        Ok(CommandOutput {
            // Killed by a signal: report like a shell would.
            exit_status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn ensure_connected(&self, connected: &mut bool) -> ChaosResult<()> {
        if *connected {
            return Ok(());
        }

        let mut command = self.ssh_command();
        command
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes", "-N", "-f"])
            .arg(self.destination());

        let output = self
            .execute(command, "ssh connect", self.transport.connect_timeout())
            .await?;
        if !output.success() {
            return Err(ChaosError::transport(
                &self.host.host,
                format!("ssh connect exited with {}: {}", output.exit_status, output.stderr.trim()),
            ));
        }

        *connected = true;
        info!(host = %self.host.host, user = %self.host.user, "SSH session established");
        Ok(())
    }

    async fn transfer(&self, source: String, target: String, operation: &str) -> ChaosResult<()> {
        let mut connected = self.session.lock().await;
        self.ensure_connected(&mut connected).await?;

        let mut command = self.scp_command();
        command.arg(&source).arg(&target);

        let output = self
            .execute(command, operation, self.transport.transfer_timeout())
            .await?;
        if !output.success() {
            return Err(ChaosError::transport(
                &self.host.host,
                format!(
                    "{} {} -> {} exited with {}: {}",
                    operation,
                    source,
                    target,
                    output.exit_status,
                    output.stderr.trim()
                ),
            ));
        }
        debug!(host = %self.host.host, source = %source, target = %target, "{} complete", operation);
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn host(&self) -> &str {
        &self.host.host
    }

    async fn connect(&self) -> ChaosResult<()> {
        let mut connected = self.session.lock().await;
        self.ensure_connected(&mut connected).await
    }

    async fn run_command(&self, command: &str) -> ChaosResult<CommandOutput> {
        self.run_command_with_timeout(command, self.transport.command_timeout())
            .await
    }

    async fn run_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> ChaosResult<CommandOutput> {
        let mut connected = self.session.lock().await;
        self.ensure_connected(&mut connected).await?;

        debug!(host = %self.host.host, command = %command, "Running remote command");
        let mut process = self.ssh_command();
        process.arg(self.destination()).arg("--").arg(command);

        let output = self.execute(process, "ssh command", timeout).await?;
        if output.exit_status == SSH_TRANSPORT_EXIT {
            // The master connection may be gone; force a reconnect next time.
            *connected = false;
            return Err(ChaosError::transport(
                &self.host.host,
                format!("ssh exited with 255: {}", output.stderr.trim()),
            ));
        }
        Ok(output)
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> ChaosResult<()> {
        self.transfer(
            local_path.display().to_string(),
            format!("{}:{}", self.destination(), remote_path),
            "upload",
        )
        .await
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> ChaosResult<()> {
        self.transfer(
            format!("{}:{}", self.destination(), remote_path),
            local_path.display().to_string(),
            "download",
        )
        .await
    }

    async fn close(&self) -> ChaosResult<()> {
        let mut connected = self.session.lock().await;
        if !*connected {
            return Ok(());
        }

        let mut command = self.ssh_command();
        command.args(["-O", "exit"]).arg(self.destination());
        match self
            .execute(command, "ssh close", self.transport.connect_timeout())
            .await
        {
            Ok(output) if !output.success() => {
                warn!(host = %self.host.host, stderr = %output.stderr.trim(), "SSH master did not exit cleanly");
            }
            Err(e) => warn!(host = %self.host.host, error = %e, "Failed to close SSH session"),
            Ok(_) => info!(host = %self.host.host, "SSH session closed"),
        }
        *connected = false;
        Ok(())
    }
}

/// Expands a leading `~/` against `$HOME`.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostConfig {
        HostConfig {
            host: "10.0.0.1".to_string(),
            user: "ubuntu".to_string(),
            key_path: PathBuf::from("/keys/id_rsa"),
            port: 2222,
        }
    }

    #[test]
    fn test_common_options() {
        let executor = SshExecutor::new(host(), TransportConfig::default());
        let options = executor.common_options();

        assert_eq!(&options[0..2], &["-i".to_string(), "/keys/id_rsa".to_string()]);
        assert!(options.contains(&"ConnectTimeout=200".to_string()));
        assert!(options.contains(&"ServerAliveInterval=15".to_string()));
        assert!(options
            .iter()
            .any(|option| option.starts_with("ControlPath=") && option.contains("ubuntu@10.0.0.1-2222")));
        assert_eq!(executor.destination(), "ubuntu@10.0.0.1");
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/.ssh/id_rsa")),
                PathBuf::from(home).join(".ssh/id_rsa")
            );
        }
        assert_eq!(expand_home(Path::new("/abs/key")), PathBuf::from("/abs/key"));
    }

    #[tokio::test]
    async fn test_close_without_connect_is_noop() {
        let executor = SshExecutor::new(host(), TransportConfig::default());
        assert!(executor.close().await.is_ok());
        assert_eq!(executor.host(), "10.0.0.1");
    }
}
