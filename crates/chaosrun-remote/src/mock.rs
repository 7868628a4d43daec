//! Scripted executor for testing
//!
//! Provides an in-memory stand-in for a remote host so orchestration logic
//! can be exercised without SSH or a cluster.
//!
//! # Features
//!
//! - **Scripted Responses**: Commands are answered by the most recently
//!   registered rule whose pattern is a substring of the command
//! - **Response Sequences**: A rule can answer differently on each call; the
//!   last response repeats once the sequence is exhausted
//! - **Transport Failures**: A queue of failures consumed before any rule
//! - **Call History**: Every operation is recorded for assertions
//! - **Remote Files**: Downloads are served from an in-memory file map
//!
//! # Examples
//!
//! ```rust
//! use chaosrun_remote::{MockExecutor, MockResponse};
//! use chaosrun_core::{CommandOutput, RemoteExecutor};
//!
//! # async fn example() -> chaosrun_core::ChaosResult<()> {
//! let mock = MockExecutor::new("master");
//! mock.respond("kubectl get nodes", CommandOutput::new(0, "NAME STATUS\nn1 Ready\n", ""));
//! mock.respond_sequence(
//!     "kubectl get pods",
//!     vec![
//!         MockResponse::output(1, "", "connection refused"),
//!         MockResponse::output(0, "NAME READY STATUS\np 1/1 Running\n", ""),
//!     ],
//! );
//!
//! let first = mock.run_command("kubectl get pods -n app").await?;
//! assert_eq!(first.exit_status, 1);
//! let second = mock.run_command("kubectl get pods -n app").await?;
//! assert_eq!(second.exit_status, 0);
//!
//! assert_eq!(mock.count_matching("kubectl get pods"), 2);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chaosrun_core::{ChaosError, ChaosResult, CommandOutput, RemoteExecutor};

/// Scripted reaction to a command.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Command ran and produced this output.
    Output(CommandOutput),
    /// Command could not be delivered.
    Transport(String),
}

impl MockResponse {
    pub fn output(exit_status: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Output(CommandOutput::new(exit_status, stdout, stderr))
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::output(0, stdout, "")
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// One entry in the mock's call history.
#[derive(Debug, Clone)]
pub struct MockCall {
    /// Operation type: "connect", "run", "upload", "download", "close".
    pub operation: String,

    /// Command text or transfer description.
    pub detail: String,

    /// Whether the operation succeeded at the transport level.
    pub success: bool,

    /// Timestamp of operation.
    pub timestamp: Instant,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    responses: VecDeque<MockResponse>,
    last: MockResponse,
}

impl Rule {
    fn next(&mut self) -> MockResponse {
        match self.responses.pop_front() {
            Some(response) => {
                self.last = response.clone();
                response
            }
            None => self.last.clone(),
        }
    }
}

/// In-memory [`RemoteExecutor`] driven by scripted rules.
#[derive(Clone)]
pub struct MockExecutor {
    host: String,
    rules: Arc<RwLock<Vec<Rule>>>,
    failure_queue: Arc<RwLock<VecDeque<String>>>,
    remote_files: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    call_history: Arc<RwLock<Vec<MockCall>>>,
    latency: Duration,
}

impl MockExecutor {
    /// Create a mock host where every command exits 0 with empty output.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            rules: Arc::new(RwLock::new(Vec::new())),
            failure_queue: Arc::new(RwLock::new(VecDeque::new())),
            remote_files: Arc::new(RwLock::new(HashMap::new())),
            call_history: Arc::new(RwLock::new(Vec::new())),
            latency: Duration::ZERO,
        }
    }

    /// Simulate per-operation latency. Under a paused tokio clock this
    /// advances virtual time only.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer every command containing `pattern` with `output`.
    pub fn respond(&self, pattern: impl Into<String>, output: CommandOutput) {
        self.respond_sequence(pattern, vec![MockResponse::Output(output)]);
    }

    /// Answer commands containing `pattern` with `responses` in order; the
    /// last response repeats afterwards. Later rules take precedence.
    pub fn respond_sequence(&self, pattern: impl Into<String>, responses: Vec<MockResponse>) {
        let mut responses: VecDeque<MockResponse> = responses.into();
        let last = responses
            .back()
            .cloned()
            .unwrap_or_else(|| MockResponse::ok(""));
        if responses.len() == 1 {
            responses.clear();
        }
        self.rules.write().push(Rule {
            pattern: pattern.into(),
            responses,
            last,
        });
    }

    /// Fail the next operations with transport errors, in order.
    pub fn fail_next(&self, messages: Vec<&str>) {
        self.failure_queue
            .write()
            .extend(messages.into_iter().map(str::to_string));
    }

    /// Make `path` downloadable with the given contents.
    pub fn put_remote_file(&self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.remote_files.write().insert(path.into(), contents.into());
    }

    /// Contents previously uploaded to, or placed at, `path`.
    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.remote_files.read().get(path).cloned()
    }

    /// Get call history for assertions.
    pub fn get_call_history(&self) -> Vec<MockCall> {
        self.call_history.read().clone()
    }

    /// Every command passed to `run_command`, in order.
    pub fn commands(&self) -> Vec<String> {
        self.call_history
            .read()
            .iter()
            .filter(|call| call.operation == "run")
            .map(|call| call.detail.clone())
            .collect()
    }

    /// Number of commands containing `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.call_history
            .read()
            .iter()
            .filter(|call| call.operation == "run" && call.detail.contains(pattern))
            .count()
    }

    /// Number of operations of the given type.
    pub fn count_operations(&self, operation: &str) -> usize {
        self.call_history
            .read()
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// Clear call history.
    pub fn clear_history(&self) {
        self.call_history.write().clear();
    }

    fn check_failure(&self) -> Option<ChaosError> {
        self.failure_queue
            .write()
            .pop_front()
            .map(|message| ChaosError::transport(&self.host, message))
    }

    fn record_call(&self, operation: &str, detail: impl Into<String>, success: bool) {
        self.call_history.write().push(MockCall {
            operation: operation.to_string(),
            detail: detail.into(),
            success,
            timestamp: Instant::now(),
        });
    }

    fn lookup(&self, command: &str) -> MockResponse {
        let mut rules = self.rules.write();
        rules
            .iter_mut()
            .rev()
            .find(|rule| command.contains(&rule.pattern))
            .map(Rule::next)
            .unwrap_or_else(|| MockResponse::ok(""))
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&self) -> ChaosResult<()> {
        self.simulate_latency().await;
        if let Some(error) = self.check_failure() {
            self.record_call("connect", &self.host, false);
            return Err(error);
        }
        self.record_call("connect", &self.host, true);
        Ok(())
    }

    async fn run_command(&self, command: &str) -> ChaosResult<CommandOutput> {
        self.simulate_latency().await;
        if let Some(error) = self.check_failure() {
            self.record_call("run", command, false);
            return Err(error);
        }

        match self.lookup(command) {
            MockResponse::Output(output) => {
                self.record_call("run", command, true);
                Ok(output)
            }
            MockResponse::Transport(message) => {
                self.record_call("run", command, false);
                Err(ChaosError::transport(&self.host, message))
            }
        }
    }

    async fn run_command_with_timeout(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> ChaosResult<CommandOutput> {
        self.run_command(command).await
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> ChaosResult<()> {
        self.simulate_latency().await;
        let detail = format!("{} -> {}", local_path.display(), remote_path);
        if let Some(error) = self.check_failure() {
            self.record_call("upload", detail, false);
            return Err(error);
        }

        let contents = tokio::fs::read(local_path).await?;
        self.remote_files
            .write()
            .insert(remote_path.to_string(), contents);
        self.record_call("upload", detail, true);
        Ok(())
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> ChaosResult<()> {
        self.simulate_latency().await;
        let detail = format!("{} -> {}", remote_path, local_path.display());
        if let Some(error) = self.check_failure() {
            self.record_call("download", detail, false);
            return Err(error);
        }

        let contents = self.remote_files.read().get(remote_path).cloned();
        match contents {
            Some(contents) => {
                tokio::fs::write(local_path, contents).await?;
                self.record_call("download", detail, true);
                Ok(())
            }
            None => {
                self.record_call("download", detail, false);
                Err(ChaosError::transport(
                    &self.host,
                    format!("scp: {}: No such file or directory", remote_path),
                ))
            }
        }
    }

    async fn close(&self) -> ChaosResult<()> {
        self.record_call("close", &self.host, true);
        Ok(())
    }
}
