//! Fault injection and removal on the control host.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chaosrun_core::{ChaosError, ChaosResult, FaultDefinition, RemoteExecutor};
use tracing::{debug, error, info, warn};

use crate::command;
use crate::metrics::CHAOS_OPERATIONS;

/// Remote location manifests are uploaded to.
pub const REMOTE_MANIFEST_PATH: &str = "/tmp/chaos_config.yaml";

/// Where background chaos scripts write their output.
pub const SCRIPT_LOG_PATH: &str = "/tmp/chaos_script.log";

/// A fault currently applied to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChaosHandle {
    /// Chaos-mesh schedule, removed by name.
    Schedule { name: String },
    /// Manifest applied without a known schedule name; nothing to delete.
    Unnamed,
    /// Background script; ends through node recovery.
    Script { remote_path: String },
}

impl ChaosHandle {
    pub fn is_removable(&self) -> bool {
        matches!(self, Self::Schedule { .. })
    }
}

impl fmt::Display for ChaosHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schedule { name } => write!(f, "schedule '{}'", name),
            Self::Unnamed => write!(f, "unnamed manifest"),
            Self::Script { remote_path } => write!(f, "script '{}'", remote_path),
        }
    }
}

/// Applies and removes faults through `kubectl` and shell on the control host.
pub struct ChaosLifecycleController {
    executor: Arc<dyn RemoteExecutor>,
    chaos_namespace: String,
    node_user: String,
}

impl ChaosLifecycleController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, chaos_namespace: impl Into<String>) -> Self {
        Self {
            executor,
            chaos_namespace: chaos_namespace.into(),
            node_user: "ubuntu".to_string(),
        }
    }

    /// User for the hop from the control host to worker nodes during recovery.
    #[must_use]
    pub fn with_node_user(mut self, user: impl Into<String>) -> Self {
        self.node_user = user.into();
        self
    }

    /// Injects `fault`. A definition present locally is uploaded first;
    /// otherwise its path is taken to exist on the control host already.
    pub async fn apply(
        &self,
        fault: &FaultDefinition,
        schedule_name: Option<&str>,
    ) -> ChaosResult<ChaosHandle> {
        let result = self.apply_inner(fault, schedule_name).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        CHAOS_OPERATIONS.with_label_values(&["apply", status]).inc();
        result
    }

    async fn apply_inner(
        &self,
        fault: &FaultDefinition,
        schedule_name: Option<&str>,
    ) -> ChaosResult<ChaosHandle> {
        let remote_path = self.stage(fault).await?;

        match fault {
            FaultDefinition::Manifest { .. } => {
                let apply = format!("kubectl apply -f {}", remote_path);
                let output = command::run(self.executor.as_ref(), &apply).await?;
                if !output.success() {
                    return Err(ChaosError::chaos_apply(format!(
                        "kubectl apply exited with {}: {}",
                        output.exit_status,
                        output.stderr.trim()
                    )));
                }
                info!(manifest = %remote_path, "Chaos experiment applied");
                Ok(match schedule_name {
                    Some(name) => ChaosHandle::Schedule {
                        name: name.to_string(),
                    },
                    None => ChaosHandle::Unnamed,
                })
            }
            FaultDefinition::Script { .. } => {
                let chmod = format!("chmod +x {}", remote_path);
                let output = command::run(self.executor.as_ref(), &chmod).await?;
                if !output.success() {
                    warn!(script = %remote_path, stderr = %output.stderr.trim(), "chmod failed");
                }

                let launch = format!("nohup bash {} > {} 2>&1 &", remote_path, SCRIPT_LOG_PATH);
                let output = command::run(self.executor.as_ref(), &launch).await?;
                if !output.success() {
                    return Err(ChaosError::chaos_apply(format!(
                        "failed to launch {} (exit {}): {}",
                        remote_path,
                        output.exit_status,
                        output.stderr.trim()
                    )));
                }
                info!(script = %remote_path, "Chaos script started in background");
                Ok(ChaosHandle::Script { remote_path })
            }
        }
    }

    /// Uploads the definition if it exists locally and returns its remote path.
    async fn stage(&self, fault: &FaultDefinition) -> ChaosResult<String> {
        let local = fault.path();
        if !is_local_file(local).await {
            debug!(path = %local.display(), "Fault definition not found locally, using remote path");
            return Ok(local.display().to_string());
        }

        let remote = match fault {
            FaultDefinition::Manifest { .. } => REMOTE_MANIFEST_PATH.to_string(),
            FaultDefinition::Script { .. } => format!("/tmp/{}", fault.file_name()),
        };
        self.executor.upload_file(local, &remote).await?;
        info!(local = %local.display(), remote = %remote, "Uploaded fault definition");
        Ok(remote)
    }

    /// Deletes a schedule. Handles without a schedule are left alone.
    pub async fn remove(&self, handle: &ChaosHandle) -> ChaosResult<()> {
        let name = match handle {
            ChaosHandle::Schedule { name } => name,
            other => {
                debug!(handle = %other, "Handle has no schedule to delete");
                return Ok(());
            }
        };

        let delete = format!("kubectl delete schedule {} -n {}", name, self.chaos_namespace);
        let result = match command::run(self.executor.as_ref(), &delete).await {
            Ok(output) if output.success() => {
                info!(schedule = %name, "Chaos schedule deleted");
                Ok(())
            }
            Ok(output) => Err(ChaosError::chaos_remove(format!(
                "kubectl delete schedule {} exited with {}: {}",
                name,
                output.exit_status,
                output.stderr.trim()
            ))),
            Err(e) => Err(e),
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        CHAOS_OPERATIONS.with_label_values(&["remove", status]).inc();
        result
    }

    /// Returns the cluster to an injectable state after `handle`: schedules
    /// are deleted, scripts are undone through node recovery. Never fails;
    /// returns whether the reset succeeded.
    pub async fn reset(&self, handle: &ChaosHandle) -> bool {
        match handle {
            ChaosHandle::Schedule { .. } => match self.remove(handle).await {
                Ok(()) => true,
                Err(e) => {
                    error!(handle = %handle, error = %e, "Failed to remove chaos");
                    false
                }
            },
            ChaosHandle::Script { .. } => {
                info!(handle = %handle, "Performing node recovery for script fault");
                self.recover_nodes().await
            }
            ChaosHandle::Unnamed => {
                info!("No schedule name provided, skipping chaos deletion");
                true
            }
        }
    }

    /// Uncordons every non-master node and restarts kubelet on each.
    pub async fn recover_nodes(&self) -> bool {
        let uncordon = "kubectl get nodes | grep -v master | awk '{print $1}' \
             | xargs -I{} kubectl uncordon {} 2>/dev/null || true";
        let restart_kubelet = format!(
            "for node in $(kubectl get nodes | grep -v master | awk 'NR>1 {{print $1}}'); do \
             ssh -o StrictHostKeyChecking=no {}@$node 'sudo systemctl start kubelet' 2>/dev/null || true; \
             done",
            self.node_user
        );

        let mut recovered = true;
        for step in [uncordon.to_string(), restart_kubelet] {
            match command::run(self.executor.as_ref(), &step).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    warn!(exit_status = output.exit_status, stderr = %output.stderr.trim(), "Node recovery step failed");
                    recovered = false;
                }
                Err(e) => {
                    warn!(error = %e, "Node recovery step failed");
                    recovered = false;
                }
            }
        }

        let status = if recovered { "ok" } else { "error" };
        CHAOS_OPERATIONS.with_label_values(&["recover", status]).inc();
        if recovered {
            info!("Worker node recovery completed");
        }
        recovered
    }
}

async fn is_local_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaosrun_core::CommandOutput;
    use chaosrun_remote::MockExecutor;

    fn controller(mock: &MockExecutor) -> ChaosLifecycleController {
        ChaosLifecycleController::new(Arc::new(mock.clone()), "chaos-mesh")
    }

    #[tokio::test]
    async fn test_apply_local_manifest_uploads() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = tmp.path().join("pod-kill.yaml");
        std::fs::write(&manifest, "kind: Schedule\n").unwrap();

        let mock = MockExecutor::new("master");
        let handle = controller(&mock)
            .apply(&FaultDefinition::from_path(&manifest), Some("pod-kill"))
            .await
            .unwrap();

        assert_eq!(
            handle,
            ChaosHandle::Schedule {
                name: "pod-kill".to_string()
            }
        );
        assert!(mock.remote_file(REMOTE_MANIFEST_PATH).is_some());
        assert_eq!(mock.commands(), vec!["kubectl apply -f /tmp/chaos_config.yaml"]);
    }

    #[tokio::test]
    async fn test_apply_remote_manifest_without_schedule() {
        let mock = MockExecutor::new("master");
        let handle = controller(&mock)
            .apply(
                &FaultDefinition::from_path("/opt/chaos/network-delay.yaml"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(handle, ChaosHandle::Unnamed);
        assert_eq!(mock.count_operations("upload"), 0);
        assert_eq!(
            mock.commands(),
            vec!["kubectl apply -f /opt/chaos/network-delay.yaml"]
        );
    }

    #[tokio::test]
    async fn test_apply_rejected() {
        let mock = MockExecutor::new("master");
        mock.respond(
            "kubectl apply",
            CommandOutput::new(1, "", "error validating data\n"),
        );

        let err = controller(&mock)
            .apply(&FaultDefinition::from_path("/opt/bad.yaml"), Some("bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::ChaosApply { .. }));
        assert!(err.to_string().contains("error validating data"));
    }

    #[tokio::test]
    async fn test_apply_script_launches_in_background() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("stop_kubelet.sh");
        std::fs::write(&script, "#!/bin/bash\nsystemctl stop kubelet\n").unwrap();

        let mock = MockExecutor::new("master");
        let handle = controller(&mock)
            .apply(&FaultDefinition::from_path(&script), None)
            .await
            .unwrap();

        assert_eq!(
            handle,
            ChaosHandle::Script {
                remote_path: "/tmp/stop_kubelet.sh".to_string()
            }
        );
        assert!(!handle.is_removable());
        assert_eq!(
            mock.commands(),
            vec![
                "chmod +x /tmp/stop_kubelet.sh".to_string(),
                "nohup bash /tmp/stop_kubelet.sh > /tmp/chaos_script.log 2>&1 &".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_upload_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = tmp.path().join("pod-kill.yaml");
        std::fs::write(&manifest, "kind: Schedule\n").unwrap();

        let mock = MockExecutor::new("master");
        mock.fail_next(vec!["scp: connection closed"]);

        let result = controller(&mock)
            .apply(&FaultDefinition::from_path(&manifest), Some("pod-kill"))
            .await;
        assert!(matches!(result, Err(ChaosError::Transport { .. })));
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_remove_schedule() {
        let mock = MockExecutor::new("master");
        let ctrl = controller(&mock);

        ctrl.remove(&ChaosHandle::Schedule {
            name: "pod-kill".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(
            mock.commands(),
            vec!["kubectl delete schedule pod-kill -n chaos-mesh"]
        );

        ctrl.remove(&ChaosHandle::Unnamed).await.unwrap();
        assert_eq!(mock.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_failure() {
        let mock = MockExecutor::new("master");
        mock.respond(
            "kubectl delete schedule",
            CommandOutput::new(1, "", "schedules.chaos-mesh.org \"pod-kill\" not found"),
        );

        let handle = ChaosHandle::Schedule {
            name: "pod-kill".to_string(),
        };
        let ctrl = controller(&mock);
        assert!(matches!(
            ctrl.remove(&handle).await,
            Err(ChaosError::ChaosRemove { .. })
        ));
        assert!(!ctrl.reset(&handle).await);
    }

    #[tokio::test]
    async fn test_reset_script_recovers_nodes() {
        let mock = MockExecutor::new("master");
        let ctrl = controller(&mock).with_node_user("admin");

        assert!(
            ctrl.reset(&ChaosHandle::Script {
                remote_path: "/tmp/x.sh".to_string()
            })
            .await
        );
        let commands = mock.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("kubectl uncordon"));
        assert!(commands[1].contains("admin@$node 'sudo systemctl start kubelet'"));
    }

    #[tokio::test]
    async fn test_recover_nodes_reports_transport_failure() {
        let mock = MockExecutor::new("master");
        mock.fail_next(vec!["broken pipe"]);

        assert!(!controller(&mock).recover_nodes().await);
        // The second step still runs.
        assert_eq!(mock.count_operations("run"), 2);
    }
}
