use thiserror::Error;

/// Canonical error type for chaos run operations.
#[derive(Debug, Error)]
pub enum ChaosError {
    /// Remote session could not be established or a command could not be delivered.
    #[error("transport error on `{host}`: {message}")]
    Transport {
        /// Host the operation was addressed to.
        host: String,
        /// Human-readable failure details.
        message: String,
    },

    /// A bounded remote operation did not finish in time.
    #[error("`{operation}` timed out after {seconds}s")]
    Timeout {
        /// Short description of the operation.
        operation: String,
        /// Bound that was exceeded.
        seconds: u64,
    },

    /// Fault injection was rejected by the cluster.
    #[error("chaos apply failed: {message}")]
    ChaosApply {
        /// Human-readable failure details.
        message: String,
    },

    /// Fault removal failed.
    #[error("chaos removal failed: {message}")]
    ChaosRemove {
        /// Human-readable failure details.
        message: String,
    },

    /// A load-test trial ended in the failure classification.
    #[error("trial failed: {message}")]
    TrialFailure {
        /// Diagnostic extracted from the trial output.
        message: String,
    },

    /// Load-test script or load-generator binary is absent.
    #[error("missing prerequisite: {message}")]
    MissingPrerequisite {
        /// What was found to be missing.
        message: String,
    },

    /// Result artifact could not be captured or written.
    #[error("artifact capture failed: {0}")]
    ArtifactCapture(String),

    /// Configuration is malformed or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A run-level precondition did not hold.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// I/O error occurred during local file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ChaosError {
    /// Creates a `Transport` variant.
    #[must_use]
    pub fn transport(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates a `Timeout` variant.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Creates a `ChaosApply` variant.
    #[must_use]
    pub fn chaos_apply(message: impl Into<String>) -> Self {
        Self::ChaosApply {
            message: message.into(),
        }
    }

    /// Creates a `ChaosRemove` variant.
    #[must_use]
    pub fn chaos_remove(message: impl Into<String>) -> Self {
        Self::ChaosRemove {
            message: message.into(),
        }
    }

    /// Creates a `TrialFailure` variant.
    #[must_use]
    pub fn trial_failure(message: impl Into<String>) -> Self {
        Self::TrialFailure {
            message: message.into(),
        }
    }

    /// Creates a `MissingPrerequisite` variant.
    #[must_use]
    pub fn missing_prerequisite(message: impl Into<String>) -> Self {
        Self::MissingPrerequisite {
            message: message.into(),
        }
    }

    /// Whether the scheduler may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::TrialFailure { .. }
        )
    }
}

impl From<serde_json::Error> for ChaosError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for ChaosError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenient result alias for chaos run operations.
pub type ChaosResult<T> = Result<T, ChaosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ChaosError::transport("master", "connection reset").is_retryable());
        assert!(ChaosError::timeout("kubectl get nodes", 30).is_retryable());
        assert!(ChaosError::trial_failure("exit 2").is_retryable());

        assert!(!ChaosError::missing_prerequisite("locust not found").is_retryable());
        assert!(!ChaosError::chaos_apply("admission webhook denied").is_retryable());
        assert!(!ChaosError::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_display_includes_host() {
        let err = ChaosError::transport("10.0.0.5", "broken pipe");
        assert_eq!(err.to_string(), "transport error on `10.0.0.5`: broken pipe");
    }
}
