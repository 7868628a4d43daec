//! Core domain types and traits for chaos experiment runs.

pub mod config;
pub mod error;
pub mod experiment;
pub mod result_dir;
pub mod traits;

pub use config::{
    ChaosRunConfig, ClusterCheckConfig, ExperimentConfig, HostConfig, LoadGeneratorConfig,
    TransportConfig, MIN_TIMEOUT_RECOVERY_SECS,
};
pub use error::{ChaosError, ChaosResult};
pub use experiment::{
    ClusterTopology, ExperimentSpec, FaultDefinition, RequestRateMode, TrialClassification,
    TrialContext, TrialMetadata,
};
pub use result_dir::{timeout_from_dir_name, ResultLayout};
pub use traits::{CommandOutput, RemoteExecutor, ResultStore};
