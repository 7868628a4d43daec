//! Orchestration of chaos experiments: health gating, fault lifecycle,
//! load-test trials, artifact capture and the grid walk tying them together.

pub mod capture;
pub mod chaos;
mod command;
pub mod health;
pub mod load_test;
pub mod metrics;
pub mod scheduler;

pub use capture::{capture_trial, CaptureReport, CaptureRequest};
pub use chaos::{ChaosHandle, ChaosLifecycleController};
pub use health::{ClusterHealthMonitor, HealthCheck, HealthReport};
pub use load_test::{classify, LoadTestExecutor, LoadTestPlan, TrialOutcome};
pub use metrics::export_prometheus;
pub use scheduler::{
    CellRecord, CellStatus, ExperimentRecord, ExperimentScheduler, ExperimentStatus, RunSummary,
    SchedulerPolicy, SkipReason,
};
