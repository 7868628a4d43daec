//! Filesystem persistence of trial artifacts.
//!
//! - [`FsResultStore`]: downloads, fault-definition copy, report and summary
//!   written into a trial's result directory
//! - [`report`]: `report.md` and `metadata.json`
//! - [`summary`]: the `<csv stem>_summary.csv` with headline metrics
//!
//! Every file is written under a `.partial` name and renamed into place, so a
//! reader never sees a half-written artifact under its final name.

mod atomic;
pub mod report;
pub mod store;
pub mod summary;

pub use report::{render_report, write_report};
pub use store::FsResultStore;
pub use summary::{write_summary, ExperimentInfo, LogMetrics, ResponseTimes};

/// Local name of the downloaded load-generator CSV.
pub const CSV_FILE: &str = "locust_log.csv";
/// Local name of the downloaded console log.
pub const CONSOLE_LOG_FILE: &str = "console_output.log";
/// Local name of the copied fault definition.
pub const FAULT_DEFINITION_FILE: &str = "chaos_config.yaml";
pub const REPORT_FILE: &str = "report.md";
pub const METADATA_FILE: &str = "metadata.json";
