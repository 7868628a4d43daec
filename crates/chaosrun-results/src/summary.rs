//! Summary CSV generation.
//!
//! The summary is the captured CSV prefixed with `# `-rows describing the
//! experiment and the headline metrics of the run:
//!
//! ```text
//! # Experiment Name:,pod-kill
//! # Application:,image-detection
//! ...
//! # Error Types:,None
//!
//! <original CSV>
//! ```
//!
//! Request totals and the error table come from the console log; response
//! time averages are computed from the CSV.

use std::path::{Path, PathBuf};

use chaosrun_core::{
    timeout_from_dir_name, ChaosError, ChaosResult, ClusterTopology, RequestRateMode,
    TrialMetadata,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::{CONSOLE_LOG_FILE, CSV_FILE, FAULT_DEFINITION_FILE, METADATA_FILE};

/// Application written when the trial metadata does not name one.
pub const DEFAULT_APPLICATION: &str = "image-detection";

const PIGGYBACK_CSV: &str = "locust_log_piggyback_timeout.csv";
const SUMMARY_SUFFIX: &str = "_summary";

static AGGREGATED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Aggregated\s+(\d+)\s+(\d+)\(\d+\.\d+%\)\s*\|\s*(\d+)")
        .expect("Failed to compile aggregated pattern")
});

/// Rows of the locust error table: `<count> <METHOD> <path>: <message>`.
static ERROR_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s+[A-Z]+ \S+: (.+)").expect("Failed to compile error row pattern")
});

static ERROR_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z]+)(Error|Timeout|Exception)").expect("Failed to compile error name pattern")
});

/// Metrics scraped from a console log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time: f64,
    /// Error kinds with their occurrence counts, in first-seen order.
    pub errors: Vec<(String, u64)>,
}

impl LogMetrics {
    /// Parses the final `Aggregated` row and the error table.
    pub fn from_console_log(content: &str) -> Self {
        let mut metrics = Self::default();

        if let Some(caps) = AGGREGATED.captures_iter(content).last() {
            metrics.total_requests = caps[1].parse().unwrap_or(0);
            metrics.failed_requests = caps[2].parse().unwrap_or(0);
            metrics.avg_response_time = caps[3].parse().unwrap_or(0.0);
        }

        for caps in ERROR_ROW.captures_iter(content) {
            let count: u64 = caps[1].parse().unwrap_or(0);
            metrics.add_error(caps[2].trim(), count);
        }
        metrics
    }

    pub fn error_occurrences(&self) -> u64 {
        self.errors.iter().map(|(_, count)| count).sum()
    }

    /// Recovers error kinds from CSV `Error`/`Status` columns. Used when the
    /// log reports failed requests but no error table.
    pub fn add_errors_from_csv(&mut self, csv_content: &str) {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(csv_content.as_bytes());
        let headers = match reader.headers() {
            Ok(headers) => headers.clone(),
            Err(e) => {
                warn!(error = %e, "Could not read CSV headers");
                return;
            }
        };

        let error_idx = headers.iter().position(|header| {
            let header = header.to_lowercase();
            header == "error type" || header == "error"
        });
        let status_idx = headers
            .iter()
            .position(|header| header.eq_ignore_ascii_case("status"));
        let (error_idx, status_idx) = match (error_idx, status_idx) {
            (Some(error_idx), Some(status_idx)) => (error_idx, status_idx),
            _ => return,
        };

        for record in reader.records().filter_map(Result::ok) {
            let (status, error) = match (record.get(status_idx), record.get(error_idx)) {
                (Some(status), Some(error)) => (status.trim(), error.trim()),
                _ => continue,
            };
            let failed = matches!(status.to_lowercase().as_str(), "error" | "failure" | "fail");
            if failed && !error.is_empty() {
                self.add_error(&error_kind(error), 1);
            }
        }
    }

    fn add_error(&mut self, kind: &str, count: u64) {
        match self.errors.iter_mut().find(|(existing, _)| existing == kind) {
            Some((_, total)) => *total += count,
            None => self.errors.push((kind.to_string(), count)),
        }
    }
}

/// Short error kind for a CSV error cell.
fn error_kind(text: &str) -> String {
    if text.contains("ReadTimeout") {
        return "ReadTimeout".to_string();
    }
    if text.contains("ConnectionError") {
        return "ConnectionError".to_string();
    }
    if let Some(found) = ERROR_NAME.find(text) {
        return found.as_str().to_string();
    }
    if text.chars().count() > 30 {
        format!("{}...", text.chars().take(30).collect::<String>())
    } else {
        text.to_string()
    }
}

/// Response-time averages over the CSV rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResponseTimes {
    pub rows: u64,
    pub successes: u64,
    pub avg_all: f64,
    pub avg_success: f64,
}

impl ResponseTimes {
    pub fn from_csv(csv_content: &str) -> ChaosResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(csv_content.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| ChaosError::ArtifactCapture(format!("invalid CSV header: {}", e)))?
            .clone();

        let rt_idx = headers
            .iter()
            .position(|header| header == "Response Time (ms)")
            .or_else(|| headers.iter().position(|header| header == "Response Time"));
        let status_idx = headers
            .iter()
            .position(|header| header == "Status")
            .or_else(|| headers.iter().position(|header| header == "status"));

        let mut times = Self::default();
        let mut sum_all = 0.0;
        let mut sum_success = 0.0;
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed CSV row");
                    continue;
                }
            };
            times.rows += 1;

            let value = match rt_idx.and_then(|idx| record.get(idx)) {
                Some(value) if !value.is_empty() => value,
                _ => continue,
            };
            let rt: f64 = match value.trim().parse() {
                Ok(rt) => rt,
                Err(_) => {
                    warn!(value, "Could not convert response time value");
                    continue;
                }
            };
            sum_all += rt;

            let succeeded = status_idx
                .and_then(|idx| record.get(idx))
                .map(|status| status.trim().eq_ignore_ascii_case("success"))
                .unwrap_or(false);
            if succeeded {
                times.successes += 1;
                sum_success += rt;
            }
        }

        if times.rows > 0 {
            times.avg_all = sum_all / times.rows as f64;
        }
        if times.successes > 0 {
            times.avg_success = sum_success / times.successes as f64;
        }
        Ok(times)
    }
}

/// Experiment description recovered from a result directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentInfo {
    pub experiment_name: String,
    pub application: String,
    pub timeout: Option<u64>,
    pub topology: ClusterTopology,
    pub user_count: u32,
    pub rate_mode: Option<RequestRateMode>,
    pub is_script: bool,
    /// `yaml` or `shell_script`, read from the copied fault definition.
    pub chaos_type: Option<&'static str>,
}

impl ExperimentInfo {
    /// Reads `metadata.json`, the directory names and the copied fault
    /// definition. Missing pieces fall back to defaults.
    pub fn from_result_dir(
        result_dir: &Path,
        experiment_name: Option<&str>,
        topology: ClusterTopology,
    ) -> Self {
        let metadata = read_metadata(result_dir);

        let mut user_count = metadata.as_ref().map(|m| m.user_count).unwrap_or(0);
        if user_count == 0 {
            user_count = std::fs::read_to_string(result_dir.join(CSV_FILE))
                .map(|content| count_unique_users(&content))
                .unwrap_or(0);
        }

        let rate_segment = parent_name(result_dir);
        let rate_mode = rate_segment
            .as_deref()
            .and_then(RequestRateMode::from_dir_segment)
            .or_else(|| metadata.as_ref().and_then(TrialMetadata::rate_mode));

        let name = experiment_name.map(str::trim).filter(|name| !name.is_empty());
        let is_script = name.map(|name| name.ends_with(".sh")).unwrap_or(false);
        let experiment_name = match name {
            Some(name) if is_script => Path::new(name)
                .file_name()
                .map(|file| file.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string()),
            Some(name) => name.to_string(),
            // <label>/users_<n>/<rate segment>/<trial dir>
            None => result_dir
                .ancestors()
                .nth(3)
                .and_then(Path::file_name)
                .map(|file| file.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string()),
        };

        let timeout = result_dir
            .file_name()
            .and_then(|name| timeout_from_dir_name(&name.to_string_lossy()));

        let application = metadata
            .as_ref()
            .and_then(|m| m.application.clone())
            .unwrap_or_else(|| DEFAULT_APPLICATION.to_string());

        Self {
            experiment_name,
            application,
            timeout,
            topology,
            user_count,
            rate_mode,
            is_script,
            chaos_type: chaos_type(result_dir),
        }
    }
}

fn read_metadata(result_dir: &Path) -> Option<TrialMetadata> {
    let content = std::fs::read_to_string(result_dir.join(METADATA_FILE)).ok()?;
    match serde_json::from_str(&content) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!(error = %e, "Error reading metadata.json");
            None
        }
    }
}

fn parent_name(path: &Path) -> Option<String> {
    path.parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
}

fn chaos_type(result_dir: &Path) -> Option<&'static str> {
    let content = std::fs::read_to_string(result_dir.join(FAULT_DEFINITION_FILE)).ok()?;
    let first_line = content.lines().next().unwrap_or("").trim();
    Some(if first_line.starts_with("#!") {
        "shell_script"
    } else {
        "yaml"
    })
}

/// Distinct values of the `User ID` column.
fn count_unique_users(csv_content: &str) -> u32 {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_content.as_bytes());
    let idx = match reader.headers() {
        Ok(headers) => headers.iter().position(|header| {
            matches!(
                header.to_lowercase().as_str(),
                "user id" | "user_id" | "userid"
            )
        }),
        Err(_) => None,
    };
    let idx = match idx {
        Some(idx) => idx,
        None => return 0,
    };

    let mut users: Vec<String> = reader
        .records()
        .filter_map(Result::ok)
        .filter_map(|record| record.get(idx).map(|id| id.trim().to_string()))
        .filter(|id| !id.is_empty())
        .collect();
    users.sort();
    users.dedup();
    users.len() as u32
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Header rows of the summary, one record per row.
pub fn summary_rows(
    info: &ExperimentInfo,
    metrics: &LogMetrics,
    times: &ResponseTimes,
) -> Vec<Vec<String>> {
    let row = |key: &str, value: String| vec![key.to_string(), value];

    let mut rows = vec![
        row("# Experiment Name:", info.experiment_name.clone()),
        row("# Application:", info.application.clone()),
        row(
            "# Timeout (s):",
            format!("{:?}", info.timeout.unwrap_or(0) as f64),
        ),
        row("# Master Nodes:", info.topology.master_count.to_string()),
        row("# Worker Nodes:", info.topology.worker_count.to_string()),
        row("# User Count:", info.user_count.to_string()),
    ];

    rows.push(match info.rate_mode {
        Some(RequestRateMode::Concurrent) => {
            row("# Request Mode:", "Concurrent (No Rate Limit)".to_string())
        }
        Some(RequestRateMode::Piggyback) => row("# Request Mode:", "Piggyback".to_string()),
        Some(RequestRateMode::FixedInterval(seconds)) => {
            row("# Request Rate (req/s):", format!("1/{}", seconds))
        }
        None => row("# Request Rate (req/s):", "Unknown".to_string()),
    });

    if info.is_script {
        rows.push(row("# Experiment Type:", "Shell Script".to_string()));
    } else if let Some(chaos_type) = info.chaos_type {
        rows.push(row("# Chaos Type:", chaos_type.to_string()));
    }

    // Without failures every response was a success.
    let avg_success = if metrics.failed_requests == 0 {
        metrics.avg_response_time
    } else {
        times.avg_success
    };

    rows.push(row("# Total Requests:", metrics.total_requests.to_string()));
    rows.push(row("# Failed Requests:", metrics.failed_requests.to_string()));
    rows.push(row(
        "# Average Response Time (ms):",
        format!("{:?}", round2(metrics.avg_response_time)),
    ));
    rows.push(row(
        "# Average Successful Response Time (ms):",
        format!("{:?}", round2(avg_success)),
    ));
    rows.push(row(
        "# Total Error Occurrences:",
        metrics.error_occurrences().to_string(),
    ));

    if metrics.errors.is_empty() {
        rows.push(row("# Error Types:", "None".to_string()));
    } else {
        rows.push(vec!["# Error Types:".to_string()]);
        for (kind, count) in &metrics.errors {
            rows.push(vec![format!("#   {} × {}", count, kind)]);
        }
    }
    rows
}

/// Picks the CSV and console log to summarize inside `result_dir`.
fn locate_inputs(result_dir: &Path) -> ChaosResult<(PathBuf, PathBuf)> {
    let piggyback = parent_name(result_dir)
        .as_deref()
        .and_then(RequestRateMode::from_dir_segment)
        .map(|mode| mode.is_piggyback())
        .unwrap_or(false);

    let mut csv_path = result_dir.join(CSV_FILE);
    if piggyback && result_dir.join(PIGGYBACK_CSV).exists() {
        csv_path = result_dir.join(PIGGYBACK_CSV);
    }
    if !csv_path.exists() {
        csv_path = find_with_extension(result_dir, "csv")?.ok_or_else(|| {
            ChaosError::ArtifactCapture(format!("no CSV file in {}", result_dir.display()))
        })?;
        warn!(csv = %csv_path.display(), "Primary CSV missing, using alternative");
    }

    let mut log_path = result_dir.join(CONSOLE_LOG_FILE);
    if !log_path.exists() {
        log_path = find_with_extension(result_dir, "log")?.ok_or_else(|| {
            ChaosError::ArtifactCapture(format!("no console log in {}", result_dir.display()))
        })?;
        warn!(log = %log_path.display(), "Console log missing, using alternative");
    }

    Ok((csv_path, log_path))
}

/// First file with `extension`, by name, ignoring previous summaries.
fn find_with_extension(dir: &Path, extension: &str) -> ChaosResult<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == extension).unwrap_or(false))
        .filter(|path| {
            path.file_stem()
                .map(|stem| !stem.to_string_lossy().ends_with(SUMMARY_SUFFIX))
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

fn summary_path(csv_path: &Path) -> PathBuf {
    let stem = csv_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    csv_path.with_file_name(format!("{}{}.csv", stem, SUMMARY_SUFFIX))
}

/// Writes `<csv stem>_summary.csv` for a captured trial and returns its path.
pub fn write_summary(
    result_dir: &Path,
    experiment_name: Option<&str>,
    topology: ClusterTopology,
) -> ChaosResult<PathBuf> {
    let (csv_path, log_path) = locate_inputs(result_dir)?;
    let csv_content = std::fs::read_to_string(&csv_path)?;
    let log_content = std::fs::read_to_string(&log_path)?;

    let info = ExperimentInfo::from_result_dir(result_dir, experiment_name, topology);
    let mut metrics = LogMetrics::from_console_log(&log_content);
    if metrics.failed_requests > 0 && metrics.errors.is_empty() {
        debug!(csv = %csv_path.display(), "Extracting error types from CSV");
        metrics.add_errors_from_csv(&csv_content);
    }
    let times = match ResponseTimes::from_csv(&csv_content) {
        Ok(times) => times,
        Err(e) => {
            warn!(error = %e, "Could not compute response times from CSV");
            ResponseTimes::default()
        }
    };
    debug!(
        console_total = metrics.total_requests,
        csv_rows = times.rows,
        console_avg = metrics.avg_response_time,
        csv_avg = times.avg_all,
        "Compared console and CSV metrics"
    );

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    for row in summary_rows(&info, &metrics, &times) {
        writer
            .write_record(&row)
            .map_err(|e| ChaosError::ArtifactCapture(e.to_string()))?;
    }
    let mut output = writer
        .into_inner()
        .map_err(|e| ChaosError::ArtifactCapture(e.to_string()))?;
    output.push(b'\n');
    output.extend_from_slice(csv_content.as_bytes());

    let path = summary_path(&csv_path);
    write_atomic(&path, &output)?;
    info!(summary = %path.display(), "Summary CSV created");
    Ok(path)
}
