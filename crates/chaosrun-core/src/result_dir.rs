//! On-disk layout of experiment results.
//!
//! ```text
//! <base>/<label>/users_<n>/<rate segment>/timeout_<t>s_<YYYYmmddTHHMMSS>
//! ```

use chrono::{DateTime, Local};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::ChaosResult;
use crate::experiment::RequestRateMode;

/// Builds and creates result directories below a base path.
#[derive(Debug, Clone)]
pub struct ResultLayout {
    base: PathBuf,
}

impl ResultLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory holding every trial of one (experiment, user count, rate mode).
    pub fn rate_dir(&self, label: &str, user_count: u32, rate_mode: RequestRateMode) -> PathBuf {
        self.base
            .join(label)
            .join(format!("users_{}", user_count))
            .join(rate_mode.dir_segment())
    }

    /// Creates a fresh trial directory. If a directory with the same
    /// timestamp already exists a numeric suffix is appended, so an
    /// existing directory is never reused.
    pub fn create_trial_dir(
        &self,
        label: &str,
        user_count: u32,
        rate_mode: RequestRateMode,
        timeout: u64,
        now: DateTime<Local>,
    ) -> ChaosResult<PathBuf> {
        let parent = self.rate_dir(label, user_count, rate_mode);
        std::fs::create_dir_all(&parent)?;

        let stem = format!("timeout_{}s_{}", timeout, now.format("%Y%m%dT%H%M%S"));
        let mut candidate = parent.join(&stem);
        let mut suffix = 1u32;
        loop {
            match std::fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    suffix += 1;
                    candidate = parent.join(format!("{}_{}", stem, suffix));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Reads the timeout back out of a trial directory name.
pub fn timeout_from_dir_name(name: &str) -> Option<u64> {
    name.strip_prefix("timeout_")
        .and_then(|rest| rest.split_once("s_"))
        .and_then(|(value, _)| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 4, 20, 12, 34, 56).unwrap()
    }

    #[test]
    fn test_trial_dir_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ResultLayout::new(tmp.path());

        let dir = layout
            .create_trial_dir("pod-kill", 5, RequestRateMode::Concurrent, 10, fixed_time())
            .unwrap();

        assert!(dir.is_dir());
        assert_eq!(
            dir,
            tmp.path()
                .join("pod-kill")
                .join("users_5")
                .join("concurrent_mode")
                .join("timeout_10s_20250420T123456")
        );
    }

    #[test]
    fn test_trial_dir_is_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ResultLayout::new(tmp.path());
        let mode = RequestRateMode::FixedInterval(1.0);

        let first = layout
            .create_trial_dir("exp", 1, mode, 5, fixed_time())
            .unwrap();
        let second = layout
            .create_trial_dir("exp", 1, mode, 5, fixed_time())
            .unwrap();

        assert_ne!(first, second);
        assert!(second.ends_with("timeout_5s_20250420T123456_2"));
    }

    #[test]
    fn test_timeout_from_dir_name() {
        assert_eq!(timeout_from_dir_name("timeout_15s_20250420T123456"), Some(15));
        assert_eq!(timeout_from_dir_name("timeout_15s_20250420T123456_2"), Some(15));
        assert_eq!(timeout_from_dir_name("users_5"), None);
    }
}
