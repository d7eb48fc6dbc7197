#![forbid(unsafe_code)]

//! Log folder retention. Daily `YYYYMMDD` folders and monthly `YYYYMM`
//! folders under the log root expire on separate schedules.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Months, NaiveDate};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRetention {
    pub daily_days: u64,
    pub monthly_months: u32,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            daily_days: 30,
            monthly_months: 6,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub daily_removed: Vec<PathBuf>,
    pub monthly_removed: Vec<PathBuf>,
    pub failures: usize,
}

enum Bucket {
    Daily,
    Monthly,
}

/// Classifies a folder name and returns whether it has expired.
fn expired(name: &str, today: NaiveDate, policy: LogRetention) -> Option<(Bucket, bool)> {
    if !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match name.len() {
        8 => {
            let day = NaiveDate::parse_from_str(name, "%Y%m%d").ok()?;
            let threshold = today.checked_sub_days(chrono::Days::new(policy.daily_days))?;
            Some((Bucket::Daily, day <= threshold))
        }
        6 => {
            let month = NaiveDate::parse_from_str(&format!("{name}01"), "%Y%m%d").ok()?;
            let threshold = today
                .with_day(1)?
                .checked_sub_months(Months::new(policy.monthly_months))?;
            Some((Bucket::Monthly, month <= threshold))
        }
        _ => None,
    }
}

/// Removes expired dated folders directly under `log_root`. Anything else is
/// left alone, and a folder that cannot be removed does not stop the sweep.
pub fn sweep_log_dirs(log_root: &Path, today: NaiveDate, policy: LogRetention) -> SweepReport {
    let mut report = SweepReport::default();
    if !log_root.is_dir() {
        tracing::info!(path = %log_root.display(), "log root missing, nothing to sweep");
        return report;
    }

    for entry in WalkDir::new(log_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
    {
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some((bucket, true)) = expired(name, today, policy) else {
            continue;
        };

        let path = entry.path().to_path_buf();
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "removed expired log folder");
                match bucket {
                    Bucket::Daily => report.daily_removed.push(path),
                    Bucket::Monthly => report.monthly_removed.push(path),
                }
            }
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "failed to remove log folder");
                report.failures += 1;
            }
        }
    }

    tracing::info!(
        daily = report.daily_removed.len(),
        monthly = report.monthly_removed.len(),
        failures = report.failures,
        "log sweep finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 8, 15).unwrap()
    }

    #[test]
    fn removes_only_expired_dated_folders() {
        let dir = tempdir().unwrap();
        for name in [
            "20240717", "20240716", "20240601", "202402", "202403", "notes", "2024081",
        ] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("20200101"), "a file, not a folder").unwrap();

        let report = sweep_log_dirs(dir.path(), today(), LogRetention::default());

        let mut daily: Vec<_> = report
            .daily_removed
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        daily.sort();
        assert_eq!(daily, ["20240601", "20240716"]);
        let monthly: Vec<_> = report
            .monthly_removed
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(monthly, ["202402"]);
        assert_eq!(report.failures, 0);

        for kept in ["20240717", "202403", "notes", "2024081", "20200101"] {
            assert!(dir.path().join(kept).exists(), "{kept} should be kept");
        }
    }

    #[test]
    fn missing_root_is_a_no_op() {
        let dir = tempdir().unwrap();
        let report = sweep_log_dirs(&dir.path().join("absent"), today(), LogRetention::default());
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn invalid_dates_are_ignored() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("20241399")).unwrap();
        fs::create_dir_all(dir.path().join("202413")).unwrap();
        let report = sweep_log_dirs(dir.path(), today(), LogRetention::default());
        assert!(report.daily_removed.is_empty());
        assert!(report.monthly_removed.is_empty());
    }
}
