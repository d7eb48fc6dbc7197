#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::ledger::DEFAULT_TABLE_NAME;
use crate::lock::{DEFAULT_POLL_INTERVAL, DEFAULT_STALE_AFTER};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DB_NAME: &str = "media.db";
pub const DEFAULT_LOCK_PATH: &str = "storygate.lock";
pub const DEFAULT_LOG_DIR: &str = "log";
pub const DEFAULT_LOCK_MAX_WAIT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub table_name: String,
    pub lock_path: PathBuf,
    pub lock_poll_interval: Duration,
    pub lock_stale_after: Duration,
    pub lock_max_wait: Duration,
    pub log_dir: PathBuf,
    pub retention_days: u32,
    pub log_level: Option<String>,
}

/// Values given on the command line; they win over the environment and the
/// env file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub db_path: Option<PathBuf>,
    pub table_name: Option<String>,
    pub lock_path: Option<PathBuf>,
    pub lock_max_wait: Option<Duration>,
    pub log_dir: Option<PathBuf>,
    pub retention_days: Option<u32>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let lookup_secs = |key: &str| {
        lookup(key)
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
    };

    let db_path = overrides
        .db_path
        .or_else(|| lookup("DB_NAME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_NAME));
    let table_name = overrides
        .table_name
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("TABLE_NAME"))
        .unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string());
    let lock_path = overrides
        .lock_path
        .or_else(|| lookup("LOCK_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_PATH));
    let lock_poll_interval = lookup_secs("LOCK_POLL_SECS")
        .filter(|interval| !interval.is_zero())
        .unwrap_or(DEFAULT_POLL_INTERVAL);
    let lock_stale_after = lookup_secs("LOCK_STALE_SECS").unwrap_or(DEFAULT_STALE_AFTER);
    let lock_max_wait = overrides
        .lock_max_wait
        .or_else(|| lookup_secs("LOCK_MAX_WAIT_SECS"))
        .unwrap_or(DEFAULT_LOCK_MAX_WAIT);
    let log_dir = overrides
        .log_dir
        .or_else(|| lookup("LOG_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
    let retention_days = overrides
        .retention_days
        .or_else(|| lookup("RETENTION_DAYS").and_then(|value| value.parse::<u32>().ok()))
        .unwrap_or(DEFAULT_RETENTION_DAYS);
    let log_level = lookup("LOG_LEVEL");

    Ok(Settings {
        db_path,
        table_name,
        lock_path,
        lock_poll_interval,
        lock_stale_after,
        lock_max_wait,
        log_dir,
        retention_days,
        log_level,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
