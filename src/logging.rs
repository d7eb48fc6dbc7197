#![forbid(unsafe_code)]

//! Log setup for the binaries: one file per program, account and day under
//! `<log_dir>/<YYYYMMDD>/`, mirrored to stderr.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

const SEPARATOR_WIDTH: usize = 80;

/// Keeps the log file alive for the lifetime of the program.
pub struct LogGuard {
    path: PathBuf,
    _file: Arc<Mutex<File>>,
}

impl LogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `<log_dir>/<YYYYMMDD>/<program>_<account>_<YYYYMMDD>.log`
pub fn log_file_path(log_dir: &Path, program: &str, account: &str, day: NaiveDate) -> PathBuf {
    let stamp = day.format("%Y%m%d").to_string();
    log_dir
        .join(&stamp)
        .join(format!("{program}_{}_{stamp}.log", sanitize(account)))
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Opens the day's log file in append mode and writes a separator so runs are
/// easy to tell apart.
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", "=".repeat(SEPARATOR_WIDTH))?;
    Ok(file)
}

/// Installs the global subscriber. `level` is used when `RUST_LOG` is unset.
pub fn init(log_dir: &Path, program: &str, account: &str, level: Option<&str>) -> Result<LogGuard> {
    let path = log_file_path(log_dir, program, account, Local::now().date_naive());
    let file = open_log_file(&path).with_context(|| format!("opening log file {}", path.display()))?;
    let file = Arc::new(Mutex::new(file));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    let shared = file.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        file: shared.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("installing tracing subscriber")?;

    Ok(LogGuard { path, _file: file })
}

/// Writes every log line to the file and to stderr.
struct TeeWriter {
    file: Arc<Mutex<File>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        if let Ok(mut file) = self.file.lock() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        if let Ok(mut file) = self.file.lock() {
            file.flush()?;
        }
        Ok(())
    }
}
