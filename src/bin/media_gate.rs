#![forbid(unsafe_code)]

//! Decides which media observed for one account still needs downloading.
//!
//! The browser layer calls this once per profile visit with whatever it saw:
//! image URLs, a direct video URL, or a dump of the performance log when the
//! player only exposes a blob URL. Every new item is printed as one JSON
//! line on stdout for the downloader; duplicates print nothing.
//!
//! Exit status: 0 when something is new, 1 when everything was already
//! recorded, 2 when the run was aborted.

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use storygate_tools::{
    config::{Settings, SettingsOverrides, resolve_settings},
    context::RunContext,
    ledger::MediaLedger,
    lock::MarkerLock,
    logging,
    netlog::MediaFilter,
    pipeline::{Decision, ItemOutcome, MediaSource, preview_media, process_batch, run_exclusive},
};

const PROGRAM: &str = "media_gate";

/// At least one item is new and should be downloaded.
const EXIT_NEW_MEDIA: u8 = 0;
/// Everything was already recorded.
const EXIT_NOTHING_NEW: u8 = 1;
/// The run stopped before deciding anything.
const EXIT_ABORTED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = PROGRAM, about = "Record newly observed story media and report what to download")]
struct GateArgs {
    /// Source account the media belongs to.
    #[arg(long)]
    account: String,
    /// Post time shown by the platform; local time is used when omitted.
    #[arg(long)]
    captured_at: Option<String>,
    /// Image `src` URL. Repeat for multi-image posts.
    #[arg(long = "image-url")]
    image_urls: Vec<String>,
    /// Directly fetchable video URL.
    #[arg(long)]
    video_url: Option<String>,
    /// Performance log dump (JSON array or JSON lines) for blob-backed video.
    #[arg(long)]
    network_log: Option<PathBuf>,
    /// Only accept video chunks served from the `scontent` CDN.
    #[arg(long)]
    cdn_only: bool,
    /// Report decisions without touching the ledger or the lock.
    #[arg(long)]
    dry_run: bool,
    /// Identifier of the calling run, used in log lines.
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    max_wait_secs: Option<u64>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    table: Option<String>,
    #[arg(long)]
    lock_path: Option<PathBuf>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl GateArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            db_path: self.db.clone(),
            table_name: self.table.clone(),
            lock_path: self.lock_path.clone(),
            lock_max_wait: self.max_wait_secs.map(Duration::from_secs),
            log_dir: self.log_dir.clone(),
            env_path: self.env_file.clone(),
            ..SettingsOverrides::default()
        }
    }

    fn sources(&self) -> Result<Vec<MediaSource>> {
        let mut sources: Vec<MediaSource> = self
            .image_urls
            .iter()
            .map(|url| MediaSource::Image { url: url.clone() })
            .collect();
        if let Some(url) = &self.video_url {
            sources.push(MediaSource::VideoUrl { url: url.clone() });
        }
        if let Some(path) = &self.network_log {
            let filter = if self.cdn_only {
                MediaFilter::video_on_cdn()
            } else {
                MediaFilter::video()
            };
            sources.push(MediaSource::VideoLog {
                entries: read_network_log(path)?,
                filter,
            });
        }
        if sources.is_empty() {
            bail!("nothing to check: pass --image-url, --video-url or --network-log");
        }
        Ok(sources)
    }
}

/// Loads performance-log entries saved either as one JSON array or as one
/// JSON value per line. Unreadable lines are skipped like any other malformed
/// entry.
fn read_network_log(path: &Path) -> Result<Vec<Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading network log {}", path.display()))?;
    if let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(&raw) {
        return Ok(entries);
    }
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect())
}

/// Prints new items for the downloader and returns how many there were.
fn report(outcomes: &[ItemOutcome]) -> Result<usize> {
    let mut new_items = 0;
    for outcome in outcomes {
        if let Ok(Decision::New(media)) = &outcome.result {
            println!(
                "{}",
                serde_json::to_string(media).context("serializing decision")?
            );
            new_items += 1;
        }
    }
    Ok(new_items)
}

async fn run(args: &GateArgs, settings: &Settings, ctx: &RunContext) -> Result<usize> {
    let sources = args.sources()?;
    let ledger = MediaLedger::open(&settings.db_path, &settings.table_name)
        .await
        .context("opening media ledger")?;

    if args.dry_run {
        let mut outcomes = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let result = preview_media(ctx, &ledger, source, args.captured_at.as_deref()).await;
            outcomes.push(ItemOutcome { index, result });
        }
        return report(&outcomes);
    }

    let lock = MarkerLock::new(&settings.lock_path)
        .with_poll_interval(settings.lock_poll_interval)
        .with_stale_after(settings.lock_stale_after);
    let outcomes = run_exclusive(
        &lock,
        settings.lock_max_wait,
        process_batch(ctx, &ledger, &sources, args.captured_at.as_deref()),
    )
    .await
    .context("acquiring run lock")?;

    for outcome in &outcomes {
        if let Err(err) = &outcome.result {
            eprintln!("Warning: item {} skipped: {err}", outcome.index);
        }
    }
    report(&outcomes)
}

fn exit_status(outcome: &Result<usize>) -> u8 {
    match outcome {
        Ok(0) => EXIT_NOTHING_NEW,
        Ok(_) => EXIT_NEW_MEDIA,
        Err(_) => EXIT_ABORTED,
    }
}

async fn gate(args: &GateArgs) -> Result<usize> {
    let settings = resolve_settings(args.overrides())?;
    let _log = logging::init(
        &settings.log_dir,
        PROGRAM,
        &args.account,
        settings.log_level.as_deref(),
    )?;

    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| format!("{}-{}", Local::now().format("%Y%m%d%H%M%S"), std::process::id()));
    let ctx = RunContext::new(&args.account, run_id);
    tracing::info!(parent: ctx.span(), db = %settings.db_path.display(), "run started");

    match run(args, &settings, &ctx).await {
        Ok(new_items) => {
            tracing::info!(parent: ctx.span(), new_items, "run finished");
            Ok(new_items)
        }
        Err(err) => {
            tracing::error!(parent: ctx.span(), error = %format!("{err:#}"), "run aborted");
            Err(err)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = GateArgs::parse();
    let outcome = gate(&args).await;
    if let Err(err) = &outcome {
        eprintln!("Error: {err:#}");
    }
    ExitCode::from(exit_status(&outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;
    use storygate_tools::lock::RunLock;
    use tempfile::tempdir;

    fn parse(values: &[&str]) -> GateArgs {
        GateArgs::try_parse_from(std::iter::once(PROGRAM).chain(values.iter().copied())).unwrap()
    }

    #[test]
    fn cli_definition_is_valid() {
        GateArgs::command().debug_assert();
    }

    #[test]
    fn repeated_image_urls_become_sources() {
        let args = parse(&[
            "--account",
            "shop_a",
            "--image-url",
            "https://cdn.example/1.jpg",
            "--image-url",
            "https://cdn.example/2.jpg",
            "--video-url",
            "https://cdn.example/v.mp4",
        ]);
        let sources = args.sources().unwrap();
        assert_eq!(sources.len(), 3);
        assert!(matches!(&sources[0], MediaSource::Image { url } if url.ends_with("1.jpg")));
        assert!(matches!(&sources[2], MediaSource::VideoUrl { .. }));
    }

    #[test]
    fn no_sources_is_an_error() {
        let args = parse(&["--account", "shop_a"]);
        assert!(args.sources().is_err());
    }

    #[test]
    fn account_is_required() {
        assert!(GateArgs::try_parse_from([PROGRAM, "--image-url", "x"]).is_err());
    }

    #[test]
    fn overrides_carry_cli_values() {
        let args = parse(&[
            "--account",
            "shop_a",
            "--db",
            "/data/ledger.db",
            "--max-wait-secs",
            "12",
        ]);
        let overrides = args.overrides();
        assert_eq!(overrides.db_path, Some(PathBuf::from("/data/ledger.db")));
        assert_eq!(overrides.lock_max_wait, Some(Duration::from_secs(12)));
        assert!(overrides.table_name.is_none());
    }

    #[test]
    fn network_log_reads_array_and_lines() {
        let dir = tempdir().unwrap();
        let entry = json!({"message": "{}"});

        let array = dir.path().join("array.json");
        fs::write(&array, json!([entry, entry]).to_string()).unwrap();
        assert_eq!(read_network_log(&array).unwrap().len(), 2);

        let lines = dir.path().join("lines.jsonl");
        fs::write(&lines, format!("{entry}\n\nnot json\n{entry}\n")).unwrap();
        assert_eq!(read_network_log(&lines).unwrap().len(), 2);

        assert!(read_network_log(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn dry_run_does_not_record() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("ledger.db");
        let args = parse(&[
            "--account",
            "shop_a",
            "--captured-at",
            "2024-05-01T10:00:00Z",
            "--image-url",
            "https://cdn.example/1.jpg?ig_cache_key=QQ%3D%3D",
            "--dry-run",
        ]);
        let settings = resolve_settings(SettingsOverrides {
            db_path: Some(db.clone()),
            lock_path: Some(dir.path().join("run.lock")),
            env_path: Some(dir.path().join("absent.env")),
            ..SettingsOverrides::default()
        })
        .unwrap();
        let ctx = RunContext::new("shop_a", "t");

        assert_eq!(run(&args, &settings, &ctx).await.unwrap(), 1);
        assert_eq!(run(&args, &settings, &ctx).await.unwrap(), 1);

        let ledger = MediaLedger::open(&db, &settings.table_name).await.unwrap();
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[test]
    fn exit_status_separates_aborts_from_nothing_new() {
        assert_eq!(exit_status(&Ok(3)), EXIT_NEW_MEDIA);
        assert_eq!(exit_status(&Ok(0)), EXIT_NOTHING_NEW);
        assert_eq!(exit_status(&Err(anyhow::anyhow!("lock timeout"))), EXIT_ABORTED);
        assert_ne!(EXIT_ABORTED, EXIT_NOTHING_NEW);
    }

    #[tokio::test]
    async fn lock_timeout_aborts_the_run() {
        let dir = tempdir().unwrap();
        let args = parse(&[
            "--account",
            "shop_a",
            "--image-url",
            "https://cdn.example/1.jpg?ig_cache_key=QQ%3D%3D",
        ]);
        let settings = resolve_settings(SettingsOverrides {
            db_path: Some(dir.path().join("ledger.db")),
            lock_path: Some(dir.path().join("run.lock")),
            lock_max_wait: Some(Duration::ZERO),
            env_path: Some(dir.path().join("absent.env")),
            ..SettingsOverrides::default()
        })
        .unwrap();
        let ctx = RunContext::new("shop_a", "t");

        let holder = MarkerLock::new(&settings.lock_path);
        let held = holder.acquire(Duration::from_secs(1)).await.unwrap();
        let outcome = run(&args, &settings, &ctx).await;
        assert_eq!(exit_status(&outcome), EXIT_ABORTED);
        holder.release(held).await;

        let ledger = MediaLedger::open(&settings.db_path, &settings.table_name)
            .await
            .unwrap();
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn locked_run_records_once() {
        let dir = tempdir().unwrap();
        let args = parse(&[
            "--account",
            "shop_a",
            "--captured-at",
            "2024-05-01T10:00:00Z",
            "--image-url",
            "https://cdn.example/1.jpg?ig_cache_key=QQ%3D%3D",
        ]);
        let settings = resolve_settings(SettingsOverrides {
            db_path: Some(dir.path().join("ledger.db")),
            lock_path: Some(dir.path().join("run.lock")),
            env_path: Some(dir.path().join("absent.env")),
            ..SettingsOverrides::default()
        })
        .unwrap();
        let ctx = RunContext::new("shop_a", "t");

        assert_eq!(run(&args, &settings, &ctx).await.unwrap(), 1);
        assert_eq!(run(&args, &settings, &ctx).await.unwrap(), 0);
        assert!(!settings.lock_path.exists());
    }
}
