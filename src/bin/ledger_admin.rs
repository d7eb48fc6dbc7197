#![forbid(unsafe_code)]

//! Maintenance entry point for the media ledger: inspect rows, remove the
//! records of an account, and run the nightly retention sweep.

use anyhow::{Context, Result};
use chrono::{Days, Local};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use storygate_tools::{
    config::{SettingsOverrides, resolve_settings},
    housekeeping::{LogRetention, sweep_log_dirs},
    ledger::{MediaLedger, MediaRecord},
    logging,
};

const PROGRAM: &str = "ledger_admin";
const DEFAULT_COLUMN_WIDTH: usize = 50;

#[derive(Debug, Parser)]
#[command(name = PROGRAM, about = "Inspect and maintain the media ledger")]
struct AdminArgs {
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[arg(long, global = true)]
    table: Option<String>,
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: AdminCommand,
}

#[derive(Debug, Subcommand)]
enum AdminCommand {
    /// Print ledger rows as a table.
    List {
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value_t = DEFAULT_COLUMN_WIDTH)]
        max_width: usize,
    },
    /// Delete every record of an account, or only those with one key.
    Delete {
        #[arg(long)]
        account: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Drop expired ledger rows and old log folders.
    Sweep {
        #[arg(long)]
        retention_days: Option<u32>,
        #[arg(long)]
        skip_logs: bool,
    },
}

impl AdminArgs {
    fn overrides(&self) -> SettingsOverrides {
        let retention_days = match &self.command {
            AdminCommand::Sweep { retention_days, .. } => *retention_days,
            _ => None,
        };
        SettingsOverrides {
            db_path: self.db.clone(),
            table_name: self.table.clone(),
            log_dir: self.log_dir.clone(),
            retention_days,
            env_path: self.env_file.clone(),
            ..SettingsOverrides::default()
        }
    }
}

fn truncate(value: &str, max_width: usize) -> String {
    if value.chars().count() <= max_width {
        return value.to_string();
    }
    if max_width <= 3 {
        return value.chars().take(max_width).collect();
    }
    let kept: String = value.chars().take(max_width - 3).collect();
    format!("{kept}...")
}

/// Renders rows as a bordered text table with columns capped at `max_width`.
fn render_table(table: &str, records: &[MediaRecord], max_width: usize) -> String {
    const COLUMNS: [&str; 5] = [
        "account_name",
        "content_key",
        "media_url",
        "captured_at",
        "created_at",
    ];
    let rows: Vec<[String; 5]> = records
        .iter()
        .map(|record| {
            [
                record.account_name.clone(),
                record.content_key.clone().unwrap_or_else(|| "None".into()),
                record.media_url.clone(),
                record.captured_at.clone(),
                record.created_at.clone(),
            ]
            .map(|value| truncate(&value, max_width))
        })
        .collect();

    let widths: Vec<usize> = COLUMNS
        .iter()
        .enumerate()
        .map(|(index, name)| {
            rows.iter()
                .map(|row| row[index].chars().count())
                .chain(std::iter::once(name.len()))
                .max()
                .unwrap_or_default()
                .min(max_width.max(name.len()))
        })
        .collect();

    let border = format!(
        "+{}+",
        widths
            .iter()
            .map(|width| "-".repeat(width + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let line = |cells: &[String]| {
        let cells: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!(" {cell:<width$} "))
            .collect();
        format!("|{}|", cells.join("|"))
    };

    let mut out = vec![format!("Table: {table}"), border.clone()];
    out.push(line(COLUMNS.map(String::from).as_slice()));
    out.push(border.clone());
    if rows.is_empty() {
        out.push("(no records)".to_string());
    }
    for row in &rows {
        out.push(line(row.as_slice()));
    }
    out.push(border);
    out.join("\n")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AdminArgs::parse();
    let settings = resolve_settings(args.overrides())?;
    let _log = logging::init(&settings.log_dir, PROGRAM, "admin", settings.log_level.as_deref())?;

    let ledger = MediaLedger::open(&settings.db_path, &settings.table_name)
        .await
        .context("opening media ledger")?;

    match &args.command {
        AdminCommand::List { account, max_width } => {
            let records = ledger.list_records(account.as_deref()).await?;
            println!("{}", render_table(ledger.table(), &records, *max_width));
        }
        AdminCommand::Delete { account, key } => {
            let deleted = match key {
                Some(key) => ledger.delete_record(account, key).await?,
                None => ledger.delete_account(account).await?,
            };
            if deleted == 0 {
                println!("No matching records for {account}");
            } else {
                println!("Deleted {deleted} record(s) for {account}");
            }
        }
        AdminCommand::Sweep { skip_logs, .. } => {
            let now = Local::now().naive_local();
            let cutoff = now
                .checked_sub_days(Days::new(u64::from(settings.retention_days)))
                .context("computing retention cutoff")?;
            let report = ledger.purge_created_before(cutoff).await?;
            println!(
                "Deleted {} record(s) created before {}; {} remaining",
                report.deleted,
                cutoff.format("%Y-%m-%d %H:%M:%S"),
                report.remaining
            );

            if !skip_logs {
                let sweep = sweep_log_dirs(&settings.log_dir, now.date(), LogRetention::default());
                println!(
                    "Removed {} daily and {} monthly log folder(s), {} failure(s)",
                    sweep.daily_removed.len(),
                    sweep.monthly_removed.len(),
                    sweep.failures
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn record(key: Option<&str>, url: &str) -> MediaRecord {
        MediaRecord {
            account_name: "shop_a".into(),
            content_key: key.map(str::to_owned),
            media_url: url.into(),
            captured_at: "2024-05-01T10:00:00Z".into(),
            created_at: "2024-05-01 19:00:05".into(),
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        AdminArgs::command().debug_assert();
    }

    #[test]
    fn sweep_retention_flows_into_overrides() {
        let args =
            AdminArgs::try_parse_from([PROGRAM, "sweep", "--retention-days", "7", "--db", "x.db"])
                .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.retention_days, Some(7));
        assert_eq!(overrides.db_path, Some(PathBuf::from("x.db")));
    }

    #[test]
    fn delete_requires_account() {
        assert!(AdminArgs::try_parse_from([PROGRAM, "delete"]).is_err());
        let args =
            AdminArgs::try_parse_from([PROGRAM, "delete", "--account", "shop_a", "--key", "k"])
                .unwrap();
        assert!(matches!(
            args.command,
            AdminCommand::Delete { ref account, key: Some(ref key) } if account == "shop_a" && key == "k"
        ));
    }

    #[test]
    fn truncate_marks_cut_values() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(truncate("abcdef", 2), "ab");
    }

    #[test]
    fn table_renders_rows_with_bounded_width() {
        let records = vec![
            record(Some("QUJD=="), "https://cdn.example/a-very-long-media-url.jpg"),
            record(None, "https://cdn.example/b.jpg"),
        ];
        let rendered = render_table("media_records", &records, 20);
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(lines[0], "Table: media_records");
        assert!(lines[2].contains("account_name"));
        assert!(rendered.contains("https://cdn.examp..."));
        assert!(rendered.contains(" None "));
        let border_len = lines[1].len();
        assert!(lines[1..].iter().all(|line| line.chars().count() == border_len));
    }

    #[test]
    fn empty_table_says_so() {
        let rendered = render_table("media_records", &[], 20);
        assert!(rendered.contains("(no records)"));
    }
}
