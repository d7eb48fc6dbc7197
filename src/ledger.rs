#![forbid(unsafe_code)]

//! Persistent dedup ledger. One row per media item we decided to process.
//!
//! Identity is `(account_name, content_key, captured_at)` for keyed media and
//! `(account_name, captured_at)` for media without a cache token. Both are
//! enforced by partial unique indexes, so the existence check and the insert
//! are a single atomic statement even across processes.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use libsql::{Builder, Connection, Row, params};
use serde::Serialize;
use thiserror::Error;

use crate::context::RunContext;

pub const DEFAULT_TABLE_NAME: &str = "media_records";
const BUSY_TIMEOUT_MS: u32 = 5_000;
const SQLITE_CONSTRAINT: i32 = 19;
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;
/// Format used by SQLite's `DATETIME()` and therefore by `created_at`.
pub const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage unavailable while {context}: {source}")]
    StorageUnavailable {
        context: String,
        #[source]
        source: libsql::Error,
    },
    #[error("creating ledger directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid ledger table name {0:?}")]
    InvalidTableName(String),
}

fn storage(context: impl Into<String>) -> impl FnOnce(libsql::Error) -> LedgerError {
    let context = context.into();
    move |source| LedgerError::StorageUnavailable { context, source }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaRecord {
    pub account_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_key: Option<String>,
    pub media_url: String,
    pub captured_at: String,
    pub created_at: String,
}

/// Counts reported by a retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: u64,
    pub remaining: u64,
}

/// Outcome of a single insert attempt. The duplicate case never leaves this
/// module as an error.
enum InsertError {
    Duplicate,
    Storage(libsql::Error),
}

async fn configure_connection(conn: &Connection) -> Result<(), libsql::Error> {
    conn.execute_batch(&format!(
        r#"
        PRAGMA busy_timeout={BUSY_TIMEOUT_MS};
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#
    ))
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection, table: &str) -> Result<(), libsql::Error> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            account_name TEXT NOT NULL,
            content_key TEXT,
            media_url TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            created_at DATETIME NOT NULL DEFAULT (DATETIME(CURRENT_TIMESTAMP, 'localtime'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_keyed
            ON {table}(account_name, content_key, captured_at)
            WHERE content_key IS NOT NULL;
        CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_keyless
            ON {table}(account_name, captured_at)
            WHERE content_key IS NULL;
        CREATE INDEX IF NOT EXISTS idx_{table}_created ON {table}(created_at);
        "#
    ))
    .await?;
    Ok(())
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table_name(table: &str) -> Result<(), LedgerError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(LedgerError::InvalidTableName(table.to_string()))
    }
}

/// Only uniqueness conflicts mean "already recorded". NOT NULL, CHECK and
/// other constraint failures stay storage errors.
fn is_duplicate_violation(err: &libsql::Error) -> bool {
    match err {
        libsql::Error::SqliteFailure(code, message) => match *code {
            SQLITE_CONSTRAINT_UNIQUE | SQLITE_CONSTRAINT_PRIMARYKEY => true,
            // Some builds report only the primary code.
            SQLITE_CONSTRAINT => message.contains("UNIQUE constraint failed"),
            _ => false,
        },
        other => other.to_string().contains("UNIQUE constraint failed"),
    }
}

/// Blank keys carry no identity and fall back to timestamp-only dedup.
pub fn normalize_key(key: Option<&str>) -> Option<&str> {
    key.map(str::trim).filter(|key| !key.is_empty())
}

pub struct MediaLedger {
    conn: Connection,
    table: String,
    path: PathBuf,
}

impl std::fmt::Debug for MediaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaLedger")
            .field("table", &self.table)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl MediaLedger {
    /// Opens (and if necessary creates) the ledger DB and its table.
    pub async fn open(path: &Path, table: &str) -> Result<Self, LedgerError> {
        validate_table_name(table)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(storage(format!("opening ledger {}", path.display())))?;
        let conn = db
            .connect()
            .map_err(storage(format!("connecting to ledger {}", path.display())))?;
        configure_connection(&conn)
            .await
            .map_err(storage("configuring connection"))?;
        ensure_schema(&conn, table)
            .await
            .map_err(storage(format!("creating table {table}")))?;

        Ok(Self {
            conn,
            table: table.to_string(),
            path: path.to_path_buf(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Records the media item unless an identical identity already exists.
    ///
    /// Returns `Ok(true)` when a row was inserted and `Ok(false)` for a
    /// duplicate. Only storage faults are errors.
    pub async fn check_and_insert(
        &self,
        ctx: &RunContext,
        content_key: Option<&str>,
        media_url: &str,
        captured_at: &str,
    ) -> Result<bool, LedgerError> {
        let account = ctx.account();
        let key = normalize_key(content_key);
        let sql = format!(
            "INSERT INTO {} (account_name, content_key, media_url, captured_at) VALUES (?1, ?2, ?3, ?4)",
            self.table
        );

        let result = self
            .conn
            .execute(&sql, params![account, key, media_url, captured_at])
            .await
            .map_err(|err| {
                if is_duplicate_violation(&err) {
                    InsertError::Duplicate
                } else {
                    InsertError::Storage(err)
                }
            });

        match result {
            Ok(_) => {
                tracing::info!(
                    parent: ctx.span(),
                    account,
                    key = key.unwrap_or("-"),
                    captured_at,
                    "recorded new media"
                );
                Ok(true)
            }
            Err(InsertError::Duplicate) => {
                tracing::info!(
                    parent: ctx.span(),
                    account,
                    key = key.unwrap_or("-"),
                    captured_at,
                    media_url,
                    sql = %sql,
                    "duplicate media, insert skipped"
                );
                Ok(false)
            }
            Err(InsertError::Storage(source)) => {
                tracing::error!(
                    parent: ctx.span(),
                    db = %self.path.display(),
                    table = %self.table,
                    account,
                    key = key.unwrap_or("-"),
                    captured_at,
                    media_url,
                    sql = %sql,
                    error = %source,
                    "ledger insert failed"
                );
                Err(LedgerError::StorageUnavailable {
                    context: format!("inserting media for {account}"),
                    source,
                })
            }
        }
    }

    /// Read-only version of the conflict test performed by
    /// [`check_and_insert`](Self::check_and_insert).
    pub async fn contains(
        &self,
        account: &str,
        content_key: Option<&str>,
        captured_at: &str,
    ) -> Result<bool, LedgerError> {
        let key = normalize_key(content_key);
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT 1 FROM {} WHERE account_name = ?1 AND captured_at = ?2 AND content_key IS ?3 LIMIT 1",
                    self.table
                ),
                params![account, captured_at, key],
            )
            .await
            .map_err(storage("checking for existing media"))?;
        let found = rows
            .next()
            .await
            .map_err(storage("reading existing media"))?
            .is_some();
        Ok(found)
    }

    /// Lists records, optionally limited to one account, oldest first.
    pub async fn list_records(&self, account: Option<&str>) -> Result<Vec<MediaRecord>, LedgerError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    SELECT account_name, content_key, media_url, captured_at, created_at
                    FROM {}
                    WHERE ?1 IS NULL OR account_name = ?1
                    ORDER BY created_at ASC, rowid ASC
                    "#,
                    self.table
                ),
                params![account],
            )
            .await
            .map_err(storage("listing media records"))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage("reading media records"))? {
            records.push(row_to_record(&row).map_err(storage("decoding media record"))?);
        }
        Ok(records)
    }

    /// Deletes every record of `account`. Returns the number of rows removed.
    pub async fn delete_account(&self, account: &str) -> Result<u64, LedgerError> {
        let deleted = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE account_name = ?1", self.table),
                params![account],
            )
            .await
            .map_err(storage(format!("deleting records of {account}")))?;
        tracing::info!(account, deleted, "deleted account records");
        Ok(deleted)
    }

    /// Deletes the records of `account` carrying `content_key`, whatever their
    /// capture time.
    pub async fn delete_record(&self, account: &str, content_key: &str) -> Result<u64, LedgerError> {
        let deleted = self
            .conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE account_name = ?1 AND content_key = ?2",
                    self.table
                ),
                params![account, content_key],
            )
            .await
            .map_err(storage(format!("deleting record {content_key} of {account}")))?;
        tracing::info!(account, key = content_key, deleted, "deleted record");
        Ok(deleted)
    }

    /// Retention sweep: drops rows created before `cutoff` (local time).
    pub async fn purge_created_before(&self, cutoff: NaiveDateTime) -> Result<PurgeReport, LedgerError> {
        let cutoff = cutoff.format(SQLITE_DATETIME_FORMAT).to_string();
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(storage("starting retention sweep"))?;
        let deleted = tx
            .execute(
                &format!("DELETE FROM {} WHERE created_at < ?1", self.table),
                params![cutoff.as_str()],
            )
            .await
            .map_err(storage("deleting expired records"))?;
        tx.commit().await.map_err(storage("committing retention sweep"))?;

        let remaining = self.count().await?;
        tracing::info!(cutoff = %cutoff, deleted, remaining, "retention sweep finished");
        Ok(PurgeReport { deleted, remaining })
    }

    pub async fn count(&self) -> Result<u64, LedgerError> {
        let mut rows = self
            .conn
            .query(&format!("SELECT COUNT(*) FROM {}", self.table), params![])
            .await
            .map_err(storage("counting records"))?;
        let count = match rows.next().await.map_err(storage("counting records"))? {
            Some(row) => row.get::<i64>(0).map_err(storage("counting records"))?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn row_to_record(row: &Row) -> Result<MediaRecord, libsql::Error> {
    // Column order must match the SELECT in list_records.
    Ok(MediaRecord {
        account_name: row.get(0)?,
        content_key: row.get(1)?,
        media_url: row.get(2)?,
        captured_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}
