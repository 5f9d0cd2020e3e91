//! Shared state database backed by SQLite.
//!
//! Every replica opens the same database file, so the emergency stop flag,
//! session revocations and authorization records are visible to all of them.
//! The schema migration is applied inline via `include_str!` on open.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::StoreConfig;
use crate::error::ControlError;

/// Open (or create) the control plane database and apply the schema.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migration fails.
pub async fn open(path: &Path, config: &StoreConfig) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .pragma("trusted_schema", "OFF")
        .pragma("foreign_keys", "ON");

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open control database at {}", path.display()))?;

    let migration_sql = include_str!("../migrations/001_control_plane.sql");
    sqlx::raw_sql(migration_sql)
        .execute(&pool)
        .await
        .context("failed to apply control plane schema migration")?;

    tracing::info!(path = %path.display(), "control database ready");
    Ok(pool)
}

/// Encode a timestamp for storage.
///
/// Fixed-width RFC 3339 with microseconds and a `Z` suffix, so stored values
/// order lexicographically the same way they order in time. Years outside
/// 0..=9999 would break the fixed width and are refused.
pub(crate) fn encode_time(at: DateTime<Utc>) -> Result<String, ControlError> {
    if !(0..=9999).contains(&at.year()) {
        return Err(ControlError::TimeOutOfRange(at));
    }
    Ok(at.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Decode a timestamp written by [`encode_time`].
pub(crate) fn decode_time(field: &'static str, raw: &str) -> Result<DateTime<Utc>, ControlError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ControlError::CorruptRow {
            field,
            value: raw.to_owned(),
        })
}

/// Decode an optional timestamp column.
pub(crate) fn decode_opt_time(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, ControlError> {
    raw.map(|r| decode_time(field, r)).transpose()
}
