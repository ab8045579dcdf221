// SQLite persistence of the update-check cache and the rate-budget window.
// Timestamps are stored as unix millis.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{instrument, warn};

use crate::models::{EndpointId, UpdateCheckEntry, UpdateSource};

pub struct CacheRepo {
    pool: SqlitePool,
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

impl CacheRepo {
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS update_cache (
                endpoint_id INTEGER NOT NULL,
                image TEXT NOT NULL,
                checked_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                available INTEGER NOT NULL,
                source TEXT NOT NULL,
                last_error TEXT,
                available_version TEXT,
                PRIMARY KEY (endpoint_id, image)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS budget_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint_id INTEGER NOT NULL,
                used_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_budget_used_at ON budget_usage(used_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, entry), fields(repo = "cache", operation = "save_entry", image = %entry.image))]
    pub async fn save_entry(
        &self,
        endpoint: EndpointId,
        entry: &UpdateCheckEntry,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO update_cache (endpoint_id, image, checked_at, expires_at, available, source, last_error, available_version) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(endpoint as i64)
        .bind(&entry.image)
        .bind(entry.checked_at.timestamp_millis())
        .bind(entry.expires_at.timestamp_millis())
        .bind(entry.available)
        .bind(entry.source.as_str())
        .bind(entry.last_error.as_deref())
        .bind(entry.available_version.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All cached entries, expired ones included (they still serve as stale fallback).
    #[instrument(skip(self), fields(repo = "cache", operation = "load_entries"))]
    pub async fn load_entries(&self) -> anyhow::Result<Vec<(EndpointId, UpdateCheckEntry)>> {
        let rows = sqlx::query(
            "SELECT endpoint_id, image, checked_at, expires_at, available, source, last_error, available_version FROM update_cache",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let image: String = row.get("image");
            let source: String = row.get("source");
            let source = match UpdateSource::from_str(&source) {
                Ok(s) => s,
                Err(e) => {
                    warn!(image = %image, error = %e, "skipping cache row");
                    continue;
                }
            };
            let (Some(checked_at), Some(expires_at)) = (
                from_millis(row.get("checked_at")),
                from_millis(row.get("expires_at")),
            ) else {
                warn!(image = %image, "skipping cache row with invalid timestamps");
                continue;
            };
            let endpoint: i64 = row.get("endpoint_id");
            entries.push((
                endpoint as EndpointId,
                UpdateCheckEntry {
                    image,
                    checked_at,
                    expires_at,
                    available: row.get("available"),
                    source,
                    last_error: row.get("last_error"),
                    available_version: row.get("available_version"),
                },
            ));
        }
        Ok(entries)
    }

    #[instrument(skip(self), fields(repo = "cache", operation = "record_budget_use"))]
    pub async fn record_budget_use(
        &self,
        endpoint: EndpointId,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO budget_usage (endpoint_id, used_at) VALUES ($1, $2)")
            .bind(endpoint as i64)
            .bind(at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Budget units spent at or after `since`, per endpoint.
    #[instrument(skip(self), fields(repo = "cache", operation = "load_budget_usage"))]
    pub async fn load_budget_usage(
        &self,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<(EndpointId, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT endpoint_id, used_at FROM budget_usage WHERE used_at >= $1 ORDER BY used_at ASC",
        )
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let endpoint: i64 = row.get("endpoint_id");
                from_millis(row.get("used_at")).map(|t| (endpoint as EndpointId, t))
            })
            .collect())
    }

    /// Drop budget rows that left the window. Returns the number of rows deleted.
    #[instrument(skip(self), fields(repo = "cache", operation = "prune_budget_usage"))]
    pub async fn prune_budget_usage(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM budget_usage WHERE used_at < $1")
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
