use std::path::Path;

use log::info;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};

use crate::errors::HistoryError;
use crate::models::{HistoryEntry, HistoryPage};

/// Append-only sink for executed statements.
///
/// Callers treat a failed append as a logged warning, never as a failure of
/// the statement being recorded.
#[async_trait::async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn append(&self, entry: &HistoryEntry) -> Result<(), HistoryError>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS query_history (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        sql         TEXT NOT NULL,
        database    TEXT NOT NULL DEFAULT '',
        duration_ms INTEGER NOT NULL DEFAULT 0,
        row_count   INTEGER NOT NULL DEFAULT 0,
        error       TEXT NOT NULL DEFAULT '',
        executed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_history_executed_at ON query_history(executed_at DESC)",
];

/// Query history kept in a local SQLite file.
pub struct HistoryStore {
    pool: Pool<Sqlite>,
}

impl HistoryStore {
    /// Open (creating if needed) the history database at `path`.
    pub async fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(|source| HistoryError::Directory {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.to_string_lossy());
        info!("opening history store at {}", path.display());
        Self::connect(&url).await
    }

    /// Throwaway store living only as long as this value.
    pub async fn in_memory() -> Result<Self, HistoryError> {
        Self::connect("sqlite::memory:").await
    }

    async fn connect(url: &str) -> Result<Self, HistoryError> {
        // one connection: an in-memory database is private to its connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Newest first, with the total number of stored entries.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<HistoryPage, HistoryError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_history")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT id, sql, database, duration_ms, row_count, error, executed_at
             FROM query_history ORDER BY executed_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .into_iter()
            .map(|row| HistoryEntry {
                id: Some(row.get("id")),
                sql: row.get("sql"),
                database: row.get("database"),
                duration_ms: row.get("duration_ms"),
                row_count: row.get("row_count"),
                error: row.get("error"),
                executed_at: row.get("executed_at"),
            })
            .collect();

        Ok(HistoryPage { entries, total })
    }

    pub async fn clear(&self) -> Result<(), HistoryError> {
        sqlx::query("DELETE FROM query_history")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait::async_trait]
impl HistoryRecorder for HistoryStore {
    async fn append(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        sqlx::query(
            "INSERT INTO query_history (sql, database, duration_ms, row_count, error, executed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.sql)
        .bind(&entry.database)
        .bind(entry.duration_ms)
        .bind(entry.row_count)
        .bind(&entry.error)
        .bind(&entry.executed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
