//! Database connection and operations

pub mod download_items;
pub mod sqlite_helpers;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

pub use download_items::{
    DownloadItem, DownloadItemRepository, DownloadState, DownloadType, MediaItem,
    SqliteDownloadItemRepository,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS download_items (
        id TEXT PRIMARY KEY NOT NULL,
        owner_id TEXT,
        token TEXT NOT NULL,
        url TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        total_size INTEGER NOT NULL DEFAULT 0,
        hash TEXT,
        download_type TEXT NOT NULL,
        state TEXT NOT NULL,
        archived INTEGER NOT NULL DEFAULT 0,
        started_at TEXT,
        downloaded_at TEXT,
        completed_at TEXT,
        canceled_at TEXT,
        moved_files TEXT NOT NULL DEFAULT '[]'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_download_items_token ON download_items (token)",
    "CREATE INDEX IF NOT EXISTS idx_download_items_hash ON download_items (hash)",
    "CREATE INDEX IF NOT EXISTS idx_download_items_state ON download_items (state, archived)",
];

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the SQLite database at `path` and ensure the schema
    pub async fn connect(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", path))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database; a single connection keeps every query on
    /// the same memory store
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn download_items(&self) -> SqliteDownloadItemRepository {
        SqliteDownloadItemRepository::new(self.pool.clone())
    }

    /// Create tables and indexes that do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply database schema")?;
        }
        Ok(())
    }
}
