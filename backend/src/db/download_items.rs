//! Download item persistence
//!
//! A download item tracks one acquisition from the moment a download method
//! accepts its URL until it is archived.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::sqlite_helpers::{
    bool_to_int, datetime_opt_to_str, datetime_to_str, int_to_bool, json_to_vec, str_to_datetime_opt,
    str_to_uuid, str_to_uuid_opt, uuid_to_str, vec_to_json,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadType {
    Direct,
    PeerToPeer,
}

impl DownloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadType::Direct => "direct",
            DownloadType::PeerToPeer => "peer_to_peer",
        }
    }
}

impl FromStr for DownloadType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(DownloadType::Direct),
            "peer_to_peer" => Ok(DownloadType::PeerToPeer),
            other => bail!("Unknown download type '{}'", other),
        }
    }
}

/// `Downloading -> Processing -> Completed`, or `Downloading -> Canceled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Downloading,
    Processing,
    Completed,
    Canceled,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Downloading => "downloading",
            DownloadState::Processing => "processing",
            DownloadState::Completed => "completed",
            DownloadState::Canceled => "canceled",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DownloadState::Downloading | DownloadState::Processing)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "downloading" => Ok(DownloadState::Downloading),
            "processing" => Ok(DownloadState::Processing),
            "completed" => Ok(DownloadState::Completed),
            "canceled" => Ok(DownloadState::Canceled),
            other => bail!("Unknown download state '{}'", other),
        }
    }
}

/// One entry produced by library ingestion, relative to the library root.
/// Directories have no size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub path: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: Uuid,
    pub owner_id: Option<Uuid>,
    /// External identifier, also the staging directory name
    pub token: String,
    pub url: String,
    pub name: String,
    pub total_size: i64,
    /// Recomputed on demand by the download method, never persisted
    #[serde(default)]
    pub downloaded_size: i64,
    /// Torrent infohash, peer-to-peer items only
    pub hash: Option<String>,
    pub download_type: DownloadType,
    pub state: DownloadState,
    pub archived: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub moved_files: Vec<MediaItem>,
}

impl DownloadItem {
    pub fn new(url: impl Into<String>, owner_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            token: String::new(),
            url: url.into(),
            name: String::new(),
            total_size: 0,
            downloaded_size: 0,
            hash: None,
            download_type: DownloadType::Direct,
            state: DownloadState::Downloading,
            archived: false,
            started_at: None,
            downloaded_at: None,
            completed_at: None,
            canceled_at: None,
            moved_files: Vec::new(),
        }
    }

    /// Stem of the largest moved file, or the item name when nothing was moved
    pub fn main_filename(&self) -> String {
        self.moved_files
            .iter()
            .filter(|f| f.size.is_some())
            .max_by_key(|f| f.size)
            .and_then(|f| Path::new(&f.path).file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for DownloadItem {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        fn decode<T>(r: Result<T>) -> sqlx::Result<T> {
            r.map_err(|e| sqlx::Error::Decode(e.into()))
        }

        let id: String = row.try_get("id")?;
        let owner_id: Option<String> = row.try_get("owner_id")?;
        let download_type: String = row.try_get("download_type")?;
        let state: String = row.try_get("state")?;
        let archived: i32 = row.try_get("archived")?;
        let started_at: Option<String> = row.try_get("started_at")?;
        let downloaded_at: Option<String> = row.try_get("downloaded_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;
        let canceled_at: Option<String> = row.try_get("canceled_at")?;
        let moved_files: String = row.try_get("moved_files")?;

        Ok(Self {
            id: decode(str_to_uuid(&id))?,
            owner_id: decode(str_to_uuid_opt(owner_id.as_deref()))?,
            token: row.try_get("token")?,
            url: row.try_get("url")?,
            name: row.try_get("name")?,
            total_size: row.try_get("total_size")?,
            downloaded_size: 0,
            hash: row.try_get("hash")?,
            download_type: decode(download_type.parse())?,
            state: decode(state.parse())?,
            archived: int_to_bool(archived),
            started_at: decode(str_to_datetime_opt(started_at.as_deref()))?,
            downloaded_at: decode(str_to_datetime_opt(downloaded_at.as_deref()))?,
            completed_at: decode(str_to_datetime_opt(completed_at.as_deref()))?,
            canceled_at: decode(str_to_datetime_opt(canceled_at.as_deref()))?,
            moved_files: json_to_vec(&moved_files),
        })
    }
}

/// Persistence operations the download services depend on
#[async_trait]
pub trait DownloadItemRepository: Send + Sync {
    /// Every item not archived yet, oldest start first
    async fn find_all_unarchived(&self) -> Result<Vec<DownloadItem>>;

    async fn find_by_token(&self, token: &str) -> Result<Option<DownloadItem>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<DownloadItem>>;

    /// Unarchived item carrying this torrent infohash
    async fn find_by_hash(&self, hash: &str) -> Result<Option<DownloadItem>>;

    async fn add(&self, item: &DownloadItem) -> Result<()>;

    async fn update(&self, item: &DownloadItem) -> Result<()>;

    /// Stamp `started_at`, clear `archived`, set `Downloading` and persist
    async fn start(&self, item: &mut DownloadItem) -> Result<()>;

    /// Stamp `canceled_at`, set `Canceled` and persist
    async fn cancel(&self, item: &mut DownloadItem) -> Result<()>;

    /// Set `archived` and persist
    async fn archive(&self, item: &mut DownloadItem) -> Result<()>;

    /// Unarchived items canceled or completed more than `threshold_days` ago
    async fn get_passed_items_to_archive(&self, threshold_days: i64) -> Result<Vec<DownloadItem>>;

    /// Whether any item is still downloading or processing
    async fn has_pending_downloads(&self) -> Result<bool>;

    /// Whether an unarchived item already uses this URL
    async fn is_url_downloading(&self, url: &str) -> Result<bool>;

    /// Completed items whose processing ended within the last `days`
    async fn find_recent_completed(&self, days: i64) -> Result<Vec<DownloadItem>>;
}

pub struct SqliteDownloadItemRepository {
    pool: SqlitePool,
}

impl SqliteDownloadItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn upsert(&self, item: &DownloadItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO download_items (
                id, owner_id, token, url, name, total_size, hash, download_type, state,
                archived, started_at, downloaded_at, completed_at, canceled_at, moved_files
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT (id) DO UPDATE SET
                owner_id = excluded.owner_id,
                token = excluded.token,
                url = excluded.url,
                name = excluded.name,
                total_size = excluded.total_size,
                hash = excluded.hash,
                download_type = excluded.download_type,
                state = excluded.state,
                archived = excluded.archived,
                started_at = excluded.started_at,
                downloaded_at = excluded.downloaded_at,
                completed_at = excluded.completed_at,
                canceled_at = excluded.canceled_at,
                moved_files = excluded.moved_files
            "#,
        )
        .bind(uuid_to_str(item.id))
        .bind(item.owner_id.map(uuid_to_str))
        .bind(&item.token)
        .bind(&item.url)
        .bind(&item.name)
        .bind(item.total_size)
        .bind(&item.hash)
        .bind(item.download_type.as_str())
        .bind(item.state.as_str())
        .bind(bool_to_int(item.archived))
        .bind(datetime_opt_to_str(item.started_at))
        .bind(datetime_opt_to_str(item.downloaded_at))
        .bind(datetime_opt_to_str(item.completed_at))
        .bind(datetime_opt_to_str(item.canceled_at))
        .bind(vec_to_json(&item.moved_files))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DownloadItemRepository for SqliteDownloadItemRepository {
    async fn find_all_unarchived(&self) -> Result<Vec<DownloadItem>> {
        let items = sqlx::query_as::<_, DownloadItem>(
            "SELECT * FROM download_items WHERE archived = 0 ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<DownloadItem>> {
        let item =
            sqlx::query_as::<_, DownloadItem>("SELECT * FROM download_items WHERE token = ?1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        Ok(item)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<DownloadItem>> {
        let item = sqlx::query_as::<_, DownloadItem>("SELECT * FROM download_items WHERE id = ?1")
            .bind(uuid_to_str(id))
            .fetch_optional(&self.pool)
            .await?;

        Ok(item)
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<DownloadItem>> {
        let item = sqlx::query_as::<_, DownloadItem>(
            "SELECT * FROM download_items WHERE archived = 0 AND lower(hash) = lower(?1)",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(item)
    }

    async fn add(&self, item: &DownloadItem) -> Result<()> {
        self.upsert(item).await
    }

    async fn update(&self, item: &DownloadItem) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE download_items SET
                token = ?2, url = ?3, name = ?4, total_size = ?5, hash = ?6,
                download_type = ?7, state = ?8, archived = ?9, started_at = ?10,
                downloaded_at = ?11, completed_at = ?12, canceled_at = ?13, moved_files = ?14
            WHERE id = ?1
            "#,
        )
        .bind(uuid_to_str(item.id))
        .bind(&item.token)
        .bind(&item.url)
        .bind(&item.name)
        .bind(item.total_size)
        .bind(&item.hash)
        .bind(item.download_type.as_str())
        .bind(item.state.as_str())
        .bind(bool_to_int(item.archived))
        .bind(datetime_opt_to_str(item.started_at))
        .bind(datetime_opt_to_str(item.downloaded_at))
        .bind(datetime_opt_to_str(item.completed_at))
        .bind(datetime_opt_to_str(item.canceled_at))
        .bind(vec_to_json(&item.moved_files))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("Download item {} does not exist", item.id);
        }
        Ok(())
    }

    async fn start(&self, item: &mut DownloadItem) -> Result<()> {
        item.archived = false;
        item.started_at = Some(Utc::now());
        item.state = DownloadState::Downloading;
        self.upsert(item).await
    }

    async fn cancel(&self, item: &mut DownloadItem) -> Result<()> {
        item.canceled_at = Some(Utc::now());
        item.state = DownloadState::Canceled;
        self.update(item).await
    }

    async fn archive(&self, item: &mut DownloadItem) -> Result<()> {
        item.archived = true;
        self.update(item).await
    }

    async fn get_passed_items_to_archive(&self, threshold_days: i64) -> Result<Vec<DownloadItem>> {
        let threshold = datetime_to_str(Utc::now() - Duration::days(threshold_days));

        let items = sqlx::query_as::<_, DownloadItem>(
            r#"
            SELECT * FROM download_items
            WHERE archived = 0
              AND ((state = 'canceled' AND canceled_at < ?1)
                OR (state = 'completed' AND completed_at < ?1))
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn has_pending_downloads(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM download_items WHERE state IN ('downloading', 'processing')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn is_url_downloading(&self, url: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM download_items WHERE archived = 0 AND url = ?1",
        )
        .bind(url)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn find_recent_completed(&self, days: i64) -> Result<Vec<DownloadItem>> {
        let since = datetime_to_str(Utc::now() - Duration::days(days));

        let items = sqlx::query_as::<_, DownloadItem>(
            r#"
            SELECT * FROM download_items
            WHERE state = 'completed' AND completed_at > ?1
            ORDER BY completed_at DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    async fn repository() -> SqliteDownloadItemRepository {
        let db = Database::connect_in_memory().await.unwrap();
        db.download_items()
    }

    fn item(url: &str) -> DownloadItem {
        let mut item = DownloadItem::new(url, Some(Uuid::new_v4()));
        item.token = format!("_ddl{}", Uuid::new_v4().simple());
        item.name = "file.bin".to_string();
        item.total_size = 1024;
        item
    }

    #[tokio::test]
    async fn test_start_then_find_by_token_and_id() {
        let repo = repository().await;
        let mut item = item("http://host/file.bin");
        item.archived = true;

        repo.start(&mut item).await.unwrap();

        let by_token = repo.find_by_token(&item.token).await.unwrap().unwrap();
        assert_eq!(by_token.id, item.id);
        assert_eq!(by_token.state, DownloadState::Downloading);
        assert!(!by_token.archived);
        assert!(by_token.started_at.is_some());

        let by_id = repo.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(by_id.token, item.token);
        assert_eq!(by_id.owner_id, item.owner_id);
        assert!(repo.find_by_token("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_moved_files_are_persisted_but_downloaded_size_is_not() {
        let repo = repository().await;
        let mut item = item("http://host/file.bin");
        repo.add(&item).await.unwrap();

        item.downloaded_size = 512;
        item.moved_files = vec![
            MediaItem { path: "Movies".to_string(), size: None },
            MediaItem { path: "Movies/file.mkv".to_string(), size: Some(1024) },
        ];
        repo.update(&item).await.unwrap();

        let loaded = repo.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.moved_files, item.moved_files);
        assert_eq!(loaded.downloaded_size, 0);
    }

    #[tokio::test]
    async fn test_update_unknown_item_fails() {
        let repo = repository().await;
        assert!(repo.update(&item("http://host/x")).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_and_archive_stamp_state() {
        let repo = repository().await;
        let mut item = item("http://host/file.bin");
        repo.start(&mut item).await.unwrap();

        repo.cancel(&mut item).await.unwrap();
        let loaded = repo.find_by_id(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, DownloadState::Canceled);
        assert!(loaded.canceled_at.is_some());

        repo.archive(&mut item).await.unwrap();
        assert!(repo.find_all_unarchived().await.unwrap().is_empty());
        assert!(repo.find_by_id(item.id).await.unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn test_get_passed_items_to_archive() {
        let repo = repository().await;
        let now = Utc::now();
        let mut expected = Vec::new();

        for (days, archived) in [(7, false), (6, true), (5, false), (1, false)] {
            let mut canceled = item("http://host/canceled");
            canceled.state = DownloadState::Canceled;
            canceled.canceled_at = Some(now - Duration::days(days));
            canceled.archived = archived;
            repo.add(&canceled).await.unwrap();

            let mut completed = item("http://host/completed");
            completed.state = DownloadState::Completed;
            completed.completed_at = Some(now - Duration::days(days));
            completed.archived = archived;
            repo.add(&completed).await.unwrap();

            if days > 4 && !archived {
                expected.push(canceled.id);
                expected.push(completed.id);
            }
        }

        let mut found: Vec<Uuid> = repo
            .get_passed_items_to_archive(4)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        found.sort();
        expected.sort();

        assert_eq!(found.len(), 4);
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_pending_and_url_checks() {
        let repo = repository().await;
        assert!(!repo.has_pending_downloads().await.unwrap());

        let mut item = item("http://host/file.bin");
        repo.start(&mut item).await.unwrap();
        assert!(repo.has_pending_downloads().await.unwrap());
        assert!(repo.is_url_downloading("http://host/file.bin").await.unwrap());
        assert!(!repo.is_url_downloading("http://host/other.bin").await.unwrap());

        item.state = DownloadState::Processing;
        repo.update(&item).await.unwrap();
        assert!(repo.has_pending_downloads().await.unwrap());

        item.state = DownloadState::Completed;
        item.completed_at = Some(Utc::now());
        repo.update(&item).await.unwrap();
        assert!(!repo.has_pending_downloads().await.unwrap());
        assert_eq!(repo.find_recent_completed(4).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_hash_ignores_case_and_archived() {
        let repo = repository().await;
        let mut item = item("magnet:?xt=urn:btih:abc");
        item.download_type = DownloadType::PeerToPeer;
        item.hash = Some("25c8f093021fd9d97087f9444c160d9bb3d70e35".to_string());
        repo.add(&item).await.unwrap();

        let found = repo
            .find_by_hash("25C8F093021FD9D97087F9444C160D9BB3D70E35")
            .await
            .unwrap();
        assert_eq!(found.map(|i| i.id), Some(item.id));

        repo.archive(&mut item).await.unwrap();
        assert!(repo.find_by_hash(item.hash.as_deref().unwrap()).await.unwrap().is_none());
    }

    #[test]
    fn test_main_filename() {
        let mut item = DownloadItem::new("http://host/x", None);
        item.name = "Fallback".to_string();
        assert_eq!(item.main_filename(), "Fallback");

        item.moved_files = vec![
            MediaItem { path: "TV Shows/Show".to_string(), size: None },
            MediaItem { path: "TV Shows/Show/sample.mkv".to_string(), size: Some(10) },
            MediaItem { path: "TV Shows/Show/Show - S01E01.mkv".to_string(), size: Some(900) },
        ];
        assert_eq!(item.main_filename(), "Show - S01E01");
    }
}
