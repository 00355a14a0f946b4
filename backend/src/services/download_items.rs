//! Download item orchestration
//!
//! Routes items to their download method, persists every state transition
//! and publishes lifecycle events. Download methods only report outcomes;
//! this service is the only writer of download items.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::download::{DownloadMethod, DownloadMethodError, DownloadMethods};
use super::events::{DownloadEvent, EventBus};
use crate::config::LibraryPaths;
use crate::db::{DownloadItem, DownloadItemRepository, DownloadState};

#[derive(Debug, Error)]
pub enum DownloadItemActionError {
    #[error("No download method handles url {0}")]
    UrlNotHandled(String),

    #[error("{0}")]
    DownloadabilityFailure(String),

    #[error("{0}")]
    StartDownloadFailure(String),

    #[error("Url {0} is already being downloaded")]
    DuplicateDownload(String),

    #[error("Download item not found")]
    ItemNotFound,

    #[error("Operation not permitted on a {0} item")]
    OperationNotPermitted(DownloadState),

    #[error("Persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl DownloadItemActionError {
    /// Stable identifier for callers mapping errors to responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::UrlNotHandled(_) => "url_not_handled",
            Self::DownloadabilityFailure(_) => "downloadability_failure",
            Self::StartDownloadFailure(_) => "start_download_failure",
            Self::DuplicateDownload(_) => "duplicate_download",
            Self::ItemNotFound => "item_not_found",
            Self::OperationNotPermitted(_) => "operation_not_permitted",
            Self::Persistence(_) => "persistence",
        }
    }
}

impl From<DownloadMethodError> for DownloadItemActionError {
    fn from(e: DownloadMethodError) -> Self {
        match e {
            DownloadMethodError::NotDownloadable(msg) => Self::DownloadabilityFailure(msg),
            DownloadMethodError::StartFailed(msg) => Self::StartDownloadFailure(msg),
        }
    }
}

pub type ActionResult<T> = Result<T, DownloadItemActionError>;

pub struct DownloadItemService {
    repository: Arc<dyn DownloadItemRepository>,
    methods: DownloadMethods,
    events: EventBus,
    paths: LibraryPaths,
}

impl DownloadItemService {
    pub fn new(
        repository: Arc<dyn DownloadItemRepository>,
        methods: DownloadMethods,
        events: EventBus,
        paths: LibraryPaths,
    ) -> Self {
        Self {
            repository,
            methods,
            events,
            paths,
        }
    }

    pub fn repository(&self) -> &Arc<dyn DownloadItemRepository> {
        &self.repository
    }

    /// Whether some download method would take `url`
    pub fn validate_url(&self, url: &str) -> bool {
        self.methods.for_url(url).is_some()
    }

    fn method_for(&self, item: &DownloadItem) -> ActionResult<Arc<dyn DownloadMethod>> {
        self.methods
            .for_type(item.download_type)
            .ok_or_else(|| DownloadItemActionError::UrlNotHandled(item.url.clone()))
    }

    /// Start `item`. Nothing is persisted unless the transfer is running.
    pub async fn start_download(&self, item: &mut DownloadItem) -> ActionResult<()> {
        if self.repository.is_url_downloading(&item.url).await? {
            return Err(DownloadItemActionError::DuplicateDownload(item.url.clone()));
        }

        let method = self
            .methods
            .for_url(&item.url)
            .ok_or_else(|| DownloadItemActionError::UrlNotHandled(item.url.clone()))?;

        debug!(url = %item.url, method = method.name(), "Starting download");
        if let Err(e) = method.start(item).await {
            warn!(url = %item.url, method = method.name(), error = %e, "Download could not start");
            return Err(e.into());
        }

        item.downloaded_size = 0;
        item.downloaded_at = None;
        item.completed_at = None;
        item.canceled_at = None;
        item.moved_files.clear();
        self.repository.start(item).await?;

        info!(token = %item.token, name = %item.name, method = method.name(), "Download started");
        self.events.publish(DownloadEvent::ItemStarted(item.clone()));
        Ok(())
    }

    /// Cancel a running download. The item ends canceled even if the method
    /// had nothing left to cancel.
    pub async fn cancel_download(&self, item: &mut DownloadItem) -> ActionResult<()> {
        if item.state != DownloadState::Downloading {
            return Err(DownloadItemActionError::OperationNotPermitted(item.state));
        }

        let method = self.method_for(item)?;
        let canceled = method.cancel(item).await;
        self.repository.cancel(item).await?;

        info!(token = %item.token, applied = canceled, "Download canceled");
        Ok(())
    }

    /// Archive a finished item and delete its staging directory
    pub async fn archive_download(&self, item: &mut DownloadItem) -> ActionResult<()> {
        if item.state.is_pending() {
            return Err(DownloadItemActionError::OperationNotPermitted(item.state));
        }

        let method = self.method_for(item)?;
        if !method.archive(item).await {
            warn!(token = %item.token, method = method.name(), "Download method cleanup failed");
        }
        self.repository.archive(item).await?;

        let staging = self.paths.staging_dir(&item.token);
        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&staging).await.map_err(|e| {
                anyhow::Error::new(e).context(format!("Failed to delete {}", staging.display()))
            })?;
        }

        info!(token = %item.token, "Download archived");
        Ok(())
    }

    /// Overlay the transferred size onto `item`, without persisting it
    pub async fn compute_download_progress(&self, item: &mut DownloadItem) -> ActionResult<()> {
        let method = self.method_for(item)?;
        let size = method.downloaded_size(item).await;
        item.downloaded_size = i64::try_from(size).unwrap_or(i64::MAX);
        Ok(())
    }

    /// Unarchived items, with the progress of running ones
    pub async fn list_active(&self) -> ActionResult<Vec<DownloadItem>> {
        let mut items = self.repository.find_all_unarchived().await?;
        for item in items.iter_mut().filter(|i| i.state == DownloadState::Downloading) {
            self.compute_download_progress(item).await?;
        }
        Ok(items)
    }

    pub async fn find_by_token(&self, token: &str) -> ActionResult<DownloadItem> {
        self.repository
            .find_by_token(token)
            .await?
            .ok_or(DownloadItemActionError::ItemNotFound)
    }

    /// Handle the torrent daemon reporting the torrent with `hash` done.
    /// Only a downloading item can be marked; a repeated or late signal is
    /// refused.
    pub async fn mark_torrent_downloaded(&self, hash: &str) -> ActionResult<DownloadItem> {
        let item = self
            .repository
            .find_by_hash(hash)
            .await?
            .ok_or(DownloadItemActionError::ItemNotFound)?;
        if item.state != DownloadState::Downloading {
            return Err(DownloadItemActionError::OperationNotPermitted(item.state));
        }

        let method = self.method_for(&item)?;
        method.on_transfer_completed(&item).await;

        info!(token = %item.token, hash, "Torrent transfer completed");
        self.events.publish(DownloadEvent::ItemDownloaded(item.id));
        Ok(item)
    }
}
