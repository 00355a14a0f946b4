//! Post-download processing: files a downloaded item into the media library

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::events::{DownloadEvent, EventListener};
use super::mover::MediaLibraryMover;
use crate::db::{DownloadItem, DownloadItemRepository, DownloadState};

/// A fast transfer can finish before its item is persisted
const LOOKUP_ATTEMPTS: u32 = 10;
const LOOKUP_DELAY: Duration = Duration::from_millis(100);

pub struct ProcessDownloadItem {
    repository: Arc<dyn DownloadItemRepository>,
    mover: Arc<MediaLibraryMover>,
}

impl ProcessDownloadItem {
    pub fn new(repository: Arc<dyn DownloadItemRepository>, mover: Arc<MediaLibraryMover>) -> Self {
        Self { repository, mover }
    }

    async fn find_item(&self, id: Uuid) -> Result<Option<DownloadItem>> {
        for attempt in 1..=LOOKUP_ATTEMPTS {
            if let Some(item) = self.repository.find_by_id(id).await? {
                return Ok(Some(item));
            }
            if attempt < LOOKUP_ATTEMPTS {
                tokio::time::sleep(LOOKUP_DELAY).await;
            }
        }
        Ok(None)
    }

    /// Move a downloading item through Processing to Completed. Ingestion
    /// errors are logged and the item completes with whatever was filed
    /// before them. Items in any other state are left untouched.
    pub async fn process(&self, id: Uuid) -> Result<()> {
        let Some(mut item) = self.find_item(id).await? else {
            warn!(%id, "Downloaded item not found");
            return Ok(());
        };
        if item.state != DownloadState::Downloading {
            info!(token = %item.token, state = %item.state, "Item is no longer downloading, skipping");
            return Ok(());
        }

        item.downloaded_at = Some(Utc::now());
        item.state = DownloadState::Processing;
        self.repository.update(&item).await?;
        info!(token = %item.token, "Processing downloaded item");

        let report = self.mover.process_download_item(&item).await;
        if let Some(e) = &report.error {
            error!(token = %item.token, error = %e, moved = report.moved_files.len(), "Ingestion failed");
        }

        // re-read: the item may have changed while the mover ran
        let mut item = self.repository.find_by_id(id).await?.unwrap_or(item);
        if item.state != DownloadState::Processing {
            warn!(token = %item.token, state = %item.state, "Item changed state during ingestion");
            return Ok(());
        }
        item.moved_files = report.moved_files;
        item.completed_at = Some(Utc::now());
        item.state = DownloadState::Completed;
        self.repository.update(&item).await?;

        info!(
            token = %item.token,
            files = item.moved_files.len(),
            main_file = %item.main_filename(),
            "Download item completed"
        );
        Ok(())
    }
}

#[async_trait]
impl EventListener for ProcessDownloadItem {
    fn name(&self) -> &'static str {
        "process_download_item"
    }

    async fn handle(&self, event: DownloadEvent) -> Result<()> {
        match event {
            DownloadEvent::ItemDownloaded(id) => self.process(id).await,
            DownloadEvent::ItemStarted(_) => Ok(()),
        }
    }
}
