//! Archive sweep: hides finished downloads and frees their staging space

use anyhow::Result;
use tracing::{info, warn};

use crate::services::DownloadItemService;

/// Archive every item finished more than `threshold_days` ago. Returns how
/// many were archived; a failing item does not stop the sweep.
pub async fn archive_passed_items(service: &DownloadItemService, threshold_days: i64) -> Result<usize> {
    let items = service
        .repository()
        .get_passed_items_to_archive(threshold_days)
        .await?;
    info!(count = items.len(), "Items to archive");

    let mut archived = 0;
    for mut item in items {
        match service.archive_download(&mut item).await {
            Ok(()) => {
                archived += 1;
                info!(token = %item.token, "Archived");
            }
            Err(e) => warn!(token = %item.token, code = e.code(), error = %e, "Failed to archive"),
        }
    }

    Ok(archived)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use super::*;
    use crate::config::LibraryPaths;
    use crate::db::{Database, DownloadItem, DownloadItemRepository, DownloadState, DownloadType};
    use crate::services::{DownloadMethod, DownloadMethodError, DownloadMethods, EventBus};

    struct NoopMethod;

    #[async_trait]
    impl DownloadMethod for NoopMethod {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn can_handle_url(&self, _url: &str) -> bool {
            true
        }

        fn can_handle_type(&self, download_type: DownloadType) -> bool {
            download_type == DownloadType::Direct
        }

        async fn start(&self, _item: &mut DownloadItem) -> Result<(), DownloadMethodError> {
            Ok(())
        }

        async fn cancel(&self, _item: &DownloadItem) -> bool {
            true
        }

        async fn archive(&self, _item: &DownloadItem) -> bool {
            true
        }

        async fn downloaded_size(&self, _item: &DownloadItem) -> u64 {
            0
        }
    }

    async fn stored(repository: &dyn DownloadItemRepository, token: &str, state: DownloadState, age_days: i64) {
        let mut item = DownloadItem::new(format!("http://host/{token}"), None);
        item.token = token.to_string();
        repository.start(&mut item).await.unwrap();
        item.state = state;
        let at = Some(Utc::now() - Duration::days(age_days));
        match state {
            DownloadState::Canceled => item.canceled_at = at,
            _ => item.completed_at = at,
        }
        repository.update(&item).await.unwrap();
    }

    #[tokio::test]
    async fn test_archives_only_passed_items() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect_in_memory().await.unwrap();
        let repository: Arc<dyn DownloadItemRepository> = Arc::new(db.download_items());
        let service = DownloadItemService::new(
            repository.clone(),
            DownloadMethods::new(vec![Arc::new(NoopMethod)]),
            EventBus::default(),
            LibraryPaths::new(dir.path().join("downloads"), dir.path().join("media")),
        );

        stored(repository.as_ref(), "_ddlold", DownloadState::Completed, 5).await;
        stored(repository.as_ref(), "_ddlgone", DownloadState::Canceled, 4).await;
        stored(repository.as_ref(), "_ddlfresh", DownloadState::Completed, 1).await;
        stored(repository.as_ref(), "_ddlrunning", DownloadState::Downloading, 10).await;
        std::fs::create_dir_all(dir.path().join("downloads").join("_ddlold")).unwrap();

        let archived = tokio_test::assert_ok!(archive_passed_items(&service, 3).await);

        assert_eq!(archived, 2);
        assert!(!dir.path().join("downloads").join("_ddlold").exists());
        let mut left: Vec<String> = repository
            .find_all_unarchived()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.token)
            .collect();
        left.sort();
        assert_eq!(left, vec!["_ddlfresh", "_ddlrunning"]);
    }
}
