//! Retries subtitle downloads for recently completed videos that still have none

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info};

use crate::db::{DownloadItem, DownloadItemRepository};
use crate::services::FilebotService;

const RECENT_DAYS: i64 = 4;
const LANGUAGES: &[&str] = &["eng", "fra"];

/// Library-relative path of the largest moved file
fn main_video(item: &DownloadItem) -> Option<&str> {
    item.moved_files
        .iter()
        .filter(|f| f.size.is_some())
        .max_by_key(|f| f.size)
        .map(|f| f.path.as_str())
}

async fn has_subtitles(dir: &Path) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("srt")) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Returns how many videos subtitles were requested for
pub async fn fetch_missing_subtitles(
    repository: &dyn DownloadItemRepository,
    filebot: &FilebotService,
    media_library_path: &Path,
) -> Result<usize> {
    let items = repository.find_recent_completed(RECENT_DAYS).await?;
    info!(count = items.len(), "Recent items to check for subtitles");

    let mut requested = 0;
    for item in &items {
        let Some(rel_path) = main_video(item) else {
            continue;
        };
        let video = media_library_path.join(rel_path);
        let Some(dir) = video.parent() else {
            continue;
        };
        if !tokio::fs::try_exists(&video).await.unwrap_or(false) {
            debug!(video = %rel_path, "Video has been moved away, skipping");
            continue;
        }
        if has_subtitles(dir).await? {
            continue;
        }

        requested += 1;
        for lang in LANGUAGES {
            let found = filebot.get_subtitles(&video, lang, false).await;
            info!(video = %rel_path, lang, found = found.is_some(), "Subtitle fetch");
        }
    }

    Ok(requested)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::{Database, DownloadState, MediaItem};
    use crate::services::command::testing::ScriptedRunner;

    async fn completed(repository: &dyn DownloadItemRepository, token: &str, files: Vec<MediaItem>) {
        let mut item = DownloadItem::new(format!("http://host/{token}"), None);
        item.token = token.to_string();
        repository.start(&mut item).await.unwrap();
        item.state = DownloadState::Completed;
        item.completed_at = Some(chrono::Utc::now());
        item.moved_files = files;
        repository.update(&item).await.unwrap();
    }

    fn media(path: &str, size: Option<u64>) -> MediaItem {
        MediaItem {
            path: path.to_string(),
            size,
        }
    }

    #[tokio::test]
    async fn test_only_videos_without_subtitles_are_retried() {
        let library = tempfile::tempdir().unwrap();
        let db = Database::connect_in_memory().await.unwrap();
        let repository = db.download_items();

        let bare = library.path().join("Movies/Bare (2001)");
        let subbed = library.path().join("Movies/Subbed (2002)");
        std::fs::create_dir_all(&bare).unwrap();
        std::fs::create_dir_all(&subbed).unwrap();
        std::fs::write(bare.join("Bare (2001).mkv"), b"v").unwrap();
        std::fs::write(subbed.join("Subbed (2002).mkv"), b"v").unwrap();
        std::fs::write(subbed.join("Subbed (2002).en.srt"), b"s").unwrap();

        completed(
            &repository,
            "_ddlbare",
            vec![
                media("Movies/Bare (2001)", None),
                media("Movies/Bare (2001)/Bare (2001).mkv", Some(1000)),
                media("Others/sample.txt", Some(10)),
            ],
        )
        .await;
        completed(&repository, "_ddlsubbed", vec![media("Movies/Subbed (2002)/Subbed (2002).mkv", Some(1000))]).await;
        completed(&repository, "_ddlmoved", vec![media("Movies/Gone (2003)/Gone (2003).mkv", Some(1000))]).await;
        completed(&repository, "_ddlempty", vec![]).await;

        let runner = Arc::new(ScriptedRunner::new());
        let filebot = FilebotService::new("filebot", runner.clone());

        let requested = tokio_test::assert_ok!(fetch_missing_subtitles(&repository, &filebot, library.path()).await);

        assert_eq!(requested, 1);
        let recorded = runner.recorded();
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|r| r.args[1].ends_with("Bare (2001).mkv")));
        assert_eq!(recorded[0].args[3], "eng");
        assert_eq!(recorded[1].args[3], "fra");
    }
}
