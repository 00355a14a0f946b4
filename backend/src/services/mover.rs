//! Media library ingestion
//!
//! Walks a finished download's staging directory and files everything into
//! the media library:
//! - videos are renamed through FileBot, with a duration based fallback
//!   bucket, then get their sidecar and downloaded subtitles
//! - music goes flat into `Music`
//! - archives are extracted and the extracted content ingested recursively
//! - anything else goes flat into `Others`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use super::extractor::{ArchiveExtractor, ExtractionStatus, rar_files_in};
use super::ffmpeg::MediaProbe;
use super::file_utils::{
    MediaKind, list_files_recursive, move_or_replace, path_without_extension, subtitle_suffixes,
    to_two_letter_subtitle_path, with_suffix,
};
use super::filebot::{FilebotService, RenameRequest};
use crate::config::LibraryPaths;
use crate::db::{DownloadItem, MediaItem};

pub const MUSIC_DIR: &str = "Music";
pub const OTHERS_DIR: &str = "Others";
pub const TV_SHOWS_DIR: &str = "TV Shows";
pub const MOVIES_DIR: &str = "Movies";

/// Videos at least this long are movies when FileBot cannot identify them
const MOVIE_MIN_MINUTES: f64 = 105.0;

/// Subtitle languages fetched for every ingested video
const SUBTITLE_LANGUAGES: &[&str] = &["eng", "fra"];

/// Result of one ingestion run. `moved_files` holds whatever was filed before
/// an error stopped the walk.
#[derive(Debug, Default)]
pub struct IngestionReport {
    pub moved_files: Vec<MediaItem>,
    pub error: Option<anyhow::Error>,
}

/// Library bucket for a video FileBot could not identify
pub fn fallback_bucket(duration: Duration) -> &'static str {
    let minutes = duration.as_secs_f64() / 60.0;
    if minutes <= 0.0 {
        OTHERS_DIR
    } else if minutes < MOVIE_MIN_MINUTES {
        TV_SHOWS_DIR
    } else {
        MOVIES_DIR
    }
}

pub struct MediaLibraryMover {
    paths: LibraryPaths,
    filebot: Arc<FilebotService>,
    probe: Arc<dyn MediaProbe>,
    extractor: Arc<ArchiveExtractor>,
}

impl MediaLibraryMover {
    pub fn new(
        paths: LibraryPaths,
        filebot: Arc<FilebotService>,
        probe: Arc<dyn MediaProbe>,
        extractor: Arc<ArchiveExtractor>,
    ) -> Self {
        Self {
            paths,
            filebot,
            probe,
            extractor,
        }
    }

    pub fn filebot(&self) -> &FilebotService {
        &self.filebot
    }

    /// Ingest the staging directory of `item`
    pub async fn process_download_item(&self, item: &DownloadItem) -> IngestionReport {
        let staging = self.paths.staging_dir(&item.token);
        let mut touched = Vec::new();

        let error = self.process_dir(&staging, &mut touched).await.err();
        if let Some(e) = &error {
            warn!(token = %item.token, error = %e, "Ingestion stopped early");
        }

        IngestionReport {
            moved_files: self.to_media_items(&touched),
            error,
        }
    }

    /// Dispatch every file below `dir` by kind, appending every created
    /// directory and moved file to `touched`
    pub fn process_dir<'a>(
        &'a self,
        dir: &'a Path,
        touched: &'a mut Vec<PathBuf>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // videos first so their sidecar subtitles travel with them
            let (videos, rest): (Vec<_>, Vec<_>) = list_files_recursive(dir)
                .into_iter()
                .partition(|f| MediaKind::of(f) == MediaKind::Video);

            for file in videos.into_iter().chain(rest) {
                // sidecar subtitles are moved along with their video
                if !file.exists() {
                    debug!(file = %file.display(), "Already moved");
                    continue;
                }

                info!(file = %file.display(), "Handling file");
                match MediaKind::of(&file) {
                    MediaKind::Video => {
                        let created = self.move_video_file(&file).await?;
                        let Some(video) = created.last().cloned() else {
                            continue;
                        };
                        touched.extend(created);
                        touched.extend(self.move_matching_subtitles_of(&file, &video).await?);

                        for lang in SUBTITLE_LANGUAGES {
                            if let Some(srt) = self.filebot.get_subtitles(&video, lang, false).await {
                                touched.push(srt);
                            }
                        }
                    }
                    MediaKind::Audio => touched.push(self.move_music_file(&file).await?),
                    MediaKind::Archive => {
                        let outcome = self.extractor.handle_rar_file(&file).await?;
                        if outcome.status == ExtractionStatus::Extracted {
                            self.process_dir(&outcome.destination, touched).await?;
                        } else {
                            touched.extend(rar_files_in(&outcome.destination).await?);
                        }
                    }
                    MediaKind::Other => touched.push(self.move_unknown_file(&file).await?),
                }
            }
            Ok(())
        })
    }

    /// Rename and move a video into the library.
    ///
    /// Returns the directories created for it, deepest first, followed by the
    /// video's new path.
    pub async fn move_video_file(&self, src: &Path) -> Result<Vec<PathBuf>> {
        let library = &self.paths.media_library_path;
        let rename = self
            .filebot
            .rename(&RenameRequest::new(src, library))
            .await;

        let dest = match rename.dest_path {
            Some(dest) if rename.succeeded => dest,
            _ => {
                info!(video = %src.display(), reason = %rename.reason, "Rename failed, using duration fallback");
                let duration = self.probe.duration(src).await;
                let bucket = fallback_bucket(duration);
                debug!(video = %src.display(), bucket, "Fallback library folder");
                library
                    .join(bucket)
                    .join(src.file_name().context("Video path has no file name")?)
            }
        };

        let mut entries = Vec::new();
        if let Some(parent) = dest.parent() {
            let mut dir = Some(parent);
            while let Some(d) = dir.filter(|d| !d.exists()) {
                entries.push(d.to_path_buf());
                dir = d.parent();
            }
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // FileBot already moved the file unless it reported an existing copy
        if src.exists() {
            move_or_replace(src, &dest).await?;
        }

        entries.push(dest);
        Ok(entries)
    }

    /// Move sidecar subtitles of the video at `src` next to `dest`, with
    /// three-letter language codes normalized to two letters
    pub async fn move_matching_subtitles_of(&self, src: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        let src_base = path_without_extension(src);
        let dest_base = path_without_extension(dest);
        let mut moved = Vec::new();

        for suffix in subtitle_suffixes() {
            let subtitle = with_suffix(&src_base, &suffix);
            if !subtitle.is_file() {
                continue;
            }

            let target = with_suffix(&dest_base, &suffix);
            let target = to_two_letter_subtitle_path(&target).unwrap_or(target);
            move_or_replace(&subtitle, &target).await?;
            debug!(from = %subtitle.display(), to = %target.display(), "Moved subtitle");

            if !moved.contains(&target) {
                moved.push(target);
            }
        }

        Ok(moved)
    }

    pub async fn move_music_file(&self, src: &Path) -> Result<PathBuf> {
        let dest = self.flat_destination(MUSIC_DIR, src)?;
        move_or_replace(src, &dest).await?;
        info!(from = %src.display(), to = %dest.display(), "Moved music file");
        Ok(dest)
    }

    pub async fn move_unknown_file(&self, src: &Path) -> Result<PathBuf> {
        let dest = self.flat_destination(OTHERS_DIR, src)?;
        move_or_replace(src, &dest).await?;
        debug!(from = %src.display(), to = %dest.display(), "Moved file");
        Ok(dest)
    }

    fn flat_destination(&self, folder: &str, src: &Path) -> Result<PathBuf> {
        let name = src.file_name().context("Path has no file name")?;
        Ok(self.paths.media_library_path.join(folder).join(name))
    }

    /// Project touched paths to library-relative entries sorted by path
    pub fn to_media_items(&self, touched: &[PathBuf]) -> Vec<MediaItem> {
        let mut items: Vec<MediaItem> = touched
            .iter()
            .map(|p| to_media_item(&self.paths.media_library_path, p))
            .collect();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        items.dedup_by(|a, b| a.path == b.path);
        items
    }
}

/// Library-relative view of `path`; directories and missing files have no size
pub fn to_media_item(library: &Path, path: &Path) -> MediaItem {
    let relative = path.strip_prefix(library).unwrap_or(path);
    let path_str = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let size = std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len());

    MediaItem { path: path_str, size }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::services::command::testing::ScriptedRunner;
    use crate::services::command::{CommandError, CommandOutput, CommandRequest};
    use crate::services::extractor::testing::{TextArchiveTool, write_archive};

    /// Durations by file name, zero for anything unknown
    #[derive(Default)]
    struct FixedProbe(Mutex<HashMap<String, u64>>);

    impl FixedProbe {
        fn with(name: &str, minutes: u64) -> Self {
            let probe = Self::default();
            probe.0.lock().insert(name.to_string(), minutes);
            probe
        }
    }

    #[async_trait]
    impl MediaProbe for FixedProbe {
        async fn duration(&self, path: &Path) -> Duration {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            let minutes = self.0.lock().get(&name).copied().unwrap_or(0);
            Duration::from_secs(minutes * 60)
        }
    }

    /// FileBot that never identifies anything
    fn unidentified(_: &CommandRequest) -> Result<CommandOutput, CommandError> {
        Ok(CommandOutput {
            exit_code: 1,
            stdout: "Failed to identify or process any files".to_string(),
            stderr: String::new(),
        })
    }

    /// FileBot that files every video under `Movies/<stem>/`
    fn identifies_movies(request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        if request.args[0] != "-rename" {
            return Ok(CommandOutput::default());
        }
        let src = PathBuf::from(&request.args[1]);
        let root = PathBuf::from(&request.args[3]).parent().unwrap().to_path_buf();
        let stem = src.file_stem().unwrap().to_string_lossy().into_owned();
        let dest = root
            .join(MOVIES_DIR)
            .join(&stem)
            .join(src.file_name().unwrap());
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::rename(&src, &dest).unwrap();
        Ok(CommandOutput {
            exit_code: 0,
            stdout: format!("[MOVE] from [{}] to [{}]", src.display(), dest.display()),
            stderr: String::new(),
        })
    }

    struct Fixture {
        downloads: tempfile::TempDir,
        library: tempfile::TempDir,
        mover: MediaLibraryMover,
    }

    fn fixture<F>(filebot: F, probe: FixedProbe) -> Fixture
    where
        F: Fn(&CommandRequest) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    {
        let downloads = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let paths = LibraryPaths::new(downloads.path(), library.path());
        let mover = MediaLibraryMover::new(
            paths,
            Arc::new(FilebotService::new("filebot", Arc::new(ScriptedRunner::with_handler(filebot)))),
            Arc::new(probe),
            Arc::new(ArchiveExtractor::new(library.path(), Arc::new(TextArchiveTool))),
        );
        Fixture { downloads, library, mover }
    }

    fn touch(path: &Path, size: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![b'x'; size]).unwrap();
    }

    #[test]
    fn test_fallback_bucket() {
        assert_eq!(fallback_bucket(Duration::ZERO), OTHERS_DIR);
        assert_eq!(fallback_bucket(Duration::from_secs(60)), TV_SHOWS_DIR);
        assert_eq!(fallback_bucket(Duration::from_secs(104 * 60)), TV_SHOWS_DIR);
        assert_eq!(fallback_bucket(Duration::from_secs(105 * 60)), MOVIES_DIR);
        assert_eq!(fallback_bucket(Duration::from_secs(180 * 60)), MOVIES_DIR);
    }

    #[tokio::test]
    async fn test_video_fallback_by_duration() {
        for (minutes, bucket) in [(0, OTHERS_DIR), (42, TV_SHOWS_DIR), (120, MOVIES_DIR)] {
            let f = fixture(unidentified, FixedProbe::with("video.mkv", minutes));
            let src = f.downloads.path().join("_ddl1").join("video.mkv");
            touch(&src, 100);

            let entries = f.mover.move_video_file(&src).await.unwrap();

            let expected = f.library.path().join(bucket).join("video.mkv");
            assert_eq!(entries, vec![f.library.path().join(bucket), expected.clone()]);
            assert!(expected.exists());
            assert!(!src.exists());
        }
    }

    #[tokio::test]
    async fn test_video_rename_tracks_created_directories() {
        let f = fixture(unidentified, FixedProbe::default());
        let src = f.downloads.path().join("_ddl1").join("a.mkv");
        touch(&src, 10);
        std::fs::create_dir_all(f.library.path()).unwrap();

        // nothing of Others exists yet: Others is the only created directory
        let entries = f.mover.move_video_file(&src).await.unwrap();
        assert_eq!(entries.len(), 2);

        // FileBot creating the folders itself leaves only the file
        let f = fixture(identifies_movies, FixedProbe::default());
        let src = f.downloads.path().join("_ddl1").join("b.mkv");
        touch(&src, 10);
        let entries = f.mover.move_video_file(&src).await.unwrap();
        assert_eq!(entries, vec![f.library.path().join("Movies").join("b").join("b.mkv")]);
    }

    #[tokio::test]
    async fn test_matching_subtitles_are_normalized() {
        let f = fixture(unidentified, FixedProbe::default());
        let src_dir = f.downloads.path().join("_ddl1");
        let src = src_dir.join("the.big.bang.theory.s10.e01.mp4");
        for suffix in [".srt", ".en.srt", ".eng.srt", ".fra.srt", ".fr.srt"] {
            touch(&src_dir.join(format!("the.big.bang.theory.s10.e01{}", suffix)), 3);
        }
        let dest = f.library.path().join("TV Shows").join("Show - S10E01.mp4");

        let moved = f.mover.move_matching_subtitles_of(&src, &dest).await.unwrap();

        let dest_dir = dest.parent().unwrap();
        let mut names: Vec<String> = moved
            .iter()
            .map(|p| p.strip_prefix(dest_dir).unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Show - S10E01.en.srt", "Show - S10E01.fr.srt", "Show - S10E01.srt"]);
        for path in &moved {
            assert!(path.exists());
        }
        assert_eq!(std::fs::read_dir(&src_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_less_common_languages_travel_with_video() {
        let f = fixture(unidentified, FixedProbe::default());
        let src_dir = f.downloads.path().join("_ddl2");
        let src = src_dir.join("film.mkv");
        for suffix in [".pob.srt", ".cym.srt", ".nob.srt"] {
            touch(&src_dir.join(format!("film{}", suffix)), 3);
        }
        let dest = f.library.path().join("Movies").join("Film (2001).mkv");

        let moved = f.mover.move_matching_subtitles_of(&src, &dest).await.unwrap();

        let dest_dir = dest.parent().unwrap();
        let mut names: Vec<String> = moved
            .iter()
            .map(|p| p.strip_prefix(dest_dir).unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Film (2001).cy.srt", "Film (2001).nb.srt", "Film (2001).pb.srt"]);
        assert_eq!(std::fs::read_dir(&src_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_process_download_item_dispatches_by_kind() {
        let f = fixture(identifies_movies, FixedProbe::default());
        let mut item = DownloadItem::new("http://host/x", None);
        item.token = "_ddl1".to_string();
        let staging = f.downloads.path().join("_ddl1");

        touch(&staging.join("Film").join("Film.mkv"), 50);
        touch(&staging.join("Film").join("Film.en.srt"), 5);
        touch(&staging.join("song.flac"), 20);
        touch(&staging.join("readme.nfo"), 1);
        write_archive(
            &staging.join("bundle.rar"),
            1,
            &[("music.mp3", 10), ("pinguin.gif", 5), ("subfolder/file.mkv", 30)],
        );

        let report = f.mover.process_download_item(&item).await;

        assert!(report.error.is_none());
        let paths: Vec<&str> = report.moved_files.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "Movies/Film/Film.en.srt",
                "Movies/Film/Film.mkv",
                "Movies/file/file.mkv",
                "Music/music.mp3",
                "Music/song.flac",
                "Others/pinguin.gif",
                "Others/readme.nfo",
            ]
        );
        let film = report
            .moved_files
            .iter()
            .find(|m| m.path == "Movies/Film/Film.mkv")
            .unwrap();
        assert_eq!(film.size, Some(50));
        assert!(list_files_recursive(&staging).is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_archive_reports_parked_parts() {
        let f = fixture(unidentified, FixedProbe::default());
        let mut item = DownloadItem::new("http://host/x", None);
        item.token = "_ddl2".to_string();
        let staging = f.downloads.path().join("_ddl2");
        write_archive(&staging.join("album.part1.rar"), 3, &[("album.flac", 10)]);
        write_archive(&staging.join("album.part2.rar"), 3, &[("album.flac", 10)]);

        let report = f.mover.process_download_item(&item).await;

        assert!(report.error.is_none());
        let paths: Vec<&str> = report.moved_files.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["Others/album/album.part1.rar", "Others/album/album.part2.rar"]);
    }

    #[tokio::test]
    async fn test_missing_staging_directory_is_empty() {
        let f = fixture(unidentified, FixedProbe::default());
        let mut item = DownloadItem::new("http://host/x", None);
        item.token = "_ddl404".to_string();

        let report = f.mover.process_download_item(&item).await;
        assert!(report.error.is_none());
        assert!(report.moved_files.is_empty());
    }

    #[test]
    fn test_to_media_item() {
        let library = tempfile::tempdir().unwrap();
        let file = library.path().join("Music").join("a.mp3");
        touch(&file, 7);

        assert_eq!(
            to_media_item(library.path(), &file),
            MediaItem { path: "Music/a.mp3".to_string(), size: Some(7) }
        );
        assert_eq!(
            to_media_item(library.path(), file.parent().unwrap()),
            MediaItem { path: "Music".to_string(), size: None }
        );
    }
}
