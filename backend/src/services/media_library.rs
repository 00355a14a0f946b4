//! Browsing and manual actions on files already in the media library

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;
use walkdir::WalkDir;

use super::file_utils::sanitize_for_filename;
use super::mover::{MediaLibraryMover, to_media_item};
use crate::db::MediaItem;

/// Total size of the files under one top-level library entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaFolderSummary {
    pub name: String,
    pub size: u64,
}

pub struct MediaLibraryService {
    library_root: PathBuf,
    mover: Arc<MediaLibraryMover>,
}

impl MediaLibraryService {
    pub fn new(library_root: impl Into<PathBuf>, mover: Arc<MediaLibraryMover>) -> Self {
        Self {
            library_root: library_root.into(),
            mover,
        }
    }

    /// Every file and directory of the library, sorted by path
    pub fn list_all(&self) -> Vec<MediaItem> {
        let mut items: Vec<MediaItem> = WalkDir::new(&self.library_root)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| to_media_item(&self.library_root, e.path()))
            .collect();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        items
    }

    /// Library entry at a library-relative path, if it exists
    pub fn find(&self, relative_path: &str) -> Result<Option<MediaItem>> {
        let path = self.resolve(relative_path)?;
        if path == self.library_root || !path.exists() {
            return Ok(None);
        }
        Ok(Some(to_media_item(&self.library_root, &path)))
    }

    /// File sizes summed per top-level entry, sorted by name
    pub fn root_folder_distribution(&self) -> Vec<MediaFolderSummary> {
        let mut sizes: BTreeMap<String, u64> = BTreeMap::new();
        for item in self.list_all() {
            let Some(size) = item.size else {
                continue;
            };
            let root = item.path.split('/').next().unwrap_or_default().to_string();
            *sizes.entry(root).or_default() += size;
        }
        sizes
            .into_iter()
            .map(|(name, size)| MediaFolderSummary { name, size })
            .collect()
    }

    /// Give a library entry a new name in the same directory. `None` when
    /// the entry does not exist; an error when the name is unusable or taken.
    pub async fn rename(&self, relative_path: &str, new_name: &str) -> Result<Option<MediaItem>> {
        let path = self.resolve(relative_path)?;
        if path == self.library_root {
            bail!("The media library root cannot be renamed");
        }
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let name = sanitize_for_filename(new_name);
        if name.is_empty() || name != new_name.trim() || name == "." || name == ".." {
            bail!("'{}' is not a valid name", new_name);
        }
        let dest = path.with_file_name(&name);
        if dest == path {
            return Ok(Some(to_media_item(&self.library_root, &path)));
        }
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            bail!("'{}' already exists", name);
        }

        tokio::fs::rename(&path, &dest)
            .await
            .with_context(|| format!("Failed to rename {}", path.display()))?;
        info!(from = %path.display(), to = %dest.display(), "Library entry renamed");
        Ok(Some(to_media_item(&self.library_root, &dest)))
    }

    /// Delete a library file or directory tree. False when nothing was there.
    pub async fn delete(&self, relative_path: &str) -> Result<bool> {
        let path = self.resolve(relative_path)?;
        if path == self.library_root {
            bail!("The media library root cannot be deleted");
        }

        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("Failed to inspect {}", path.display())),
        };

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.with_context(|| format!("Failed to delete {}", path.display()))?;

        info!(path = %path.display(), "Library entry deleted");
        Ok(true)
    }

    /// Rename a library video in place. `None` when the path is a directory.
    pub async fn auto_rename(&self, relative_path: &str) -> Result<Option<Vec<MediaItem>>> {
        let path = self.resolve(relative_path)?;
        if path.is_dir() {
            return Ok(None);
        }

        info!(path = %path.display(), "Renaming library file");
        let touched = self.mover.move_video_file(&path).await?;
        Ok(Some(self.mover.to_media_items(&touched)))
    }

    /// Fetch a subtitle for a library video. `None` for directories or when
    /// nothing was found.
    pub async fn get_subtitles(&self, relative_path: &str, lang: &str) -> Result<Option<MediaItem>> {
        let path = self.resolve(relative_path)?;
        if path.is_dir() {
            return Ok(None);
        }

        let subtitle = self.mover.filebot().get_subtitles(&path, lang, true).await;
        Ok(subtitle.map(|srt| to_media_item(&self.library_root, &srt)))
    }

    /// Library path for a library-relative path; anything reaching outside
    /// the library is rejected
    fn resolve(&self, relative_path: &str) -> Result<PathBuf> {
        let relative = Path::new(relative_path.trim_start_matches(['/', '\\']));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("Path '{}' is outside the media library", relative_path);
        }
        Ok(self.library_root.join(relative))
    }
}
