//! Archive extraction service
//!
//! Handles `.rar` files met during library ingestion. A single-part archive is
//! extracted next to itself. Parts of a multi-part archive are gathered in a
//! fixed holding directory under the library (`Others/<archive name>`) so that
//! parts coming from different downloads meet in one place; extraction starts
//! once the first volume reports the set complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use super::command::{CommandRequest, CommandRunner};
use super::file_utils::move_or_replace;

/// Library folder holding multi-part archives while they are incomplete
pub const ARCHIVES_HOLDING_DIR: &str = "Others";

static PART_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?P<base>.+)\.part(?P<num>\d+)\.rar$").expect("valid regex"));

/// A volume of a multi-part archive, identified by its `.partN.rar` name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePart {
    pub base_name: String,
    pub number: u32,
}

impl ArchivePart {
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = PART_PATTERN.captures(file_name)?;
        Some(Self {
            base_name: caps["base"].to_string(),
            number: caps["num"].parse().ok()?,
        })
    }

    pub fn is_first_volume(&self) -> bool {
        self.number == 1
    }
}

/// Archive backend
#[async_trait]
pub trait ArchiveTool: Send + Sync {
    /// Whether every volume of the set starting at `first_volume` is present and readable
    async fn is_complete(&self, first_volume: &Path) -> bool;

    /// Extract all entries with their relative paths, overwriting existing files
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<()>;
}

/// `unrar` command line backend
pub struct UnrarCli {
    unrar_path: String,
    runner: Arc<dyn CommandRunner>,
}

impl UnrarCli {
    pub fn new(unrar_path: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            unrar_path: unrar_path.into(),
            runner,
        }
    }
}

#[async_trait]
impl ArchiveTool for UnrarCli {
    async fn is_complete(&self, first_volume: &Path) -> bool {
        let request = CommandRequest::new(&self.unrar_path)
            .args(["t", "-y", "-idq"])
            .path_arg(first_volume);

        match self.runner.run(&request).await {
            Ok(output) => output.success(),
            Err(e) => {
                warn!(archive = %first_volume.display(), error = %e, "Failed to test archive");
                false
            }
        }
    }

    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        // unrar treats the destination as a directory only with a trailing separator
        let mut dest = dest_dir.as_os_str().to_os_string();
        dest.push(std::path::MAIN_SEPARATOR_STR);

        let request = CommandRequest::new(&self.unrar_path)
            .arg("x") // Extract with full paths
            .arg("-o+") // Overwrite existing files
            .arg("-y") // Assume yes on all queries
            .path_arg(archive)
            .arg(dest.to_string_lossy().into_owned());

        let output = self
            .runner
            .run(&request)
            .await
            .context("Failed to run unrar. Is unrar installed?")?;

        if !output.success() {
            bail!("unrar failed ({}): {}", output.exit_code, output.stderr.trim());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStatus {
    Extracted,
    /// Multi-part set not complete yet; the part is parked in the destination
    Incomplete,
    Failed,
}

/// Where the archive content went, or will go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOutcome {
    pub status: ExtractionStatus,
    pub destination: PathBuf,
}

pub struct ArchiveExtractor {
    media_library_path: PathBuf,
    tool: Arc<dyn ArchiveTool>,
}

impl ArchiveExtractor {
    pub fn new(media_library_path: impl Into<PathBuf>, tool: Arc<dyn ArchiveTool>) -> Self {
        Self {
            media_library_path: media_library_path.into(),
            tool,
        }
    }

    /// Extract a single-part archive, or park a part of a multi-part archive
    /// and extract the set if it became complete.
    ///
    /// Errors are reserved for failing to prepare the destination; extraction
    /// failures are reported through [ExtractionStatus::Failed].
    pub async fn handle_rar_file(&self, rar_path: &Path) -> Result<ExtractionOutcome> {
        let file_name = rar_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Archive path has no file name")?;
        let part = ArchivePart::parse(&file_name);

        info!(
            archive = %file_name,
            multipart = part.is_some(),
            "Handling archive"
        );

        let destination = self.extraction_directory(rar_path, part.as_ref());
        tokio::fs::create_dir_all(&destination)
            .await
            .with_context(|| format!("Failed to create {}", destination.display()))?;

        debug!(destination = %destination.display(), "Archive extraction directory");

        if part.is_none() {
            let status = self.extract(rar_path, &destination).await;
            return Ok(ExtractionOutcome { status, destination });
        }

        let parked = destination.join(&file_name);
        move_or_replace(rar_path, &parked).await?;
        debug!(part = %file_name, destination = %destination.display(), "Moved archive part");

        match self.find_first_volume(&destination).await? {
            Some(first_volume) => {
                info!(archive = %first_volume.display(), "Archive complete, starting extraction");
                let status = self.extract(&first_volume, &destination).await;
                Ok(ExtractionOutcome { status, destination })
            }
            None => {
                info!(destination = %destination.display(), "Archive incomplete, waiting for more parts");
                Ok(ExtractionOutcome {
                    status: ExtractionStatus::Incomplete,
                    destination,
                })
            }
        }
    }

    /// Sibling directory named after the archive for single-part archives,
    /// `<library>/Others/<name>` for multi-part ones
    fn extraction_directory(&self, rar_path: &Path, part: Option<&ArchivePart>) -> PathBuf {
        match part {
            Some(part) => self
                .media_library_path
                .join(ARCHIVES_HOLDING_DIR)
                .join(&part.base_name),
            None => {
                let stem = rar_path.file_stem().unwrap_or_default();
                rar_path
                    .parent()
                    .map(|parent| parent.join(stem))
                    .unwrap_or_else(|| PathBuf::from(stem))
            }
        }
    }

    async fn find_first_volume(&self, dir: &Path) -> Result<Option<PathBuf>> {
        for candidate in rar_files_in(dir).await? {
            let is_first = candidate
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(ArchivePart::parse)
                .is_some_and(|p| p.is_first_volume());

            if is_first && self.tool.is_complete(&candidate).await {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn extract(&self, archive: &Path, destination: &Path) -> ExtractionStatus {
        let started = Instant::now();
        info!(archive = %archive.display(), "Archive extraction started");

        if let Err(e) = self.tool.extract(archive, destination).await {
            error!(archive = %archive.display(), error = %e, "Archive extraction failed");
            return ExtractionStatus::Failed;
        }

        info!(
            archive = %archive.display(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Archive extraction succeeded"
        );

        // single-part sources live outside the destination; this only clears parts
        match rar_files_in(destination).await {
            Ok(parts) => {
                for part in parts {
                    if let Err(e) = tokio::fs::remove_file(&part).await {
                        warn!(part = %part.display(), error = %e, "Failed to delete archive part");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list archive parts"),
        }

        if archive.exists() {
            if let Err(e) = tokio::fs::remove_file(archive).await {
                warn!(archive = %archive.display(), error = %e, "Failed to delete archive");
            }
        }

        ExtractionStatus::Extracted
    }
}

/// `.rar` files directly inside `dir`, sorted by name
pub async fn rar_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_rar = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("rar"));
        if is_rar && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
