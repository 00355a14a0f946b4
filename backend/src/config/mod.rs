//! Application configuration management

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path
    pub database_path: String,

    /// Where downloads land (one staging directory per item token)
    /// and where the media library lives
    pub paths: LibraryPaths,

    /// File hosters the direct download method knows about
    pub direct_download: DirectDownloadSettings,

    /// transmission-remote credentials and hooks
    pub transmission: TransmissionSettings,

    /// Locations of the external command line tools
    pub tools: ToolPaths,

    /// Timeout applied to magnet metadata resolution
    pub magnet_metadata_timeout: Duration,

    /// Canceled/completed items older than this are archived
    pub archive_threshold_days: i64,

    /// Emit JSON logs instead of human-readable ones
    pub log_json: bool,
}

/// Filesystem roots shared by the download and library services
#[derive(Debug, Clone)]
pub struct LibraryPaths {
    pub downloads_path: PathBuf,
    pub media_library_path: PathBuf,
}

impl LibraryPaths {
    pub fn new(downloads_path: impl Into<PathBuf>, media_library_path: impl Into<PathBuf>) -> Self {
        Self {
            downloads_path: downloads_path.into(),
            media_library_path: media_library_path.into(),
        }
    }

    /// Staging directory of a download item
    pub fn staging_dir(&self, token: &str) -> PathBuf {
        self.downloads_path.join(token)
    }
}

/// Static description of a direct-download file hoster
#[derive(Debug, Clone, Deserialize)]
pub struct FileHosterInfo {
    pub name: String,

    /// Regex a file URL must match to be handled by this hoster
    pub url_pattern: String,

    /// Login endpoint, when the hoster requires a session
    #[serde(default)]
    pub login_url: Option<String>,

    /// Form payload posted to `login_url`
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

impl FileHosterInfo {
    pub fn can_handle(&self, url: &str) -> bool {
        Regex::new(&self.url_pattern)
            .map(|re| re.is_match(url))
            .unwrap_or(false)
    }

    pub fn requires_authentication(&self) -> bool {
        self.login_url.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectDownloadSettings {
    #[serde(default)]
    pub filehosters: Vec<FileHosterInfo>,
}

impl DirectDownloadSettings {
    /// Read the hoster list from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file hosters from {}", path.display()))?;
        let settings: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid file hosters file {}", path.display()))?;

        for hoster in &settings.filehosters {
            Regex::new(&hoster.url_pattern).with_context(|| {
                format!("Invalid url_pattern for file hoster {}", hoster.name)
            })?;
        }

        Ok(settings)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransmissionSettings {
    pub username: String,
    pub password: String,

    /// Script transmission runs when a torrent finishes
    pub torrent_done_script: String,
}

#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub filebot: String,
    pub ffprobe: String,
    pub unrar: String,
    pub transmission_remote: String,
    pub aria2c: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            filebot: "filebot".to_string(),
            ffprobe: "ffprobe".to_string(),
            unrar: "unrar".to_string(),
            transmission_remote: "transmission-remote".to_string(),
            aria2c: "aria2c".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = ToolPaths::default();

        let direct_download = match env::var("FILEHOSTERS_PATH") {
            Ok(path) => DirectDownloadSettings::from_yaml_file(Path::new(&path))?,
            Err(_) => DirectDownloadSettings::default(),
        };

        Ok(Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./data/mediaflow.db".to_string()),

            paths: LibraryPaths::new(
                env::var("DOWNLOADS_PATH").unwrap_or_else(|_| "./data/downloads".to_string()),
                env::var("MEDIA_LIBRARY_PATH").unwrap_or_else(|_| "./data/media".to_string()),
            ),

            direct_download,

            transmission: TransmissionSettings {
                username: env::var("TRANSMISSION_USERNAME").unwrap_or_default(),
                password: env::var("TRANSMISSION_PASSWORD").unwrap_or_default(),
                torrent_done_script: env::var("TORRENT_DONE_SCRIPT")
                    .unwrap_or_else(|_| "./torrent-done.sh".to_string()),
            },

            tools: ToolPaths {
                filebot: env::var("FILEBOT_PATH").unwrap_or(defaults.filebot),
                ffprobe: env::var("FFPROBE_PATH").unwrap_or(defaults.ffprobe),
                unrar: env::var("UNRAR_PATH").unwrap_or(defaults.unrar),
                transmission_remote: env::var("TRANSMISSION_REMOTE_PATH")
                    .unwrap_or(defaults.transmission_remote),
                aria2c: env::var("ARIA2C_PATH").unwrap_or(defaults.aria2c),
            },

            magnet_metadata_timeout: Duration::from_secs(
                env::var("MAGNET_METADATA_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .context("Invalid MAGNET_METADATA_TIMEOUT_SECS")?,
            ),

            archive_threshold_days: env::var("ARCHIVE_THRESHOLD_DAYS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("Invalid ARCHIVE_THRESHOLD_DAYS")?,

            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}
