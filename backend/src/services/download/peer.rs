//! Peer-to-peer download through an external torrent daemon

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, error, info, warn};

use super::daemon::{MagnetFetchError, MagnetFetcher, TorrentDaemon};
use super::{DownloadMethod, DownloadMethodError, new_token};
use crate::config::LibraryPaths;
use crate::db::{DownloadItem, DownloadType};
use crate::services::torrent_metadata::parse_torrent;

pub const BROKEN_MAGNET_LINK_MESSAGE: &str = "Broken magnet link";
pub const NO_PEERS_FOUND_MESSAGE: &str = "No peers found for this magnet link";
pub const TORRENT_FILE_NOT_FOUND_MESSAGE: &str = "Torrent file not found";
pub const TORRENT_FILE_CORRUPTED_MESSAGE: &str = "Torrent file is corrupted";
pub const TORRENT_DAEMON_ADD_FAILURE_MESSAGE: &str = "Torrent daemon failed to add the torrent";

/// Directory under the downloads root holding fetched torrent files
pub const TORRENTS_DIR: &str = ".torrents";

static TORRENT_DOWNLOAD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)/torrent/download/[0-9a-f]{40}/?$").expect("valid regex"));

/// Whether `url` designates a torrent: a magnet link, a `.torrent` file
/// (remote or local), or a known torrent download endpoint
pub fn is_torrent_url(url: &str) -> bool {
    let url = url.trim();
    if is_magnet(url) {
        return true;
    }

    let path = match url::Url::parse(url) {
        Ok(parsed) if parsed.has_host() || parsed.scheme() == "file" => parsed.path().to_string(),
        _ => url.to_string(),
    };

    path.to_ascii_lowercase().ends_with(".torrent") || TORRENT_DOWNLOAD_PATTERN.is_match(&path)
}

fn is_magnet(url: &str) -> bool {
    url.get(..8).is_some_and(|scheme| scheme.eq_ignore_ascii_case("magnet:?"))
}

async fn remove_dir_quietly(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove directory"),
    }
}

pub struct PeerToPeerDownloadMethod {
    client: Client,
    paths: LibraryPaths,
    daemon: Arc<dyn TorrentDaemon>,
    magnets: Arc<dyn MagnetFetcher>,
}

impl PeerToPeerDownloadMethod {
    pub fn new(
        paths: LibraryPaths,
        daemon: Arc<dyn TorrentDaemon>,
        magnets: Arc<dyn MagnetFetcher>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            paths,
            daemon,
            magnets,
        })
    }

    fn torrents_dir(&self) -> PathBuf {
        self.paths.downloads_path.join(TORRENTS_DIR)
    }

    /// Local torrent file for `item.url`, fetched or resolved as needed
    async fn acquire_torrent(&self, item: &DownloadItem) -> Result<PathBuf, DownloadMethodError> {
        let dir = self.torrents_dir().join(&item.token);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            error!(dir = %dir.display(), error = %e, "Failed to create torrent directory");
            DownloadMethodError::StartFailed(format!("Unexpected error occurred for: {}", item.url))
        })?;

        if is_magnet(item.url.trim()) {
            return self.magnets.fetch_torrent(&item.url, &dir).await.map_err(|e| {
                let message = match e {
                    MagnetFetchError::BrokenMagnet => BROKEN_MAGNET_LINK_MESSAGE,
                    MagnetFetchError::NoPeers => NO_PEERS_FOUND_MESSAGE,
                };
                warn!(url = %item.url, "{}", message);
                DownloadMethodError::NotDownloadable(message.to_string())
            });
        }

        let bytes = self.torrent_bytes(&item.url).await.ok_or_else(|| {
            warn!(url = %item.url, "{}", TORRENT_FILE_NOT_FOUND_MESSAGE);
            DownloadMethodError::NotDownloadable(TORRENT_FILE_NOT_FOUND_MESSAGE.to_string())
        })?;

        let path = dir.join(format!("{}.torrent", item.token));
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to save torrent file");
            DownloadMethodError::StartFailed(format!("Unexpected error occurred for: {}", item.url))
        })?;
        Ok(path)
    }

    /// Fetch and parse the torrent, then hand it to the daemon
    async fn launch(&self, item: &mut DownloadItem) -> Result<(), DownloadMethodError> {
        let torrent = self.acquire_torrent(item).await?;

        let bytes = tokio::fs::read(&torrent).await.map_err(|_| {
            DownloadMethodError::NotDownloadable(TORRENT_FILE_NOT_FOUND_MESSAGE.to_string())
        })?;
        let metadata = parse_torrent(&bytes).map_err(|e| {
            warn!(torrent = %torrent.display(), error = %e, "Corrupted torrent");
            DownloadMethodError::NotDownloadable(TORRENT_FILE_CORRUPTED_MESSAGE.to_string())
        })?;

        let staging = self.paths.staging_dir(&item.token);
        tokio::fs::create_dir_all(&staging).await.map_err(|e| {
            error!(staging = %staging.display(), error = %e, "Failed to create staging directory");
            DownloadMethodError::StartFailed(format!("Unexpected error occurred for: {}", item.url))
        })?;

        if !self.daemon.add_torrent(&torrent, &staging).await {
            error!(torrent = %torrent.display(), "{}", TORRENT_DAEMON_ADD_FAILURE_MESSAGE);
            return Err(DownloadMethodError::StartFailed(
                TORRENT_DAEMON_ADD_FAILURE_MESSAGE.to_string(),
            ));
        }

        item.download_type = DownloadType::PeerToPeer;
        item.name = metadata.name;
        item.total_size = i64::try_from(metadata.total_size).unwrap_or(i64::MAX);
        item.hash = Some(metadata.info_hash);

        Ok(())
    }

    /// Delete the torrent and staging directories of `token`
    async fn discard_files(&self, token: &str) {
        remove_dir_quietly(&self.torrents_dir().join(token)).await;
        remove_dir_quietly(&self.paths.staging_dir(token)).await;
    }

    async fn torrent_bytes(&self, url: &str) -> Option<Vec<u8>> {
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                let response = self.client.get(parsed).send().await.ok()?;
                if !response.status().is_success() {
                    debug!(url, status = %response.status(), "Torrent download refused");
                    return None;
                }
                response.bytes().await.ok().map(|b| b.to_vec())
            }
            Ok(parsed) if parsed.scheme() == "file" => {
                let path = parsed.to_file_path().ok()?;
                tokio::fs::read(path).await.ok()
            }
            _ => tokio::fs::read(Path::new(url)).await.ok(),
        }
    }
}

#[async_trait]
impl DownloadMethod for PeerToPeerDownloadMethod {
    fn name(&self) -> &'static str {
        "peer_to_peer"
    }

    fn can_handle_url(&self, url: &str) -> bool {
        is_torrent_url(url)
    }

    fn can_handle_type(&self, download_type: DownloadType) -> bool {
        download_type == DownloadType::PeerToPeer
    }

    async fn start(&self, item: &mut DownloadItem) -> Result<(), DownloadMethodError> {
        item.token = new_token("p2p");
        if let Err(e) = self.launch(item).await {
            self.discard_files(&item.token).await;
            return Err(e);
        }

        info!(token = %item.token, name = %item.name, hash = ?item.hash, "Torrent handed to daemon");
        Ok(())
    }

    async fn cancel(&self, item: &DownloadItem) -> bool {
        match &item.hash {
            Some(hash) => self.daemon.remove_torrent(hash).await,
            None => false,
        }
    }

    async fn archive(&self, item: &DownloadItem) -> bool {
        if !item.token.is_empty() {
            remove_dir_quietly(&self.torrents_dir().join(&item.token)).await;
        }
        match &item.hash {
            Some(hash) => self.daemon.remove_torrent(hash).await,
            None => true,
        }
    }

    async fn downloaded_size(&self, item: &DownloadItem) -> u64 {
        match &item.hash {
            Some(hash) => self.daemon.downloaded_size(hash).await,
            None => 0,
        }
    }

    /// Stop seeding once the daemon reports the torrent done
    async fn on_transfer_completed(&self, item: &DownloadItem) {
        if let Some(hash) = &item.hash {
            if !self.daemon.stop_torrent(hash).await {
                warn!(token = %item.token, hash, "Failed to stop finished torrent");
            }
        }
    }
}
