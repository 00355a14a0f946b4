//! Torrent daemon and magnet metadata backends

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TransmissionSettings;
use crate::services::command::{CommandOutput, CommandRequest, CommandRunner};

static DOWNLOADED_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*Downloaded:\s*(?P<value>[\d.,]+)\s*(?P<unit>[A-Za-z]+)").expect("valid regex")
});

/// Torrent client running outside the process
#[async_trait]
pub trait TorrentDaemon: Send + Sync {
    async fn add_torrent(&self, torrent: &Path, download_dir: &Path) -> bool;
    async fn stop_torrent(&self, hash: &str) -> bool;
    async fn remove_torrent(&self, hash: &str) -> bool;
    async fn downloaded_size(&self, hash: &str) -> u64;
}

/// `transmission-remote` backend
pub struct TransmissionDaemon {
    program: String,
    settings: TransmissionSettings,
    runner: Arc<dyn CommandRunner>,
}

impl TransmissionDaemon {
    pub fn new(program: impl Into<String>, settings: TransmissionSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            settings,
            runner,
        }
    }

    fn command(&self) -> CommandRequest {
        CommandRequest::new(&self.program)
            .arg("-n")
            .arg(format!("{}:{}", self.settings.username, self.settings.password))
    }

    async fn run(&self, request: CommandRequest) -> Option<CommandOutput> {
        match self.runner.run(&request).await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(error = %e, "transmission-remote could not run");
                None
            }
        }
    }

    async fn torrent_action(&self, hash: &str, flag: &str) -> bool {
        let request = self.command().arg("-t").arg(hash).arg(flag);
        self.run(request).await.is_some_and(|o| o.success())
    }
}

#[async_trait]
impl TorrentDaemon for TransmissionDaemon {
    async fn add_torrent(&self, torrent: &Path, download_dir: &Path) -> bool {
        let request = self
            .command()
            .arg("-a")
            .path_arg(torrent)
            .arg("-w")
            .path_arg(download_dir)
            .arg("--torrent-done-script")
            .arg(&self.settings.torrent_done_script);

        let Some(output) = self.run(request).await else {
            return false;
        };
        info!(
            torrent = %torrent.display(),
            exit_code = output.exit_code,
            stdout = %output.stdout.trim(),
            stderr = %output.stderr.trim(),
            "Added torrent to transmission"
        );
        output.success()
    }

    async fn stop_torrent(&self, hash: &str) -> bool {
        self.torrent_action(hash, "-S").await
    }

    async fn remove_torrent(&self, hash: &str) -> bool {
        self.torrent_action(hash, "-r").await
    }

    async fn downloaded_size(&self, hash: &str) -> u64 {
        let request = self.command().arg("-t").arg(hash).arg("-i");
        self.run(request)
            .await
            .and_then(|o| parse_downloaded_size(&o.stdout))
            .unwrap_or(0)
    }
}

/// Bytes of the `Downloaded:` line of `transmission-remote -i`
pub fn parse_downloaded_size(info: &str) -> Option<u64> {
    let caps = DOWNLOADED_PATTERN.captures(info)?;
    let value: f64 = caps["value"].replace(',', ".").parse().ok()?;
    let multiplier: f64 = match &caps["unit"] {
        "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024f64.powi(2),
        "GiB" => 1024f64.powi(3),
        "TiB" => 1024f64.powi(4),
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MagnetFetchError {
    #[error("magnet link is broken")]
    BrokenMagnet,
    #[error("no peers found before timeout")]
    NoPeers,
}

/// Resolves a magnet link into a `.torrent` file
#[async_trait]
pub trait MagnetFetcher: Send + Sync {
    /// Fetch the metadata of `magnet` into `dest_dir`, returning the saved
    /// torrent file
    async fn fetch_torrent(&self, magnet: &str, dest_dir: &Path) -> Result<PathBuf, MagnetFetchError>;
}

/// `aria2c` metadata-only backend
pub struct Aria2cMagnetFetcher {
    program: String,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl Aria2cMagnetFetcher {
    pub fn new(program: impl Into<String>, timeout: Duration, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            timeout,
            runner,
        }
    }
}

#[async_trait]
impl MagnetFetcher for Aria2cMagnetFetcher {
    async fn fetch_torrent(&self, magnet: &str, dest_dir: &Path) -> Result<PathBuf, MagnetFetchError> {
        let request = CommandRequest::new(&self.program)
            .args(["--bt-metadata-only=true", "--bt-save-metadata=true", "-q"])
            .arg(magnet)
            .arg("-d")
            .path_arg(dest_dir)
            .timeout(self.timeout);

        match self.runner.run(&request).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                warn!(exit_code = output.exit_code, "aria2c rejected the magnet link");
                return Err(MagnetFetchError::BrokenMagnet);
            }
            Err(e) if e.is_timeout() => {
                warn!(timeout_secs = self.timeout.as_secs(), "aria2c found no peers in time");
                return Err(MagnetFetchError::NoPeers);
            }
            Err(e) => {
                warn!(error = %e, "aria2c could not run");
                return Err(MagnetFetchError::BrokenMagnet);
            }
        }

        let torrent = std::fs::read_dir(dest_dir)
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("torrent")));

        match torrent {
            Some(path) => {
                debug!(torrent = %path.display(), "Magnet metadata saved");
                Ok(path)
            }
            None => {
                warn!(dir = %dest_dir.display(), "aria2c succeeded without saving metadata");
                Err(MagnetFetchError::BrokenMagnet)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::command::CommandError;
    use crate::services::command::testing::ScriptedRunner;

    fn daemon(runner: Arc<ScriptedRunner>) -> TransmissionDaemon {
        TransmissionDaemon::new(
            "transmission-remote",
            TransmissionSettings {
                username: "tr".to_string(),
                password: "secret".to_string(),
                torrent_done_script: "/opt/done.sh".to_string(),
            },
            runner,
        )
    }

    #[test]
    fn test_parse_downloaded_size() {
        let info = "NAME\n  Id: 1\n  Name: Show\nTRANSFER\n  State: Downloading\n  Percent Done: 50%\n  Downloaded: 134.4 MB\n  Uploaded: None\n";
        assert_eq!(parse_downloaded_size(info), Some(134_400_000));
        assert_eq!(parse_downloaded_size("  Downloaded: 2 KiB"), Some(2048));
        assert_eq!(parse_downloaded_size("  Downloaded: 1.5 GiB"), Some(1_610_612_736));
        assert_eq!(parse_downloaded_size("  Downloaded: None"), None);
        assert_eq!(parse_downloaded_size(""), None);
    }

    #[tokio::test]
    async fn test_transmission_command_lines() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_output(0, "success");
        runner.push_output(1, "");
        runner.push_output(0, "  Downloaded: 10 kB");
        let daemon = daemon(runner.clone());

        assert!(daemon.add_torrent(Path::new("/t/a.torrent"), Path::new("/dl/_p2p1")).await);
        assert!(!daemon.stop_torrent("abc").await);
        assert_eq!(daemon.downloaded_size("abc").await, 10_000);

        let recorded = runner.recorded();
        assert_eq!(
            recorded[0].args,
            vec!["-n", "tr:secret", "-a", "/t/a.torrent", "-w", "/dl/_p2p1", "--torrent-done-script", "/opt/done.sh"]
        );
        assert_eq!(recorded[1].args, vec!["-n", "tr:secret", "-t", "abc", "-S"]);
        assert_eq!(recorded[2].args, vec!["-n", "tr:secret", "-t", "abc", "-i"]);
    }

    #[tokio::test]
    async fn test_magnet_fetch_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_output(1, "");
        runner.push_error(CommandError::Timeout {
            program: "aria2c".to_string(),
            timeout: Duration::from_secs(5),
        });
        let fetcher = Aria2cMagnetFetcher::new("aria2c", Duration::from_secs(5), runner.clone());

        assert_eq!(
            fetcher.fetch_torrent("magnet:?broken", dir.path()).await,
            Err(MagnetFetchError::BrokenMagnet)
        );
        assert_eq!(
            fetcher.fetch_torrent("magnet:?slow", dir.path()).await,
            Err(MagnetFetchError::NoPeers)
        );

        // success without a saved file is still a broken link
        assert_eq!(
            fetcher.fetch_torrent("magnet:?empty", dir.path()).await,
            Err(MagnetFetchError::BrokenMagnet)
        );

        let saved = dir.path().join("25c8f093021fd9d97087f9444c160d9bb3d70e35.torrent");
        std::fs::write(&saved, b"d4:infode").unwrap();
        assert_eq!(fetcher.fetch_torrent("magnet:?ok", dir.path()).await, Ok(saved));

        let recorded = runner.recorded();
        assert_eq!(recorded[0].timeout, Some(Duration::from_secs(5)));
        assert_eq!(recorded[0].args[..4], ["--bt-metadata-only=true", "--bt-save-metadata=true", "-q", "magnet:?broken"]);
    }
}
