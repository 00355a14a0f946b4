//! ffprobe-based duration probe
//!
//! Only the container duration is needed: it drives the fallback library
//! bucket when the rename tool cannot identify a video.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::command::{CommandRequest, CommandRunner};

#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Media duration; zero when it cannot be determined
    async fn duration(&self, path: &Path) -> Duration;
}

mod ffprobe {
    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

pub struct FfprobeService {
    ffprobe_path: String,
    runner: Arc<dyn CommandRunner>,
}

impl FfprobeService {
    pub fn new(ffprobe_path: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            runner,
        }
    }

    async fn probe_duration(&self, path: &Path) -> Result<Duration> {
        let request = CommandRequest::new(&self.ffprobe_path)
            .args(["-v", "error", "-print_format", "json", "-show_format"])
            .path_arg(path)
            .timeout(Duration::from_secs(60));

        let output = self
            .runner
            .run(&request)
            .await
            .with_context(|| format!("Failed to execute ffprobe for '{}'", path.display()))?;

        if !output.success() {
            bail!(
                "ffprobe failed for '{}' (exit code {}): {}",
                path.display(),
                output.exit_code,
                output.stderr.trim()
            );
        }

        let probe: ffprobe::FfprobeOutput =
            serde_json::from_str(&output.stdout).context("Failed to parse ffprobe JSON output")?;

        let secs = probe
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or(0.0);

        Ok(Duration::from_secs_f64(secs))
    }
}

#[async_trait]
impl MediaProbe for FfprobeService {
    async fn duration(&self, path: &Path) -> Duration {
        match self.probe_duration(path).await {
            Ok(duration) => {
                debug!(path = %path.display(), secs = duration.as_secs(), "Probed media duration");
                duration
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not determine media duration");
                Duration::ZERO
            }
        }
    }
}
