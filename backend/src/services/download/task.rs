//! In-flight direct transfers
//!
//! The registry maps item tokens to the cancellation signal of their running
//! transfer. It is the only record of whether a transfer can still be
//! canceled. Canceling only signals; the task removes its own entry as it
//! exits, after which canceling its token reports that nothing was canceled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::services::events::{DownloadEvent, EventBus};

/// Write buffer of a transfer
const COPY_BUFFER_SIZE: usize = 81920;

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, cancel: CancellationToken) {
        self.tasks.lock().insert(token.to_string(), cancel);
    }

    /// Signal the task of `token` to stop; false when no task is registered
    pub fn cancel(&self, token: &str) -> bool {
        match self.tasks.lock().get(token) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, token: &str) -> bool {
        self.tasks.lock().remove(token).is_some()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tasks.lock().contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Canceled,
    Failed,
}

/// One direct transfer, streaming a URL into a file. Session cookies travel
/// with the client the task is spawned with.
pub struct DirectDownloadTask {
    pub item_id: Uuid,
    pub token: String,
    pub url: String,
    pub destination: PathBuf,
    cancel: CancellationToken,
}

impl DirectDownloadTask {
    pub fn new(
        item_id: Uuid,
        token: impl Into<String>,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            item_id,
            token: token.into(),
            url: url.into(),
            destination: destination.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register in `registry` and run the transfer in the background
    pub fn spawn(
        self,
        client: Client,
        registry: TaskRegistry,
        events: EventBus,
    ) -> tokio::task::JoinHandle<TaskOutcome> {
        registry.insert(&self.token, self.cancel.clone());
        tokio::spawn(async move { self.run(&client, &registry, &events).await })
    }

    /// Run the transfer to its end. The registry entry is removed whatever
    /// the outcome; only a complete transfer publishes `ItemDownloaded`.
    pub async fn run(&self, client: &Client, registry: &TaskRegistry, events: &EventBus) -> TaskOutcome {
        info!(token = %self.token, url = %self.url, "Direct download started");

        let outcome = match self.transfer(client).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(token = %self.token, error = %e, "Direct download failed");
                TaskOutcome::Failed
            }
        };

        registry.remove(&self.token);

        match outcome {
            TaskOutcome::Completed => {
                info!(token = %self.token, destination = %self.destination.display(), "Direct download completed");
                events.publish(DownloadEvent::ItemDownloaded(self.item_id));
            }
            TaskOutcome::Canceled => info!(token = %self.token, "Direct download canceled"),
            TaskOutcome::Failed => {}
        }

        outcome
    }

    async fn transfer(&self, client: &Client) -> Result<TaskOutcome> {
        let request = client.get(&self.url);
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(TaskOutcome::Canceled),
            response = request.send() => response.context("Request failed")?,
        };
        let response = response.error_for_status().context("Server refused the download")?;

        let file = tokio::fs::File::create(&self.destination)
            .await
            .with_context(|| format!("Failed to create {}", self.destination.display()))?;
        let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, file);

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    writer.flush().await?;
                    debug!(token = %self.token, written, "Transfer interrupted");
                    return Ok(TaskOutcome::Canceled);
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.context("Stream error")?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        writer.flush().await?;
        debug!(token = %self.token, written, "Transfer finished");

        // a cancel that raced the last chunk still wins
        if self.cancel.is_cancelled() {
            return Ok(TaskOutcome::Canceled);
        }
        Ok(TaskOutcome::Completed)
    }
}
