//! Download lifecycle events
//!
//! Events are broadcast on a tokio channel. Every listener gets its own
//! supervisor task and handles each event inside a child task, so an error or
//! a panic in one listener never reaches the publisher or the other listeners.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::DownloadItem;

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// A download was accepted and its transfer is running
    ItemStarted(DownloadItem),
    /// The transfer of an item finished. Only the id travels so listeners
    /// read the current state instead of a snapshot.
    ItemDownloaded(Uuid),
}

impl DownloadEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadEvent::ItemStarted(_) => "item_started",
            DownloadEvent::ItemDownloaded(_) => "item_downloaded",
        }
    }
}

#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: DownloadEvent) -> anyhow::Result<()>;
}

/// Supervisor task of a subscribed listener
pub struct ListenerHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloadEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire and forget
    pub fn publish(&self, event: DownloadEvent) {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => debug!(event = kind, receivers, "Published event"),
            Err(_) => debug!(event = kind, "Published event without listeners"),
        }
    }

    /// Raw receiver, without supervision
    pub fn receiver(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Start delivering events to `listener`. Events published before this
    /// call are not delivered. A listener handles its events one at a time.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerHandle {
        let mut rx = self.tx.subscribe();
        let name = listener.name();

        let handle = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(listener = name, skipped, "Listener lagged behind, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let kind = event.kind();
                let listener = listener.clone();
                let run = tokio::spawn(async move { listener.handle(event).await });

                match run.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(listener = name, event = kind, error = %e, "Event listener failed"),
                    Err(e) if e.is_panic() => error!(listener = name, event = kind, "Event listener panicked"),
                    Err(e) => warn!(listener = name, event = kind, error = %e, "Event listener task aborted"),
                }
            }
            debug!(listener = name, "Event bus closed");
        });

        info!(listener = name, "Event listener subscribed");
        ListenerHandle { name, handle }
    }
}

/// Announces started downloads in the log, where push notification
/// collaborators pick them up
pub struct NotifyItemStarted;

#[async_trait]
impl EventListener for NotifyItemStarted {
    fn name(&self) -> &'static str {
        "notify_item_started"
    }

    async fn handle(&self, event: DownloadEvent) -> anyhow::Result<()> {
        if let DownloadEvent::ItemStarted(item) = event {
            info!(
                token = %item.token,
                name = %item.name,
                owner_id = ?item.owner_id,
                total_size = item.total_size,
                "Download started"
            );
        }
        Ok(())
    }
}
