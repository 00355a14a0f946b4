//! Download methods
//!
//! One implementation per transport. Routing picks the first registered method
//! claiming a URL, so registration order decides ambiguous URLs.

pub mod daemon;
pub mod direct;
pub mod peer;
pub mod task;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::{DownloadItem, DownloadType};

pub use daemon::{Aria2cMagnetFetcher, MagnetFetchError, MagnetFetcher, TorrentDaemon, TransmissionDaemon};
pub use direct::DirectDownloadMethod;
pub use peer::PeerToPeerDownloadMethod;
pub use task::{DirectDownloadTask, TaskOutcome, TaskRegistry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DownloadMethodError {
    /// The source was reached but cannot be acquired
    #[error("{0}")]
    NotDownloadable(String),
    /// The source looked fine but the transfer could not begin
    #[error("{0}")]
    StartFailed(String),
}

#[async_trait]
pub trait DownloadMethod: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pure routing predicate; no I/O
    fn can_handle_url(&self, url: &str) -> bool;

    fn can_handle_type(&self, download_type: DownloadType) -> bool;

    /// Validate the source, fill in name, size, token, type and hash, and
    /// launch the transfer
    async fn start(&self, item: &mut DownloadItem) -> Result<(), DownloadMethodError>;

    /// Whether a cancellation was actually applied
    async fn cancel(&self, item: &DownloadItem) -> bool;

    /// Backend cleanup; the staging directory is left alone
    async fn archive(&self, item: &DownloadItem) -> bool;

    /// Bytes transferred so far
    async fn downloaded_size(&self, item: &DownloadItem) -> u64;

    /// Called when a transfer completion is signalled from outside the process
    async fn on_transfer_completed(&self, _item: &DownloadItem) {}
}

#[derive(Clone, Default)]
pub struct DownloadMethods {
    methods: Vec<Arc<dyn DownloadMethod>>,
}

impl DownloadMethods {
    pub fn new(methods: Vec<Arc<dyn DownloadMethod>>) -> Self {
        Self { methods }
    }

    pub fn for_url(&self, url: &str) -> Option<Arc<dyn DownloadMethod>> {
        self.methods.iter().find(|m| m.can_handle_url(url)).cloned()
    }

    pub fn for_type(&self, download_type: DownloadType) -> Option<Arc<dyn DownloadMethod>> {
        self.methods
            .iter()
            .find(|m| m.can_handle_type(download_type))
            .cloned()
    }
}

/// Fresh item token: `_<type prefix>` followed by 32 hex characters
pub(crate) fn new_token(prefix: &str) -> String {
    format!("_{}{}", prefix, uuid::Uuid::new_v4().simple())
}
