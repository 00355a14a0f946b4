//! Download orchestration, ingestion and external tool integrations

pub mod command;
pub mod download;
pub mod download_items;
pub mod events;
pub mod extractor;
pub mod ffmpeg;
pub mod file_utils;
pub mod filebot;
pub mod ingestion;
pub mod logging;
pub mod media_library;
pub mod mover;
pub mod torrent_metadata;

pub use command::{CommandError, CommandOutput, CommandRequest, CommandRunner, SystemCommandRunner};
pub use download::{
    DirectDownloadMethod, DownloadMethod, DownloadMethodError, DownloadMethods, PeerToPeerDownloadMethod,
    TaskRegistry,
};
pub use download_items::{ActionResult, DownloadItemActionError, DownloadItemService};
pub use events::{DownloadEvent, EventBus, EventListener, ListenerHandle, NotifyItemStarted};
pub use extractor::{ArchiveExtractor, ArchiveTool, UnrarCli};
pub use ffmpeg::{FfprobeService, MediaProbe};
pub use filebot::FilebotService;
pub use ingestion::ProcessDownloadItem;
pub use logging::{LoggingConfig, init_tracing};
pub use media_library::{MediaFolderSummary, MediaLibraryService};
pub use mover::{IngestionReport, MediaLibraryMover};
