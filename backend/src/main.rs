//! Mediaflow backend - process bootstrap
//!
//! Wires the download methods, event listeners and background jobs together
//! and runs until interrupted.

use std::sync::Arc;

use mediaflow::config::Config;
use mediaflow::db::{Database, DownloadItemRepository};
use mediaflow::jobs;
use mediaflow::services::download::{
    Aria2cMagnetFetcher, DirectDownloadMethod, DownloadMethods, PeerToPeerDownloadMethod, TaskRegistry,
    TransmissionDaemon,
};
use mediaflow::services::{
    ArchiveExtractor, CommandRunner, DownloadItemService, EventBus, FfprobeService, FilebotService,
    LoggingConfig, MediaLibraryMover, NotifyItemStarted, ProcessDownloadItem, SystemCommandRunner, UnrarCli,
    init_tracing,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    init_tracing(&LoggingConfig::json(config.log_json))?;
    tracing::info!("Starting Mediaflow");

    let db = Database::connect(&config.database_path).await?;
    tracing::info!(path = %config.database_path, "Database connected");

    for dir in [&config.paths.downloads_path, &config.paths.media_library_path] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let repository: Arc<dyn DownloadItemRepository> = Arc::new(db.download_items());
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
    let events = EventBus::default();

    // Download methods, direct first
    let direct = DirectDownloadMethod::new(
        config.direct_download.clone(),
        config.paths.clone(),
        TaskRegistry::new(),
        events.clone(),
    )?;
    let peer = PeerToPeerDownloadMethod::new(
        config.paths.clone(),
        Arc::new(TransmissionDaemon::new(
            &config.tools.transmission_remote,
            config.transmission.clone(),
            runner.clone(),
        )),
        Arc::new(Aria2cMagnetFetcher::new(
            &config.tools.aria2c,
            config.magnet_metadata_timeout,
            runner.clone(),
        )),
    )?;
    let methods = DownloadMethods::new(vec![Arc::new(direct), Arc::new(peer)]);

    let download_items = Arc::new(DownloadItemService::new(
        repository.clone(),
        methods,
        events.clone(),
        config.paths.clone(),
    ));
    tracing::info!(
        filehosters = config.direct_download.filehosters.len(),
        "Download item service initialized"
    );

    // Ingestion pipeline
    let filebot = Arc::new(FilebotService::new(&config.tools.filebot, runner.clone()));
    let mover = Arc::new(MediaLibraryMover::new(
        config.paths.clone(),
        filebot.clone(),
        Arc::new(FfprobeService::new(&config.tools.ffprobe, runner.clone())),
        Arc::new(ArchiveExtractor::new(
            &config.paths.media_library_path,
            Arc::new(UnrarCli::new(&config.tools.unrar, runner.clone())),
        )),
    ));

    let listeners = [
        events.subscribe(Arc::new(ProcessDownloadItem::new(repository.clone(), mover))),
        events.subscribe(Arc::new(NotifyItemStarted)),
    ];

    if repository.has_pending_downloads().await? {
        tracing::warn!("Downloads from a previous run are still pending");
    }

    let mut scheduler = jobs::start_scheduler(
        download_items,
        repository,
        filebot,
        config.paths.media_library_path.clone(),
        config.archive_threshold_days,
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    scheduler.shutdown().await?;
    for listener in &listeners {
        listener.abort();
    }

    Ok(())
}
