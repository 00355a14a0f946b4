//! Background job scheduling

pub mod archive;
pub mod missing_subtitles;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::db::DownloadItemRepository;
use crate::services::{DownloadItemService, FilebotService};

/// Skips a run while the previous run of the same job is still going
#[derive(Clone)]
pub struct JobGuard {
    name: &'static str,
    running: Arc<AtomicBool>,
}

impl JobGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run `job` unless a run is in progress. Returns whether it ran.
    pub async fn run<F>(&self, job: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(job = self.name, "Previous run still in progress, skipping");
            return false;
        }

        let _reset = RunningFlag(&self.running);
        if let Err(e) = job.await {
            error!(job = self.name, error = %e, "Job failed");
        }
        true
    }
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    download_items: Arc<DownloadItemService>,
    repository: Arc<dyn DownloadItemRepository>,
    filebot: Arc<FilebotService>,
    media_library_path: std::path::PathBuf,
    archive_threshold_days: i64,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Archive sweep - run every hour
    let archive_guard = JobGuard::new("archive");
    let archive_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let guard = archive_guard.clone();
        let service = download_items.clone();
        Box::pin(async move {
            guard
                .run(async {
                    info!("Running archive sweep");
                    archive::archive_passed_items(&service, archive_threshold_days).await?;
                    Ok(())
                })
                .await;
        })
    })?;
    scheduler.add(archive_job).await?;

    // Missing subtitles - run every 6 hours
    let subtitles_guard = JobGuard::new("missing_subtitles");
    let subtitles_job = Job::new_async("0 30 */6 * * *", move |_uuid, _l| {
        let guard = subtitles_guard.clone();
        let repository = repository.clone();
        let filebot = filebot.clone();
        let library = media_library_path.clone();
        Box::pin(async move {
            guard
                .run(async {
                    info!("Running missing subtitles sweep");
                    missing_subtitles::fetch_missing_subtitles(repository.as_ref(), &filebot, &library).await?;
                    Ok(())
                })
                .await;
        })
    })?;
    scheduler.add(subtitles_job).await?;

    scheduler.start().await?;

    info!("Job scheduler started");
    Ok(scheduler)
}
