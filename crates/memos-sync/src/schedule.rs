use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{MirrorConfig, SyncFrequency};
use crate::pipeline::SyncPipeline;

async fn scheduled_run(pipeline: Arc<SyncPipeline>) {
    match pipeline.try_run_once().await {
        None => warn!("previous sync still running; skipping this trigger"),
        Some(Ok(summary)) => info!(
            run_id = %summary.run_id,
            written = summary.written(),
            failed = summary.failed,
            "scheduled sync finished"
        ),
        Some(Err(err)) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
    }
}

/// Recurring sync job, or `None` when sync is manual. The caller starts it.
pub async fn maybe_build_scheduler(
    config: &MirrorConfig,
    pipeline: Arc<SyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if config.sync_frequency != SyncFrequency::Auto {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = match &config.sync_cron {
        Some(cron) => Job::new_async(cron.as_str(), move |_uuid, _l| {
            Box::pin(scheduled_run(pipeline.clone()))
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?,
        None => {
            let every = config.auto_sync_interval();
            Job::new_repeated_async(every, move |_uuid, _l| {
                Box::pin(scheduled_run(pipeline.clone()))
            })
            .with_context(|| format!("creating scheduler job every {}s", every.as_secs()))?
        }
    };
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
