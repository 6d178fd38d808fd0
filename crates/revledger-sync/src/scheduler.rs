use std::sync::Arc;

use anyhow::{Context, Result};
use revledger_storage::CanonicalStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::pipeline::SyncPipeline;

/// A scheduler running `sync_all` on `config.sync_cron`, or `None` when
/// scheduling is disabled. The caller starts it.
pub async fn maybe_build_scheduler<S>(
    pipeline: Arc<SyncPipeline<S>>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>>
where
    S: CanonicalStore + 'static,
{
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.sync_all().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    companies = summary.companies.len(),
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
