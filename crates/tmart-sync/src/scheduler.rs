use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::pipeline::{RunSummary, SyncPipeline};
use crate::reports::publish_or_log;

/// One scheduled trigger: run the pipeline unless a run is already in
/// flight, then publish reports.
pub struct ScheduledSync {
    pipeline: Arc<SyncPipeline>,
    reports_dir: PathBuf,
}

impl ScheduledSync {
    pub fn new(pipeline: Arc<SyncPipeline>, reports_dir: PathBuf) -> Self {
        Self { pipeline, reports_dir }
    }

    /// Returns `None` when the trigger was skipped because another run held
    /// the pipeline.
    pub async fn tick(&self) -> Option<RunSummary> {
        let Some(summary) = self.pipeline.try_run_once().await else {
            info!("previous run still in progress; skipping scheduled trigger");
            return None;
        };
        publish_or_log(&self.reports_dir, &summary, self.pipeline.warehouse().as_ref()).await;
        Some(summary)
    }
}

pub async fn build_scheduler(cron: &str, sync: Arc<ScheduledSync>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let sync = sync.clone();
        Box::pin(async move {
            if let Some(summary) = sync.tick().await {
                info!(
                    run_id = %summary.run_id,
                    status = ?summary.status,
                    failures = summary.failures.len(),
                    "scheduled run finished"
                );
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Starts the scheduler and blocks until ctrl-c.
pub async fn run_scheduler(cron: &str, sync: Arc<ScheduledSync>) -> Result<()> {
    let mut sched = build_scheduler(cron, sync).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
