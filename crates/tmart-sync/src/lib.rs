//! The technology-metrics ETL: registry loading, the run orchestrator,
//! append-only staging, latest-value datamart materialization, reports and
//! the cron scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tmart_connectors::{
    GithubConnector, PypiConnector, ServiceAccountTokenProvider, SourceConnector,
};
use tmart_core::SourceTag;
use tmart_storage::{
    HttpClientConfig, HttpFetcher, PgWarehouse, PoolConfig, RawResponseArchive, WarehouseTarget,
};
use tracing::info;

pub mod config;
pub mod datamart;
pub mod export;
pub mod pipeline;
pub mod registry;
pub mod reports;
pub mod scheduler;
pub mod staging;

pub use config::{Credentials, SyncConfig};
pub use datamart::{build_snapshot, select_latest, DatamartBuilder, MaterializationError, RebuildOutcome};
pub use export::{export_datamart_parquet, ParquetManifest, ParquetManifestFile};
pub use pipeline::{
    FailureRecord, PipelineOptions, RunPhase, RunStatus, RunSummary, SourceRunStats, SyncPipeline,
};
pub use registry::{near_duplicates, Registry, SourceSettings};
pub use reports::{
    publish_or_log, publish_run, recent_run_summaries, render_brief, report_recent_runs_markdown,
    write_run_reports,
};
pub use scheduler::{build_scheduler, run_scheduler, ScheduledSync};
pub use staging::{
    GrowthWarningHook, NoopRetentionHook, RetentionHook, StagingStats, StagingWriteError,
    StagingWriter,
};

pub const CRATE_NAME: &str = "tmart-sync";

/// Connectors for every source the registry actually uses. Credentials must
/// already have been checked with [`SyncConfig::require_credentials`].
pub async fn build_connectors(
    config: &SyncConfig,
    registry: &Registry,
) -> Result<Vec<Arc<dyn SourceConnector>>> {
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        token_bucket: config.token_bucket(),
        ..Default::default()
    })?);
    let archive = config.raw_archive_dir.clone().map(RawResponseArchive::new);
    let mut connectors: Vec<Arc<dyn SourceConnector>> = Vec::new();

    if registry.is_active(SourceTag::Github) {
        let token = config
            .credentials
            .github_token
            .clone()
            .context("GITHUB_TOKEN is not set")?;
        let mut github = GithubConnector::new(http.clone(), token);
        if let Some(archive) = &archive {
            github = github.with_archive(archive.clone());
        }
        connectors.push(Arc::new(github));
    }

    if registry.is_active(SourceTag::Pypi) {
        let project = config
            .credentials
            .gcp_project
            .clone()
            .context("GOOGLE_CLOUD_PROJECT is not set")?;
        let key_path = config
            .credentials
            .gcp_credentials
            .as_deref()
            .context("GOOGLE_APPLICATION_CREDENTIALS is not set")?;
        let tokens = ServiceAccountTokenProvider::from_file(http.clone(), key_path).await?;
        info!(client_email = tokens.client_email(), "using service account for bigquery");
        let mut pypi = PypiConnector::new(http.clone(), project, Arc::new(tokens));
        if let Some(archive) = &archive {
            pypi = pypi.with_archive(archive.clone());
        }
        connectors.push(Arc::new(pypi));
    }

    Ok(connectors)
}

/// Loads and validates everything a run needs. Any error here is fatal and
/// happens before a run starts.
pub async fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline> {
    let registry = Registry::load(&config.registry_path).await?;
    config.require_credentials(&registry)?;
    let warehouse = config.warehouse.open().await.context("opening warehouse")?;
    let connectors = build_connectors(config, &registry).await?;

    let mut pipeline = SyncPipeline::new(registry, warehouse).with_options(PipelineOptions {
        fetch_concurrency: config.fetch_concurrency,
        run_timeout: Duration::from_secs(config.run_timeout_secs),
    });
    for connector in connectors {
        pipeline = pipeline.with_connector(connector);
    }
    if let Some(threshold) = config.staging_warn_rows {
        pipeline = pipeline.with_retention_hook(Box::new(GrowthWarningHook::new(threshold)));
    }
    Ok(pipeline)
}

/// One run against the environment's configuration, with reports and a
/// Parquet export published under the reports directory.
pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = pipeline_from_config(&config).await?;
    let summary = pipeline.run_once().await;
    publish_or_log(&config.reports_dir, &summary, pipeline.warehouse().as_ref()).await;
    Ok(summary)
}

/// Rebuilds the datamart from the staging already stored, without fetching.
pub async fn rebuild_from_env() -> Result<RebuildOutcome> {
    let config = SyncConfig::from_env()?;
    let warehouse = config.warehouse.open().await.context("opening warehouse")?;
    let outcome = DatamartBuilder::new(warehouse)
        .rebuild(uuid::Uuid::new_v4())
        .await
        .context("rebuilding datamart")?;
    Ok(outcome)
}

/// Applies the Postgres schema migrations. Other backends need none.
pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    match &config.warehouse {
        WarehouseTarget::Postgres(url) => {
            let warehouse = PgWarehouse::connect(url, PoolConfig::default())
                .await
                .context("connecting to postgres")?;
            warehouse.migrate().await.context("running migrations")?;
            info!("warehouse migrations applied");
        }
        other => info!(target = ?other, "warehouse needs no migrations"),
    }
    Ok(())
}

/// Scheduler mode: one pipeline shared across triggers so runs never overlap.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let pipeline = Arc::new(pipeline_from_config(&config).await?);
    let sync = Arc::new(ScheduledSync::new(pipeline, config.reports_dir.clone()));
    run_scheduler(&config.scheduler_cron, sync).await
}
