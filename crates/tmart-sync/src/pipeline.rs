use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tmart_connectors::{FailureKind, FetchContext, SourceConnector, SourceFailure};
use tmart_core::{RawMetricRecord, SourceTag, Technology};
use tmart_storage::Warehouse;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::datamart::{DatamartBuilder, RebuildOutcome};
use crate::registry::Registry;
use crate::staging::{NoopRetentionHook, RetentionHook, StagingStats, StagingWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Fetching,
    Staging,
    Materializing,
    Done,
    PartialFailure,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Init => "init",
            RunPhase::Fetching => "fetching",
            RunPhase::Staging => "staging",
            RunPhase::Materializing => "materializing",
            RunPhase::Done => "done",
            RunPhase::PartialFailure => "partial_failure",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    PartialFailure,
    /// The datamart could not be rebuilt.
    Aborted,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Done => 0,
            RunStatus::Aborted => 1,
            RunStatus::PartialFailure => 2,
        }
    }
}

/// One failed (technology, source) combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub technology: String,
    pub source: SourceTag,
    pub phase: RunPhase,
    /// Connector failure kind; `None` for staging write failures.
    pub kind: Option<FailureKind>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRunStats {
    pub source: SourceTag,
    pub technologies: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub fetched_records: usize,
    pub appended_rows: usize,
    pub staging_error: Option<String>,
    pub total_rows: Option<u64>,
}

impl SourceRunStats {
    fn new(source: SourceTag) -> Self {
        Self {
            source,
            technologies: 0,
            succeeded: 0,
            failed: 0,
            fetched_records: 0,
            appended_rows: 0,
            staging_error: None,
            total_rows: None,
        }
    }
}

/// Structured result of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub technologies: usize,
    pub sources: Vec<SourceRunStats>,
    pub failures: Vec<FailureRecord>,
    pub materialization: Option<RebuildOutcome>,
    pub aborted_reason: Option<String>,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn source_stats(&self, source: SourceTag) -> Option<&SourceRunStats> {
        self.sources.iter().find(|s| s.source == source)
    }

    pub fn failures_for(&self, technology: &str) -> Vec<&FailureRecord> {
        self.failures.iter().filter(|f| f.technology == technology).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub fetch_concurrency: usize,
    /// Deadline for the Fetching phase. Staging and materialization are not
    /// cut short by it.
    pub run_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            fetch_concurrency: 8,
            run_timeout: Duration::from_secs(600),
        }
    }
}

struct FetchOutcome {
    source: SourceTag,
    technology: Technology,
    result: Result<Vec<RawMetricRecord>, SourceFailure>,
}

/// Runs `Init → Fetching → Staging → Materializing → Done | PartialFailure`.
///
/// At most one run executes at a time per pipeline.
pub struct SyncPipeline {
    registry: Arc<Registry>,
    connectors: Vec<Arc<dyn SourceConnector>>,
    warehouse: Arc<dyn Warehouse>,
    retention: Box<dyn RetentionHook>,
    options: PipelineOptions,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(registry: Registry, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            registry: Arc::new(registry),
            connectors: Vec::new(),
            warehouse,
            retention: Box::<NoopRetentionHook>::default(),
            options: PipelineOptions::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn with_retention_hook(mut self, hook: Box<dyn RetentionHook>) -> Self {
        self.retention = hook;
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn warehouse(&self) -> Arc<dyn Warehouse> {
        self.warehouse.clone()
    }

    /// Runs once, waiting for any run already in progress to finish first.
    pub async fn run_once(&self) -> RunSummary {
        let _guard = self.run_lock.lock().await;
        self.execute().await
    }

    /// Runs once unless another run is in progress, in which case `None`.
    pub async fn try_run_once(&self) -> Option<RunSummary> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.execute().await)
    }

    async fn execute(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let ctx = FetchContext::new(run_id);
        let deadline = Instant::now() + self.options.run_timeout;

        info!(%run_id, phase = %RunPhase::Init, technologies = self.registry.technologies().len(), "run phase");
        let mut stats: BTreeMap<SourceTag, SourceRunStats> = BTreeMap::new();
        let mut failures = Vec::new();
        for source in SourceTag::ALL {
            let technologies = self.registry.technologies_for(source);
            if technologies.is_empty() {
                continue;
            }
            let entry = stats.entry(source).or_insert_with(|| SourceRunStats::new(source));
            entry.technologies = technologies.len();
            if !self.connectors.iter().any(|c| c.source() == source) {
                warn!(%run_id, %source, "no connector configured for enabled source");
                entry.failed = technologies.len();
                for technology in technologies {
                    failures.push(FailureRecord {
                        technology: technology.name,
                        source,
                        phase: RunPhase::Init,
                        kind: Some(FailureKind::Fatal),
                        message: "no connector configured for this source".to_string(),
                    });
                }
            }
        }

        info!(%run_id, phase = %RunPhase::Fetching, "run phase");
        let outcomes = self.fetch_all(&ctx, deadline).await;

        let mut batches: BTreeMap<SourceTag, Vec<RawMetricRecord>> = BTreeMap::new();
        let mut staged_by: BTreeMap<SourceTag, BTreeSet<String>> = BTreeMap::new();
        for outcome in outcomes {
            let entry = stats
                .entry(outcome.source)
                .or_insert_with(|| SourceRunStats::new(outcome.source));
            match outcome.result {
                Ok(records) => {
                    entry.succeeded += 1;
                    entry.fetched_records += records.len();
                    if !records.is_empty() {
                        staged_by
                            .entry(outcome.source)
                            .or_default()
                            .insert(outcome.technology.name.clone());
                    }
                    batches.entry(outcome.source).or_default().extend(records);
                }
                Err(failure) => {
                    entry.failed += 1;
                    warn!(
                        %run_id,
                        technology = %outcome.technology.name,
                        source = %outcome.source,
                        kind = failure.kind().as_str(),
                        error = %failure,
                        "technology fetch failed"
                    );
                    failures.push(FailureRecord {
                        technology: outcome.technology.name,
                        source: outcome.source,
                        phase: RunPhase::Fetching,
                        kind: Some(failure.kind()),
                        message: failure.to_string(),
                    });
                }
            }
        }

        info!(%run_id, phase = %RunPhase::Staging, "run phase");
        let writer = StagingWriter::new(self.warehouse.clone());
        let mut growth = Vec::new();
        for (source, entry) in stats.iter_mut() {
            let batch = batches.remove(source).unwrap_or_default();
            if !batch.is_empty() {
                match writer.append(run_id, *source, &batch).await {
                    Ok(written) => entry.appended_rows = written,
                    Err(err) => {
                        warn!(%run_id, %source, error = %err, "staging write failed");
                        entry.staging_error = Some(err.to_string());
                        for technology in staged_by.remove(source).unwrap_or_default() {
                            failures.push(FailureRecord {
                                technology,
                                source: *source,
                                phase: RunPhase::Staging,
                                kind: None,
                                message: err.to_string(),
                            });
                        }
                    }
                }
            }
            match writer.stats(*source, entry.appended_rows).await {
                Ok(stat) => {
                    entry.total_rows = Some(stat.total_rows);
                    growth.push(stat);
                }
                Err(err) => warn!(%run_id, %source, error = %err, "could not count staging rows"),
            }
        }
        self.observe_growth(run_id, &growth);

        info!(%run_id, phase = %RunPhase::Materializing, "run phase");
        let (materialization, aborted_reason) =
            match DatamartBuilder::new(self.warehouse.clone()).rebuild(run_id).await {
                Ok(outcome) => (Some(outcome), None),
                Err(err) => {
                    warn!(%run_id, error = %err, "datamart rebuild failed; previous snapshot kept");
                    (None, Some(err.to_string()))
                }
            };

        let status = match (&aborted_reason, failures.is_empty()) {
            (Some(_), _) => RunStatus::Aborted,
            (None, true) => RunStatus::Done,
            (None, false) => RunStatus::PartialFailure,
        };
        match status {
            RunStatus::Done => info!(%run_id, phase = %RunPhase::Done, "run phase"),
            RunStatus::PartialFailure => {
                info!(%run_id, phase = %RunPhase::PartialFailure, failures = failures.len(), "run phase")
            }
            RunStatus::Aborted => warn!(%run_id, "run aborted"),
        }

        RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            technologies: self.registry.technologies().len(),
            sources: stats.into_values().collect(),
            failures,
            materialization,
            aborted_reason,
        }
    }

    async fn fetch_all(&self, ctx: &FetchContext, deadline: Instant) -> Vec<FetchOutcome> {
        let active: Vec<(Arc<dyn SourceConnector>, Vec<Technology>)> = self
            .connectors
            .iter()
            .map(|c| (c.clone(), self.registry.technologies_for(c.source())))
            .filter(|(_, technologies)| !technologies.is_empty())
            .collect();

        // First fatal failure per connector; once set, its remaining
        // technologies are not attempted.
        let fatal: Vec<OnceLock<String>> = active.iter().map(|_| OnceLock::new()).collect();

        for (slot, (connector, technologies)) in active.iter().enumerate() {
            let source = connector.source();
            match timeout_at(deadline, connector.prepare(ctx, technologies)).await {
                Ok(Ok(())) => {}
                Ok(Err(failure)) if failure.is_fatal() => {
                    warn!(run_id = %ctx.run_id, %source, error = %failure, "connector failed fatally during preparation");
                    let _ = fatal[slot].set(failure.to_string());
                }
                Ok(Err(failure)) => {
                    warn!(run_id = %ctx.run_id, %source, error = %failure, "batch preparation failed; fetching per technology");
                }
                Err(_) => warn!(run_id = %ctx.run_id, %source, "run deadline reached during preparation"),
            }
        }

        let jobs: Vec<(usize, Arc<dyn SourceConnector>, Technology)> = active
            .iter()
            .enumerate()
            .flat_map(|(slot, (connector, technologies))| {
                technologies.iter().map(move |t| (slot, connector.clone(), t.clone()))
            })
            .collect();
        let fatal = &fatal;

        // Futures are built up front (they stay lazy until polled) so the
        // stream does not carry a closure type through Send inference.
        let futures: Vec<BoxFuture<'_, FetchOutcome>> = jobs
            .into_iter()
            .map(|(slot, connector, technology)| {
                async move {
                    let source = connector.source();
                    let result = match fatal[slot].get() {
                        Some(reason) => Err(SourceFailure::fatal(format!(
                            "connector stopped after a fatal failure: {reason}"
                        ))),
                        None if Instant::now() >= deadline => {
                            Err(SourceFailure::transient("run deadline exceeded before fetch"))
                        }
                        None => match timeout_at(deadline, connector.fetch(ctx, &technology)).await {
                            Ok(result) => result,
                            Err(_) => Err(SourceFailure::transient("run deadline exceeded")),
                        },
                    };
                    let result = match result {
                        Ok(records) => Ok(self.keep_relevant(source, &technology, records)),
                        Err(failure) => {
                            if failure.is_fatal() {
                                let _ = fatal[slot].set(failure.to_string());
                            }
                            Err(failure)
                        }
                    };
                    FetchOutcome {
                        source,
                        technology,
                        result,
                    }
                }
                .boxed()
            })
            .collect();

        stream::iter(futures)
            .buffer_unordered(self.options.fetch_concurrency.max(1))
            .collect()
            .await
    }

    /// Drops records for another source or technology, and metrics the
    /// registry does not keep for this source.
    fn keep_relevant(
        &self,
        source: SourceTag,
        technology: &Technology,
        records: Vec<RawMetricRecord>,
    ) -> Vec<RawMetricRecord> {
        let total = records.len();
        let kept: Vec<RawMetricRecord> = records
            .into_iter()
            .filter(|r| {
                r.source == source
                    && r.technology == technology.name
                    && self.registry.keeps_metric(source, &r.metric)
            })
            .collect();
        if kept.len() != total {
            debug!(
                technology = %technology.name,
                %source,
                dropped = total - kept.len(),
                "dropped records outside the registry projection"
            );
        }
        kept
    }

    fn observe_growth(&self, run_id: Uuid, stats: &[StagingStats]) {
        if let Err(err) = self.retention.observe(stats) {
            warn!(%run_id, error = %err, "retention hook failed");
        }
    }
}
