use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tmart_core::{RawMetricRecord, SourceTag};
use tmart_storage::{Warehouse, WarehouseError};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("staging append to {tag} failed: {error}")]
pub struct StagingWriteError {
    pub tag: SourceTag,
    #[source]
    pub error: WarehouseError,
}

/// Appends connector output to the per-source staging tables.
///
/// Every call inserts every record it is given, even when an identical row
/// already exists; history is never rewritten.
#[derive(Clone)]
pub struct StagingWriter {
    warehouse: Arc<dyn Warehouse>,
}

impl StagingWriter {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub async fn append(
        &self,
        run_id: Uuid,
        source: SourceTag,
        records: &[RawMetricRecord],
    ) -> Result<usize, StagingWriteError> {
        let written = self
            .warehouse
            .append_staging(source, run_id, records)
            .await
            .map_err(|error| StagingWriteError { tag: source, error })?;
        debug!(%run_id, %source, written, "appended staging rows");
        Ok(written)
    }

    pub async fn stats(&self, source: SourceTag, appended: usize) -> Result<StagingStats, WarehouseError> {
        Ok(StagingStats {
            source,
            appended,
            total_rows: self.warehouse.staging_row_count(source).await?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StagingStats {
    pub source: SourceTag,
    pub appended: usize,
    pub total_rows: u64,
}

/// Observes staging growth after each run's Staging phase. Retention and
/// compaction are operated outside this system; hooks only look.
pub trait RetentionHook: Send + Sync {
    fn observe(&self, stats: &[StagingStats]) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct NoopRetentionHook;

impl RetentionHook for NoopRetentionHook {
    fn observe(&self, _stats: &[StagingStats]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Warns when a staging table grows past a row threshold.
pub struct GrowthWarningHook {
    pub warn_above_rows: u64,
}

impl GrowthWarningHook {
    pub fn new(warn_above_rows: u64) -> Self {
        Self { warn_above_rows }
    }

    pub fn over_threshold(&self, stats: &[StagingStats]) -> Vec<SourceTag> {
        stats
            .iter()
            .filter(|s| s.total_rows > self.warn_above_rows)
            .map(|s| s.source)
            .collect()
    }
}

impl RetentionHook for GrowthWarningHook {
    fn observe(&self, stats: &[StagingStats]) -> anyhow::Result<()> {
        for stat in stats.iter().filter(|s| s.total_rows > self.warn_above_rows) {
            warn!(
                source = %stat.source,
                table = stat.source.staging_table(),
                total_rows = stat.total_rows,
                threshold = self.warn_above_rows,
                "staging table exceeds retention threshold"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tmart_core::MetricValue;
    use tmart_storage::MemoryWarehouse;

    fn record(source: SourceTag, metric: &str) -> RawMetricRecord {
        RawMetricRecord::new("duckdb", source, metric, MetricValue::Integer(1), Utc::now())
    }

    #[tokio::test]
    async fn repeated_appends_grow_staging() {
        let writer = StagingWriter::new(Arc::new(MemoryWarehouse::new()));
        let batch = vec![record(SourceTag::Github, "stars"), record(SourceTag::Github, "forks")];
        assert_eq!(writer.append(Uuid::new_v4(), SourceTag::Github, &batch).await.unwrap(), 2);
        assert_eq!(writer.append(Uuid::new_v4(), SourceTag::Github, &batch).await.unwrap(), 2);

        let stats = writer.stats(SourceTag::Github, 2).await.unwrap();
        assert_eq!(stats.total_rows, 4);
    }

    #[tokio::test]
    async fn append_errors_name_the_source() {
        let writer = StagingWriter::new(Arc::new(MemoryWarehouse::new()));
        let err = writer
            .append(Uuid::nil(), SourceTag::Pypi, &[record(SourceTag::Github, "stars")])
            .await
            .unwrap_err();
        assert_eq!(err.tag, SourceTag::Pypi);
        assert!(err.to_string().contains("pypi"));
    }

    #[test]
    fn growth_hook_flags_only_large_tables() {
        let hook = GrowthWarningHook::new(10);
        let stats = [
            StagingStats { source: SourceTag::Github, appended: 5, total_rows: 11 },
            StagingStats { source: SourceTag::Pypi, appended: 5, total_rows: 10 },
        ];
        assert_eq!(hook.over_threshold(&stats), vec![SourceTag::Github]);
        assert!(hook.observe(&stats).is_ok());
        assert!(NoopRetentionHook.observe(&stats).is_ok());
    }
}
