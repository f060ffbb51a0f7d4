//! Latest-value materialization of staging into the datamart.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tmart_core::{DatamartCell, DatamartRow, DatamartSnapshot, SourceTag, StagingRow};
use tmart_storage::{Warehouse, WarehouseError};
use tracing::{info, warn};
use uuid::Uuid;

/// A staging value that could not be materialized. The metric is left out of
/// the datamart; the rest of the rebuild carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{technology}/{source_tag}/{metric}: {reason}")]
pub struct MaterializationError {
    pub technology: String,
    #[serde(rename = "source")]
    pub source_tag: SourceTag,
    pub metric: String,
    pub reason: String,
}

type SelectionKey<'a> = (&'a str, SourceTag, &'a str);

/// For each (technology, source, metric), the row with the greatest
/// `observed_at`; equal timestamps go to the later-inserted row.
pub fn select_latest(rows: &[StagingRow]) -> BTreeMap<SelectionKey<'_>, &StagingRow> {
    let mut latest: BTreeMap<SelectionKey<'_>, &StagingRow> = BTreeMap::new();
    for row in rows {
        let key = (row.technology.as_str(), row.source, row.metric.as_str());
        match latest.get(&key) {
            Some(current) if (current.observed_at, current.seq) >= (row.observed_at, row.seq) => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }
    latest
}

/// Computes the datamart from the full staging history.
///
/// Selection happens before decoding: when the latest row of a tuple does not
/// decode, the metric is absent rather than falling back to an older value.
/// Technologies left with no metrics are omitted.
pub fn build_snapshot(
    run_id: Uuid,
    built_at: DateTime<Utc>,
    staging: &[StagingRow],
) -> (DatamartSnapshot, Vec<MaterializationError>) {
    let mut rows: BTreeMap<&str, DatamartRow> = BTreeMap::new();
    let mut errors = Vec::new();

    for ((technology, source, metric), row) in select_latest(staging) {
        let value = match row.decode_value() {
            Ok(value) => value,
            Err(err) => {
                warn!(technology, %source, metric, seq = row.seq, error = %err, "skipping malformed staging value");
                errors.push(MaterializationError {
                    technology: technology.to_string(),
                    source_tag: source,
                    metric: metric.to_string(),
                    reason: err.to_string(),
                });
                continue;
            }
        };

        let target = rows
            .entry(technology)
            .or_insert_with(|| DatamartRow::new(technology));
        let cell = DatamartCell {
            source,
            value,
            observed_at: row.observed_at,
            staging_seq: row.seq,
        };
        if let Some(previous) = target.metrics.insert(metric.to_string(), cell) {
            warn!(
                technology,
                metric,
                kept = %source,
                dropped = %previous.source,
                "metric produced by two sources; later source wins"
            );
        }
    }

    let snapshot = DatamartSnapshot {
        run_id,
        built_at,
        rows: rows.into_values().filter(|r| !r.metrics.is_empty()).collect(),
    };
    (snapshot, errors)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildOutcome {
    pub run_id: Uuid,
    pub built_at: DateTime<Utc>,
    pub staging_rows: usize,
    pub technologies: usize,
    pub metrics: usize,
    pub errors: Vec<MaterializationError>,
}

/// Reads all of staging and atomically replaces the datamart.
#[derive(Clone)]
pub struct DatamartBuilder {
    warehouse: Arc<dyn Warehouse>,
}

impl DatamartBuilder {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub async fn rebuild(&self, run_id: Uuid) -> Result<RebuildOutcome, WarehouseError> {
        let staging = self.warehouse.staging_rows().await?;
        let built_at = Utc::now();
        let (snapshot, errors) = build_snapshot(run_id, built_at, &staging);
        self.warehouse.replace_datamart(&snapshot).await?;

        let outcome = RebuildOutcome {
            run_id,
            built_at,
            staging_rows: staging.len(),
            technologies: snapshot.rows.len(),
            metrics: snapshot.metric_count(),
            errors,
        };
        info!(
            %run_id,
            staging_rows = outcome.staging_rows,
            technologies = outcome.technologies,
            metrics = outcome.metrics,
            skipped = outcome.errors.len(),
            "datamart rebuilt"
        );
        Ok(outcome)
    }
}
