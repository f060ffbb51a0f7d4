use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tmart_core::{
    DatamartCell, DatamartRow, DatamartSnapshot, MetricValue, RawMetricRecord, SourceTag, StagingRow,
};
use tracing::debug;
use uuid::Uuid;

use super::{check_sources, Warehouse, WarehouseError};

/// Rows per multi-value INSERT; keeps bind parameters well under the
/// protocol limit.
const INSERT_CHUNK: usize = 1_000;

const CREATE_SHADOW: &str = r#"
CREATE TABLE tech_metrics_shadow (
    technology   TEXT        NOT NULL,
    metric       TEXT        NOT NULL,
    source       TEXT        NOT NULL,
    value_kind   TEXT        NOT NULL,
    value        TEXT        NOT NULL,
    observed_at  TIMESTAMPTZ NOT NULL,
    staging_seq  BIGINT      NOT NULL,
    run_id       UUID        NOT NULL,
    built_at     TIMESTAMPTZ NOT NULL,
    CONSTRAINT tech_metrics_shadow_pkey PRIMARY KEY (technology, metric)
)"#;

const SWAP_STATEMENTS: [&str; 4] = [
    "ALTER TABLE tech_metrics RENAME TO tech_metrics_retired",
    "DROP TABLE tech_metrics_retired",
    "ALTER TABLE tech_metrics_shadow RENAME TO tech_metrics",
    "ALTER INDEX tech_metrics_shadow_pkey RENAME TO tech_metrics_pkey",
];

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 30,
        }
    }
}

/// Postgres warehouse. The datamart is rebuilt into `tech_metrics_shadow` and
/// renamed over `tech_metrics` inside one transaction, so concurrent readers
/// block on the swap and then see only the new table.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), WarehouseError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn staging_row_from_pg(source: SourceTag, row: &PgRow) -> Result<StagingRow, WarehouseError> {
    let seq: i64 = row.try_get("seq")?;
    Ok(StagingRow {
        seq: u64::try_from(seq)
            .map_err(|_| WarehouseError::Corrupt(format!("negative staging seq {seq}")))?,
        run_id: row.try_get("run_id")?,
        source,
        technology: row.try_get("technology")?,
        metric: row.try_get("metric")?,
        value_kind: row.try_get("value_kind")?,
        value: row.try_get("value")?,
        observed_at: row.try_get("observed_at")?,
    })
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn describe(&self) -> String {
        "postgres".to_string()
    }

    async fn append_staging(
        &self,
        source: SourceTag,
        run_id: Uuid,
        records: &[RawMetricRecord],
    ) -> Result<usize, WarehouseError> {
        check_sources(source, records)?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (run_id, technology, metric, value_kind, value, observed_at) ",
                source.staging_table()
            ));
            qb.push_values(chunk, |mut b, record| {
                b.push_bind(run_id)
                    .push_bind(record.technology.clone())
                    .push_bind(record.metric.clone())
                    .push_bind(record.value.kind().as_str())
                    .push_bind(record.value.encode())
                    .push_bind(record.observed_at);
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn staging_rows(&self) -> Result<Vec<StagingRow>, WarehouseError> {
        let mut out = Vec::new();
        for source in SourceTag::ALL {
            let sql = format!(
                "SELECT seq, run_id, technology, metric, value_kind, value, observed_at FROM {} ORDER BY seq",
                source.staging_table()
            );
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            for row in &rows {
                out.push(staging_row_from_pg(source, row)?);
            }
        }
        Ok(out)
    }

    async fn staging_row_count(&self, source: SourceTag) -> Result<u64, WarehouseError> {
        let sql = format!("SELECT COUNT(*) FROM {}", source.staging_table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn replace_datamart(&self, snapshot: &DatamartSnapshot) -> Result<(), WarehouseError> {
        let cells: Vec<(&str, &str, &DatamartCell)> = snapshot
            .rows
            .iter()
            .flat_map(|row| {
                row.metrics
                    .iter()
                    .map(move |(metric, cell)| (row.technology.as_str(), metric.as_str(), cell))
            })
            .collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DROP TABLE IF EXISTS tech_metrics_shadow")
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_SHADOW).execute(&mut *tx).await?;

        for chunk in cells.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO tech_metrics_shadow \
                 (technology, metric, source, value_kind, value, observed_at, staging_seq, run_id, built_at) ",
            );
            qb.push_values(chunk, |mut b, (technology, metric, cell)| {
                b.push_bind(technology.to_string())
                    .push_bind(metric.to_string())
                    .push_bind(cell.source.as_str())
                    .push_bind(cell.value.kind().as_str())
                    .push_bind(cell.value.encode())
                    .push_bind(cell.observed_at)
                    .push_bind(cell.staging_seq as i64)
                    .push_bind(snapshot.run_id)
                    .push_bind(snapshot.built_at);
            });
            qb.build().execute(&mut *tx).await?;
        }

        for statement in SWAP_STATEMENTS {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        sqlx::query(
            "INSERT INTO datamart_builds (run_id, built_at, technology_count, metric_count) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(snapshot.run_id)
        .bind(snapshot.built_at)
        .bind(snapshot.rows.len() as i64)
        .bind(cells.len() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(run_id = %snapshot.run_id, metrics = cells.len(), "swapped datamart table");
        Ok(())
    }

    async fn read_datamart(&self) -> Result<Option<DatamartSnapshot>, WarehouseError> {
        let rows = sqlx::query(
            "SELECT technology, metric, source, value_kind, value, observed_at, staging_seq, run_id, built_at \
             FROM tech_metrics ORDER BY technology, metric",
        )
        .fetch_all(&self.pool)
        .await?;

        let Some(first) = rows.first() else {
            let latest = sqlx::query(
                "SELECT run_id, built_at FROM datamart_builds ORDER BY id DESC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;
            return match latest {
                Some(build) => Ok(Some(DatamartSnapshot {
                    run_id: build.try_get("run_id")?,
                    built_at: build.try_get("built_at")?,
                    rows: Vec::new(),
                })),
                None => Ok(None),
            };
        };

        let run_id: Uuid = first.try_get("run_id")?;
        let built_at: DateTime<Utc> = first.try_get("built_at")?;
        let mut by_technology: BTreeMap<String, DatamartRow> = BTreeMap::new();
        for row in &rows {
            let technology: String = row.try_get("technology")?;
            let metric: String = row.try_get("metric")?;
            let source: String = row.try_get("source")?;
            let value_kind: String = row.try_get("value_kind")?;
            let value: String = row.try_get("value")?;
            let staging_seq: i64 = row.try_get("staging_seq")?;

            let cell = DatamartCell {
                source: source.parse().map_err(WarehouseError::Corrupt)?,
                value: MetricValue::decode(&value_kind, &value)
                    .map_err(|e| WarehouseError::Corrupt(e.to_string()))?,
                observed_at: row.try_get("observed_at")?,
                staging_seq: staging_seq.max(0) as u64,
            };
            by_technology
                .entry(technology.clone())
                .or_insert_with(|| DatamartRow::new(technology))
                .metrics
                .insert(metric, cell);
        }

        Ok(Some(DatamartSnapshot {
            run_id,
            built_at,
            rows: by_technology.into_values().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Runs only when `TMART_TEST_DATABASE_URL` points at a scratch database.
    async fn scratch_warehouse() -> Option<PgWarehouse> {
        let url = std::env::var("TMART_TEST_DATABASE_URL").ok()?;
        let warehouse = PgWarehouse::connect(&url, PoolConfig::default()).await.ok()?;
        warehouse.migrate().await.ok()?;
        Some(warehouse)
    }

    #[tokio::test]
    async fn swap_replaces_datamart_and_keeps_staging() {
        let Some(warehouse) = scratch_warehouse().await else {
            return;
        };

        let observed_at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let before = warehouse.staging_row_count(SourceTag::Github).await.unwrap();
        let record = RawMetricRecord::new(
            "duckdb",
            SourceTag::Github,
            "stars",
            MetricValue::Integer(150),
            observed_at,
        );
        warehouse
            .append_staging(SourceTag::Github, Uuid::new_v4(), &[record])
            .await
            .unwrap();
        assert_eq!(
            warehouse.staging_row_count(SourceTag::Github).await.unwrap(),
            before + 1
        );

        let mut row = DatamartRow::new("duckdb");
        row.metrics.insert(
            "stars".to_string(),
            DatamartCell {
                source: SourceTag::Github,
                value: MetricValue::Integer(150),
                observed_at,
                staging_seq: 1,
            },
        );
        let snapshot = DatamartSnapshot {
            run_id: Uuid::new_v4(),
            built_at: observed_at,
            rows: vec![row],
        };
        warehouse.replace_datamart(&snapshot).await.unwrap();
        warehouse.replace_datamart(&snapshot).await.unwrap();
        assert_eq!(warehouse.read_datamart().await.unwrap(), Some(snapshot));
    }
}
