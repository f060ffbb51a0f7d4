use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tmart_core::{DatamartSnapshot, RawMetricRecord, SourceTag, StagingRow};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{check_sources, Warehouse, WarehouseError};
use crate::archive::write_file_atomically;

const DATAMART_FILE: &str = "tech_metrics.json";

/// One JSON line in a staging file. The row's `seq` is its line number.
#[derive(Debug, Serialize, Deserialize)]
struct StagingLine {
    run_id: Uuid,
    technology: String,
    metric: String,
    value_kind: String,
    value: String,
    observed_at: DateTime<Utc>,
}

/// Directory-backed warehouse:
///
/// - `staging/<table>.jsonl`, one append-only file per source
/// - `datamart/tech_metrics.json`, replaced by temp-file + rename
#[derive(Debug)]
pub struct FileWarehouse {
    root: PathBuf,
    append_locks: BTreeMap<SourceTag, Mutex<()>>,
}

impl FileWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            append_locks: SourceTag::ALL.iter().map(|s| (*s, Mutex::new(()))).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_path(&self, source: SourceTag) -> PathBuf {
        self.root
            .join("staging")
            .join(format!("{}.jsonl", source.staging_table()))
    }

    fn datamart_path(&self) -> PathBuf {
        self.root.join("datamart").join(DATAMART_FILE)
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, WarehouseError> {
        match fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(WarehouseError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn read_staging_file(&self, source: SourceTag) -> Result<Vec<StagingRow>, WarehouseError> {
        let path = self.staging_path(source);
        let Some(text) = Self::read_optional(&path).await? else {
            return Ok(Vec::new());
        };

        let mut rows = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let seq = idx as u64 + 1;
            match serde_json::from_str::<StagingLine>(line) {
                Ok(parsed) => rows.push(StagingRow {
                    seq,
                    run_id: parsed.run_id,
                    source,
                    technology: parsed.technology,
                    metric: parsed.metric,
                    value_kind: parsed.value_kind,
                    value: parsed.value,
                    observed_at: parsed.observed_at,
                }),
                Err(err) => {
                    warn!(path = %path.display(), line = seq, error = %err, "skipping unreadable staging line");
                }
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl Warehouse for FileWarehouse {
    fn describe(&self) -> String {
        format!("file:{}", self.root.display())
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

        let mut buffer = Vec::new();
        for record in records {
            let line = StagingLine {
                run_id,
                technology: record.technology.clone(),
                metric: record.metric.clone(),
                value_kind: record.value.kind().as_str().to_string(),
                value: record.value.encode(),
                observed_at: record.observed_at,
            };
            serde_json::to_writer(&mut buffer, &line)?;
            buffer.push(b'\n');
        }

        let path = self.staging_path(source);
        let io_err = |source: std::io::Error| WarehouseError::Io {
            path: path.clone(),
            source,
        };
        let _guard = match self.append_locks.get(&source) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        // A torn last line from an interrupted append must not swallow the
        // first record of this batch.
        if file.metadata().await.map_err(io_err)?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await.map_err(io_err)?;
            file.read_exact(&mut last).await.map_err(io_err)?;
            if last[0] != b'\n' {
                warn!(path = %path.display(), "staging file ends in a torn line; terminating it");
                buffer.insert(0, b'\n');
            }
        }
        file.write_all(&buffer).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        Ok(records.len())
    }

    async fn staging_rows(&self) -> Result<Vec<StagingRow>, WarehouseError> {
        let mut rows = Vec::new();
        for source in SourceTag::ALL {
            rows.extend(self.read_staging_file(source).await?);
        }
        Ok(rows)
    }

    async fn staging_row_count(&self, source: SourceTag) -> Result<u64, WarehouseError> {
        let path = self.staging_path(source);
        let text = Self::read_optional(&path).await?.unwrap_or_default();
        Ok(text.lines().filter(|l| !l.trim().is_empty()).count() as u64)
    }

    async fn replace_datamart(&self, snapshot: &DatamartSnapshot) -> Result<(), WarehouseError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        write_file_atomically(&self.datamart_path(), &bytes).await?;
        Ok(())
    }

    async fn read_datamart(&self) -> Result<Option<DatamartSnapshot>, WarehouseError> {
        match Self::read_optional(&self.datamart_path()).await? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use tmart_core::{DatamartRow, MetricValue};

    fn stars(value: i64, minute: u32) -> RawMetricRecord {
        RawMetricRecord::new(
            "duckdb",
            SourceTag::Github,
            "stars",
            MetricValue::Integer(value),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).single().unwrap(),
        )
    }

    #[tokio::test]
    async fn staging_survives_reopen_in_insertion_order() {
        let dir = tempdir().unwrap();
        {
            let warehouse = FileWarehouse::new(dir.path());
            warehouse
                .append_staging(SourceTag::Github, Uuid::new_v4(), &[stars(100, 1), stars(150, 2)])
                .await
                .unwrap();
        }
        let warehouse = FileWarehouse::new(dir.path());
        warehouse
            .append_staging(SourceTag::Github, Uuid::new_v4(), &[stars(150, 2)])
            .await
            .unwrap();

        let rows = warehouse.staging_rows().await.unwrap();
        assert_eq!(rows.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(rows[1].value, "150");
        assert_eq!(rows[2].value, "150");
        assert_eq!(warehouse.staging_row_count(SourceTag::Github).await.unwrap(), 3);
        assert_eq!(warehouse.staging_row_count(SourceTag::Pypi).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unreadable_lines_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let warehouse = FileWarehouse::new(dir.path());
        warehouse
            .append_staging(SourceTag::Github, Uuid::nil(), &[stars(1, 1)])
            .await
            .unwrap();
        let path = warehouse.staging_path(SourceTag::Github);
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{not json\n");
        std::fs::write(&path, text).unwrap();
        warehouse
            .append_staging(SourceTag::Github, Uuid::nil(), &[stars(2, 2)])
            .await
            .unwrap();

        let rows = warehouse.staging_rows().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].seq, 3);
    }

    #[tokio::test]
    async fn append_after_torn_line_keeps_every_record() {
        let dir = tempdir().unwrap();
        let warehouse = FileWarehouse::new(dir.path());
        warehouse
            .append_staging(SourceTag::Github, Uuid::nil(), &[stars(1, 1)])
            .await
            .unwrap();
        let path = warehouse.staging_path(SourceTag::Github);
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{\"run_id\":\"00000000-");
        std::fs::write(&path, text).unwrap();

        let written = warehouse
            .append_staging(SourceTag::Github, Uuid::nil(), &[stars(2, 2), stars(3, 3)])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let rows = warehouse.staging_rows().await.unwrap();
        let values: Vec<&str> = rows.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["1", "2", "3"]);
        assert_eq!(rows.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn datamart_round_trips_through_replace() {
        let dir = tempdir().unwrap();
        let warehouse = FileWarehouse::new(dir.path());
        assert!(warehouse.read_datamart().await.unwrap().is_none());

        let snapshot = DatamartSnapshot {
            run_id: Uuid::new_v4(),
            built_at: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).single().unwrap(),
            rows: vec![DatamartRow::new("duckdb"), DatamartRow::new("kafka")],
        };
        warehouse.replace_datamart(&snapshot).await.unwrap();
        assert_eq!(warehouse.read_datamart().await.unwrap(), Some(snapshot));
    }
}
