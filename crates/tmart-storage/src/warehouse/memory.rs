use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tmart_core::{DatamartSnapshot, RawMetricRecord, SourceTag, StagingRow};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{check_sources, Warehouse, WarehouseError};

/// In-process warehouse. The datamart is held behind an `Arc` that a rebuild
/// swaps in one step.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    staging: Mutex<BTreeMap<SourceTag, Vec<StagingRow>>>,
    datamart: RwLock<Option<Arc<DatamartSnapshot>>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an already-encoded row as-is, assigning the next `seq`. Used to
    /// replay staging exports and to seed rows whose value no longer decodes.
    pub async fn insert_raw_staging_row(&self, mut row: StagingRow) -> u64 {
        let mut staging = self.staging.lock().await;
        let table = staging.entry(row.source).or_default();
        row.seq = table.len() as u64 + 1;
        let seq = row.seq;
        table.push(row);
        seq
    }

    /// Shared handle to the current snapshot.
    pub async fn datamart_handle(&self) -> Option<Arc<DatamartSnapshot>> {
        self.datamart.read().await.clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn append_staging(
        &self,
        source: SourceTag,
        run_id: Uuid,
        records: &[RawMetricRecord],
    ) -> Result<usize, WarehouseError> {
        check_sources(source, records)?;
        let mut staging = self.staging.lock().await;
        let table = staging.entry(source).or_default();
        for record in records {
            let seq = table.len() as u64 + 1;
            table.push(StagingRow::from_record(seq, run_id, record));
        }
        Ok(records.len())
    }

    async fn staging_rows(&self) -> Result<Vec<StagingRow>, WarehouseError> {
        let staging = self.staging.lock().await;
        Ok(staging.values().flatten().cloned().collect())
    }

    async fn staging_row_count(&self, source: SourceTag) -> Result<u64, WarehouseError> {
        let staging = self.staging.lock().await;
        Ok(staging.get(&source).map_or(0, |rows| rows.len() as u64))
    }

    async fn replace_datamart(&self, snapshot: &DatamartSnapshot) -> Result<(), WarehouseError> {
        let next = Arc::new(snapshot.clone());
        *self.datamart.write().await = Some(next);
        Ok(())
    }

    async fn read_datamart(&self) -> Result<Option<DatamartSnapshot>, WarehouseError> {
        Ok(self.datamart.read().await.as_deref().cloned())
    }
}
