//! Staging and datamart storage.
//!
//! Staging is append-only: backends only ever insert, never update or delete,
//! and report rows back in physical insertion order. The datamart is a single
//! snapshot that is replaced as a whole; readers observe either the previous
//! snapshot or the new one, never a mixture.

mod file;
mod memory;
mod postgres;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tmart_core::{DatamartSnapshot, RawMetricRecord, SourceTag, StagingRow};
use uuid::Uuid;

pub use file::FileWarehouse;
pub use memory::MemoryWarehouse;
pub use postgres::{PgWarehouse, PoolConfig};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{found} record passed to the {expected} staging table")]
    SourceMismatch {
        expected: SourceTag,
        found: SourceTag,
    },
    #[error("corrupt warehouse data: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Short human-readable description of the backend, for logs.
    fn describe(&self) -> String;

    /// Appends `records` to the staging table of `source`. Never reads,
    /// updates or deletes existing rows; identical records appended twice
    /// produce two rows.
    async fn append_staging(
        &self,
        source: SourceTag,
        run_id: Uuid,
        records: &[RawMetricRecord],
    ) -> Result<usize, WarehouseError>;

    /// Every staging row of every source, each source in insertion order.
    async fn staging_rows(&self) -> Result<Vec<StagingRow>, WarehouseError>;

    async fn staging_row_count(&self, source: SourceTag) -> Result<u64, WarehouseError>;

    /// Atomically replaces the datamart with `snapshot`.
    async fn replace_datamart(&self, snapshot: &DatamartSnapshot) -> Result<(), WarehouseError>;

    /// The current datamart snapshot, `None` before the first rebuild.
    async fn read_datamart(&self) -> Result<Option<DatamartSnapshot>, WarehouseError>;
}

pub(crate) fn check_sources(source: SourceTag, records: &[RawMetricRecord]) -> Result<(), WarehouseError> {
    match records.iter().find(|r| r.source != source) {
        Some(record) => Err(WarehouseError::SourceMismatch {
            expected: source,
            found: record.source,
        }),
        None => Ok(()),
    }
}

/// Where the warehouse lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseTarget {
    Postgres(String),
    Directory(PathBuf),
    Memory,
}

impl WarehouseTarget {
    /// Opens the backend. Postgres targets are migrated before use.
    pub async fn open(&self) -> Result<Arc<dyn Warehouse>, WarehouseError> {
        match self {
            WarehouseTarget::Postgres(url) => {
                let warehouse = PgWarehouse::connect(url, PoolConfig::default()).await?;
                warehouse.migrate().await?;
                Ok(Arc::new(warehouse))
            }
            WarehouseTarget::Directory(root) => Ok(Arc::new(FileWarehouse::new(root.clone()))),
            WarehouseTarget::Memory => Ok(Arc::new(MemoryWarehouse::new())),
        }
    }
}
