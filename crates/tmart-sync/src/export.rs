use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tmart_core::DatamartSnapshot;

pub const SNAPSHOT_DIR: &str = "snapshots";
pub const DATAMART_PARQUET: &str = "tech_metrics.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub datamart_run_id: String,
    pub built_at: String,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes the datamart as one long-format Parquet file (one row per
/// technology and metric) under `<run_dir>/snapshots/`, plus a checksummed
/// manifest. Returns the manifest path.
pub fn export_datamart_parquet(run_dir: &Path, snapshot: &DatamartSnapshot) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join(SNAPSHOT_DIR);
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let parquet_path = snapshot_dir.join(DATAMART_PARQUET);
    let rows = write_tech_metrics_parquet(&parquet_path, snapshot)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        datamart_run_id: snapshot.run_id.to_string(),
        built_at: snapshot.built_at.to_rfc3339(),
        files: vec![manifest_entry("tech_metrics", run_dir, &parquet_path, rows)?],
    };
    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_tech_metrics_parquet(path: &Path, snapshot: &DatamartSnapshot) -> Result<usize> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("technology", DataType::Utf8, false),
        Field::new("metric", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("value_kind", DataType::Utf8, false),
        Field::new("value", DataType::Utf8, false),
        Field::new("int_value", DataType::Int64, true),
        Field::new("observed_at", DataType::Utf8, false),
        Field::new("staging_seq", DataType::UInt64, false),
    ]));

    let cells: Vec<_> = snapshot
        .rows
        .iter()
        .flat_map(|row| {
            row.metrics
                .iter()
                .map(move |(metric, cell)| (row.technology.as_str(), metric.as_str(), cell))
        })
        .collect();

    let technologies = StringArray::from(cells.iter().map(|(t, _, _)| *t).collect::<Vec<_>>());
    let metrics = StringArray::from(cells.iter().map(|(_, m, _)| *m).collect::<Vec<_>>());
    let sources = StringArray::from(
        cells
            .iter()
            .map(|(_, _, c)| c.source.as_str())
            .collect::<Vec<_>>(),
    );
    let kinds = StringArray::from(
        cells
            .iter()
            .map(|(_, _, c)| c.value.kind().as_str())
            .collect::<Vec<_>>(),
    );
    let values = StringArray::from(cells.iter().map(|(_, _, c)| c.value.encode()).collect::<Vec<_>>());
    let ints = Int64Array::from(cells.iter().map(|(_, _, c)| c.value.as_i64()).collect::<Vec<_>>());
    let observed = StringArray::from(
        cells
            .iter()
            .map(|(_, _, c)| c.observed_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );
    let seqs = UInt64Array::from(cells.iter().map(|(_, _, c)| c.staging_seq).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(technologies),
            Arc::new(metrics),
            Arc::new(sources),
            Arc::new(kinds),
            Arc::new(values),
            Arc::new(ints),
            Arc::new(observed),
            Arc::new(seqs),
        ],
    )
    .context("building tech_metrics record batch")?;
    write_parquet(path, batch)?;
    Ok(cells.len())
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}
