//! Core domain model for the technology metrics mart.
//!
//! Everything here is plain data: tracked technologies, the per-source metric
//! records connectors produce, the append-only staging rows those records
//! become, and the latest-value datamart derived from staging.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tmart-core";

/// Metrics produced by the repository-metrics source.
pub const GITHUB_METRICS: &[&str] = &[
    "github_repository",
    "language",
    "stars",
    "forks",
    "watchers",
    "open_issues",
    "size_kb",
    "created_at",
    "updated_at",
    "total_contributors",
    "total_commits",
    "commits_last_year",
    "commits_last_month",
];

/// Metrics produced by the package-downloads source.
pub const PYPI_METRICS: &[&str] = &[
    "pypi_name",
    "total_downloads_alltime",
    "downloads_last_month",
    "downloads_last_year",
];

/// External system a metric was observed in.
///
/// The declaration order is also the merge order when a datamart row is
/// assembled across sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Github,
    Pypi,
}

impl SourceTag {
    pub const ALL: [SourceTag; 2] = [SourceTag::Github, SourceTag::Pypi];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::Github => "github",
            SourceTag::Pypi => "pypi",
        }
    }

    /// Name of the append-only staging table owned by this source.
    pub fn staging_table(self) -> &'static str {
        match self {
            SourceTag::Github => "staging_github_repo_metrics",
            SourceTag::Pypi => "staging_pypi_download_stats",
        }
    }

    pub fn metric_catalog(self) -> &'static [&'static str] {
        match self {
            SourceTag::Github => GITHUB_METRICS,
            SourceTag::Pypi => PYPI_METRICS,
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(SourceTag::Github),
            "pypi" => Ok(SourceTag::Pypi),
            other => Err(format!("unknown source `{other}`")),
        }
    }
}

/// Canonical form of a technology name.
///
/// Names are the only join key between sources, staging and the datamart, so
/// this is the single place where spelling differences are folded away:
/// surrounding whitespace is trimmed, ASCII letters are lowercased and runs of
/// whitespace, `_` or `-` collapse to one `-`.
pub fn canonical_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() || ch == '_' || ch == '-' {
            pending_separator = true;
            continue;
        }
        if pending_separator && !out.is_empty() {
            out.push('-');
        }
        pending_separator = false;
        out.push(ch.to_ascii_lowercase());
    }
    out
}

/// A tracked technology as declared in the registry. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Technology {
    /// Canonical name; see [`canonical_name`].
    pub name: String,
    pub display_name: String,
    /// `owner/repo` on the code-hosting platform.
    pub github_repository: Option<String>,
    pub pypi_package: Option<String>,
}

impl Technology {
    pub fn new(display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        Self {
            name: canonical_name(&display_name),
            display_name,
            github_repository: None,
            pypi_package: None,
        }
    }

    pub fn with_github(mut self, repository: impl Into<String>) -> Self {
        self.github_repository = Some(repository.into());
        self
    }

    pub fn with_pypi(mut self, package: impl Into<String>) -> Self {
        self.pypi_package = Some(package.into());
        self
    }

    /// Identifier of this technology within `source`, if it is tracked there.
    pub fn identifier(&self, source: SourceTag) -> Option<&str> {
        match source {
            SourceTag::Github => self.github_repository.as_deref(),
            SourceTag::Pypi => self.pypi_package.as_deref(),
        }
    }
}

/// Splits an `owner/repo` path. Both halves must be non-empty and there must
/// be exactly one slash.
pub fn split_repository(path: &str) -> Option<(&str, &str)> {
    let (owner, repo) = path.trim().split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner, repo))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Integer,
    Float,
    Text,
    Timestamp,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Timestamp => "timestamp",
        }
    }
}

impl FromStr for ValueKind {
    type Err = ValueDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" => Ok(ValueKind::Integer),
            "float" => Ok(ValueKind::Float),
            "text" => Ok(ValueKind::Text),
            "timestamp" => Ok(ValueKind::Timestamp),
            other => Err(ValueDecodeError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueDecodeError {
    #[error("unknown value kind `{0}`")]
    UnknownKind(String),
    #[error("`{value}` is not a valid {kind}: {reason}")]
    Invalid {
        kind: &'static str,
        value: String,
        reason: String,
    },
}

/// Typed metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl MetricValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            MetricValue::Integer(_) => ValueKind::Integer,
            MetricValue::Float(_) => ValueKind::Float,
            MetricValue::Text(_) => ValueKind::Text,
            MetricValue::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    /// Text encoding used by staging storage.
    pub fn encode(&self) -> String {
        match self {
            MetricValue::Integer(v) => v.to_string(),
            MetricValue::Float(v) => v.to_string(),
            MetricValue::Text(v) => v.clone(),
            MetricValue::Timestamp(v) => v.to_rfc3339(),
        }
    }

    pub fn decode(kind: &str, text: &str) -> Result<Self, ValueDecodeError> {
        let kind: ValueKind = kind.parse()?;
        let invalid = |reason: String| ValueDecodeError::Invalid {
            kind: kind.as_str(),
            value: text.to_string(),
            reason,
        };
        match kind {
            ValueKind::Integer => text
                .trim()
                .parse::<i64>()
                .map(MetricValue::Integer)
                .map_err(|e| invalid(e.to_string())),
            ValueKind::Float => {
                let v = text.trim().parse::<f64>().map_err(|e| invalid(e.to_string()))?;
                if v.is_finite() {
                    Ok(MetricValue::Float(v))
                } else {
                    Err(invalid("not finite".to_string()))
                }
            }
            ValueKind::Text => Ok(MetricValue::Text(text.to_string())),
            ValueKind::Timestamp => DateTime::parse_from_rfc3339(text.trim())
                .map(|t| MetricValue::Timestamp(t.with_timezone(&Utc)))
                .map_err(|e| invalid(e.to_string())),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// One observation from one source for one technology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetricRecord {
    pub technology: String,
    pub source: SourceTag,
    pub metric: String,
    pub value: MetricValue,
    /// Capture time, stamped by the connector once the response parsed.
    pub observed_at: DateTime<Utc>,
}

impl RawMetricRecord {
    pub fn new(
        technology: impl Into<String>,
        source: SourceTag,
        metric: impl Into<String>,
        value: MetricValue,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            technology: technology.into(),
            source,
            metric: metric.into(),
            value,
            observed_at,
        }
    }
}

/// A persisted staging row. `seq` is the physical insertion order within the
/// source's staging table and breaks ties between equal `observed_at` values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRow {
    pub seq: u64,
    pub run_id: Uuid,
    pub source: SourceTag,
    pub technology: String,
    pub metric: String,
    pub value_kind: String,
    pub value: String,
    pub observed_at: DateTime<Utc>,
}

impl StagingRow {
    pub fn from_record(seq: u64, run_id: Uuid, record: &RawMetricRecord) -> Self {
        Self {
            seq,
            run_id,
            source: record.source,
            technology: record.technology.clone(),
            metric: record.metric.clone(),
            value_kind: record.value.kind().as_str().to_string(),
            value: record.value.encode(),
            observed_at: record.observed_at,
        }
    }

    pub fn decode_value(&self) -> Result<MetricValue, ValueDecodeError> {
        MetricValue::decode(&self.value_kind, &self.value)
    }
}

/// The selected value of one metric in the datamart, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatamartCell {
    pub source: SourceTag,
    pub value: MetricValue,
    pub observed_at: DateTime<Utc>,
    /// Staging `seq` of the row the value was taken from.
    pub staging_seq: u64,
}

/// One wide row per technology. A metric that has never been observed is
/// absent from `metrics`, never defaulted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatamartRow {
    pub technology: String,
    pub metrics: BTreeMap<String, DatamartCell>,
}

impl DatamartRow {
    pub fn new(technology: impl Into<String>) -> Self {
        Self {
            technology: technology.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn get(&self, metric: &str) -> Option<&MetricValue> {
        self.metrics.get(metric).map(|cell| &cell.value)
    }
}

/// The complete datamart as produced by one rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatamartSnapshot {
    pub run_id: Uuid,
    pub built_at: DateTime<Utc>,
    /// Sorted by technology name.
    pub rows: Vec<DatamartRow>,
}

impl DatamartSnapshot {
    pub fn row(&self, technology: &str) -> Option<&DatamartRow> {
        self.rows
            .binary_search_by(|row| row.technology.as_str().cmp(technology))
            .ok()
            .map(|idx| &self.rows[idx])
    }

    /// Number of (technology, metric) pairs.
    pub fn metric_count(&self) -> usize {
        self.rows.iter().map(|row| row.metrics.len()).sum()
    }
}

/// Fatal pre-flight errors: bad registry or missing process configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("missing required environment variable {0}")]
    MissingVar(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("duplicate technology `{name}` (entries {first} and {second})")]
    DuplicateTechnology {
        name: String,
        first: usize,
        second: usize,
    },
    #[error("invalid technology entry {index}: {reason}")]
    InvalidTechnology { index: usize, reason: String },
    #[error("metric `{metric}` is enabled for both {first} and {second}")]
    MetricCollision {
        metric: String,
        first: SourceTag,
        second: SourceTag,
    },
    #[error("source {tag} does not produce metric `{metric}`")]
    UnknownMetric { tag: SourceTag, metric: String },
    #[error("registry lists no technologies")]
    EmptyRegistry,
}
