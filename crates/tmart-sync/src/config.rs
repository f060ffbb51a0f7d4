use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tmart_core::{ConfigError, SourceTag};
use tmart_storage::{TokenBucketConfig, WarehouseTarget};

use crate::registry::Registry;

pub const DEFAULT_REGISTRY_PATH: &str = "./technologies.yaml";
pub const DEFAULT_WAREHOUSE_DIR: &str = "./warehouse";
pub const DEFAULT_REPORTS_DIR: &str = "./reports";
pub const DEFAULT_SCHEDULER_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_BIND: &str = "127.0.0.1:8088";

/// Credentials for the external sources. Which of them are required depends
/// on the sources the registry enables; see [`SyncConfig::require_credentials`].
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub github_token: Option<String>,
    pub gcp_project: Option<String>,
    pub gcp_credentials: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub registry_path: PathBuf,
    pub warehouse: WarehouseTarget,
    pub reports_dir: PathBuf,
    pub raw_archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Request budget shared by every source; unset means unthrottled.
    pub http_requests_per_minute: Option<u32>,
    pub run_timeout_secs: u64,
    pub fetch_concurrency: usize,
    pub staging_warn_rows: Option<u64>,
    pub scheduler_cron: String,
    pub bind: String,
    pub credentials: Credentials,
}

impl SyncConfig {
    /// Reads the process environment, after loading `.env` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let warehouse = match (var("TMART_WAREHOUSE_URL"), var("TMART_WAREHOUSE_DIR")) {
            (Some(url), _) if url == "memory" => WarehouseTarget::Memory,
            (Some(url), _) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
                WarehouseTarget::Postgres(url)
            }
            (Some(url), _) => {
                return Err(ConfigError::InvalidValue {
                    field: "TMART_WAREHOUSE_URL".to_string(),
                    reason: format!("unsupported warehouse url `{url}`"),
                })
            }
            (None, Some(dir)) => WarehouseTarget::Directory(PathBuf::from(dir)),
            (None, None) => WarehouseTarget::Directory(PathBuf::from(DEFAULT_WAREHOUSE_DIR)),
        };

        Ok(Self {
            registry_path: var("TMART_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_PATH)),
            warehouse,
            reports_dir: var("TMART_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORTS_DIR)),
            raw_archive_dir: var("TMART_RAW_ARCHIVE_DIR").map(PathBuf::from),
            user_agent: var("TMART_USER_AGENT").unwrap_or_else(|| "tmart/0.1".to_string()),
            http_timeout_secs: parse_or("TMART_HTTP_TIMEOUT_SECS", var("TMART_HTTP_TIMEOUT_SECS"), 20)?,
            http_requests_per_minute: match var("TMART_HTTP_REQUESTS_PER_MINUTE") {
                Some(raw) => match parse_value::<u32>("TMART_HTTP_REQUESTS_PER_MINUTE", &raw)? {
                    0 => {
                        return Err(ConfigError::InvalidValue {
                            field: "TMART_HTTP_REQUESTS_PER_MINUTE".to_string(),
                            reason: "must be at least 1".to_string(),
                        })
                    }
                    n => Some(n),
                },
                None => None,
            },
            run_timeout_secs: parse_or("TMART_RUN_TIMEOUT_SECS", var("TMART_RUN_TIMEOUT_SECS"), 600)?,
            fetch_concurrency: parse_or::<usize>("TMART_FETCH_CONCURRENCY", var("TMART_FETCH_CONCURRENCY"), 8)?
                .max(1),
            staging_warn_rows: var("TMART_STAGING_WARN_ROWS")
                .map(|raw| parse_value("TMART_STAGING_WARN_ROWS", &raw))
                .transpose()?,
            scheduler_cron: var("TMART_SCHEDULER_CRON")
                .unwrap_or_else(|| DEFAULT_SCHEDULER_CRON.to_string()),
            bind: var("TMART_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            credentials: Credentials {
                github_token: var("GITHUB_TOKEN"),
                gcp_project: var("GOOGLE_CLOUD_PROJECT"),
                gcp_credentials: var("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from),
            },
        })
    }

    /// Token bucket holding one minute of requests, refilled one token at a
    /// time.
    pub fn token_bucket(&self) -> Option<TokenBucketConfig> {
        self.http_requests_per_minute.map(|per_minute| TokenBucketConfig {
            capacity: per_minute,
            refill_every: Duration::from_secs(60) / per_minute,
        })
    }

    /// Fails when a source the registry enables has no credential.
    pub fn require_credentials(&self, registry: &Registry) -> Result<(), ConfigError> {
        if registry.is_active(SourceTag::Github) && self.credentials.github_token.is_none() {
            return Err(ConfigError::MissingVar("GITHUB_TOKEN".to_string()));
        }
        if registry.is_active(SourceTag::Pypi) {
            if self.credentials.gcp_project.is_none() {
                return Err(ConfigError::MissingVar("GOOGLE_CLOUD_PROJECT".to_string()));
            }
            if self.credentials.gcp_credentials.is_none() {
                return Err(ConfigError::MissingVar(
                    "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(field: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: format!("`{raw}`: {e}"),
    })
}

fn parse_or<T: FromStr>(field: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => parse_value(field, &raw),
        None => Ok(default),
    }
}
