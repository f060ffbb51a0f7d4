//! Source connector contract and the two connector implementations.
//!
//! A connector turns one tracked technology into a set of
//! [`RawMetricRecord`]s from one external system. Rate limiting, pagination
//! and credential renewal stay inside the connector; callers only see
//! records or a [`SourceFailure`].

mod github;
mod pypi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tmart_core::{RawMetricRecord, SourceTag, Technology};
use tmart_storage::{FetchError, RawResponseArchive};
use tracing::warn;
use uuid::Uuid;

pub use github::{parse_repository_metrics, GithubConnector};
pub use pypi::{
    downloads_query_body, normalize_package_name, parse_query_response, AccessTokenProvider,
    DownloadCounts, JobReference, PypiConnector, QueryState, ServiceAccountTokenProvider,
    StaticAccessToken,
};

pub const CRATE_NAME: &str = "tmart-connectors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    RateLimited,
    Transient,
    Fatal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
        }
    }
}

/// Outcome of a failed connector call for one technology.
///
/// Only [`SourceFailure::Fatal`] stops the connector for the rest of the run;
/// the others are recorded against the technology and the run moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceFailure {
    #[error("`{identifier}` is unknown to the source")]
    NotFound { identifier: String },
    #[error("rate limited: {message}")]
    RateLimited { message: String },
    #[error("transient failure: {message}")]
    Transient { message: String },
    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl SourceFailure {
    pub fn not_found(identifier: impl Into<String>) -> Self {
        SourceFailure::NotFound {
            identifier: identifier.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SourceFailure::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        SourceFailure::Fatal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SourceFailure::NotFound { .. } => FailureKind::NotFound,
            SourceFailure::RateLimited { .. } => FailureKind::RateLimited,
            SourceFailure::Transient { .. } => FailureKind::Transient,
            SourceFailure::Fatal { .. } => FailureKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceFailure::Fatal { .. })
    }

    /// Maps a transport error that survived the fetcher's retry budget.
    pub fn from_fetch_error(err: &FetchError, identifier: &str) -> Self {
        match err {
            FetchError::HttpStatus { status: 404, .. } => Self::not_found(identifier),
            FetchError::HttpStatus { status: 401, url, .. } => {
                Self::fatal(format!("credential rejected by {url}"))
            }
            FetchError::HttpStatus {
                status: status @ (403 | 429),
                url,
                ..
            } => SourceFailure::RateLimited {
                message: format!("http {status} from {url} after retries"),
            },
            FetchError::HttpStatus { status, url, body, .. } if (400..500).contains(status) => {
                Self::fatal(format!("http {status} from {url}: {body}"))
            }
            FetchError::HttpStatus { status, url, .. } => {
                Self::transient(format!("http {status} from {url}"))
            }
            FetchError::Request(err) => Self::transient(err.to_string()),
            FetchError::Closed => Self::transient("http fetcher closed"),
        }
    }
}

/// Per-run context handed to every connector call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self { run_id }
    }
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source(&self) -> SourceTag;

    /// Called once per run with every technology tracked by this source,
    /// before any [`SourceConnector::fetch`]. Connectors that can serve the
    /// whole run from one request do it here.
    async fn prepare(
        &self,
        _ctx: &FetchContext,
        _technologies: &[Technology],
    ) -> Result<(), SourceFailure> {
        Ok(())
    }

    /// Fetches all available metrics of one technology. Metrics the source
    /// cannot provide for this technology are simply missing from the result.
    async fn fetch(
        &self,
        ctx: &FetchContext,
        technology: &Technology,
    ) -> Result<Vec<RawMetricRecord>, SourceFailure>;
}

/// Best-effort archive of a raw response body; failures are only logged.
pub(crate) async fn archive_body(
    archive: Option<&RawResponseArchive>,
    source: SourceTag,
    body: &[u8],
) {
    let Some(archive) = archive else {
        return;
    };
    if let Err(err) = archive
        .store(chrono::Utc::now(), source.as_str(), "json", body)
        .await
    {
        warn!(%source, error = %err, "failed to archive raw response");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    use axum::Router;

    pub fn fixture(path: &str) -> Vec<u8> {
        let full = workspace_root().join("fixtures").join(path);
        std::fs::read(&full).unwrap_or_else(|e| panic!("reading {}: {e}", full.display()))
    }

    pub fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    pub async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}
