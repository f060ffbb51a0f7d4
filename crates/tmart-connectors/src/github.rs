use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tmart_core::{split_repository, MetricValue, RawMetricRecord, SourceTag, Technology};
use tmart_storage::{HttpFetcher, HttpRequest, RawResponseArchive};
use tracing::{debug, warn};

use crate::{archive_body, FetchContext, SourceConnector, SourceFailure};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
/// Weeks summed into `commits_last_month`.
const RECENT_WEEKS: usize = 4;

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: Option<String>,
    language: Option<String>,
    stargazers_count: Option<i64>,
    forks_count: Option<i64>,
    watchers_count: Option<i64>,
    open_issues_count: Option<i64>,
    size: Option<i64>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WeeklyTotal {
    #[serde(default)]
    total: i64,
}

/// Repository metrics from the code-hosting REST API.
#[derive(Debug, Clone)]
pub struct GithubConnector {
    http: Arc<HttpFetcher>,
    token: String,
    api_base: String,
    archive: Option<RawResponseArchive>,
}

impl GithubConnector {
    pub fn new(http: Arc<HttpFetcher>, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            archive: None,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_archive(mut self, archive: RawResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    fn request(&self, path: &str) -> HttpRequest {
        HttpRequest::get(format!("{}{path}", self.api_base))
            .bearer(self.token.clone())
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Statistics endpoints answer 202 while the numbers are being computed.
    /// Anything but a 200 leaves the dependent metrics out of this run.
    async fn fetch_stats(&self, ctx: &FetchContext, owner: &str, repo: &str, kind: &str) -> Option<Vec<u8>> {
        let request = self.request(&format!("/repos/{owner}/{repo}/stats/{kind}"));
        match self.http.fetch(ctx.run_id, SourceTag::Github.as_str(), &request).await {
            Ok(response) if response.status.as_u16() == 200 => {
                archive_body(self.archive.as_ref(), SourceTag::Github, &response.body).await;
                Some(response.body)
            }
            Ok(response) => {
                debug!(owner, repo, kind, status = response.status.as_u16(), "statistics not ready");
                None
            }
            Err(err) => {
                debug!(owner, repo, kind, error = %err, "statistics unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl SourceConnector for GithubConnector {
    fn source(&self) -> SourceTag {
        SourceTag::Github
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        technology: &Technology,
    ) -> Result<Vec<RawMetricRecord>, SourceFailure> {
        let Some(repository) = technology.github_repository.as_deref() else {
            return Ok(Vec::new());
        };
        let (owner, repo) = split_repository(repository)
            .ok_or_else(|| SourceFailure::not_found(repository))?;

        let response = self
            .http
            .fetch(ctx.run_id, SourceTag::Github.as_str(), &self.request(&format!("/repos/{owner}/{repo}")))
            .await
            .map_err(|err| SourceFailure::from_fetch_error(&err, repository))?;
        archive_body(self.archive.as_ref(), SourceTag::Github, &response.body).await;

        let contributors = self.fetch_stats(ctx, owner, repo, "contributors").await;
        let commit_activity = self.fetch_stats(ctx, owner, repo, "commit_activity").await;

        parse_repository_metrics(
            &technology.name,
            repository,
            &response.body,
            contributors.as_deref(),
            commit_activity.as_deref(),
            Utc::now(),
        )
    }
}

/// Builds the repository metric records from the raw response bodies.
///
/// A malformed repository body is a transient failure. Malformed or missing
/// statistics bodies only drop the metrics derived from them.
pub fn parse_repository_metrics(
    technology: &str,
    repository: &str,
    repository_body: &[u8],
    contributors_body: Option<&[u8]>,
    commit_activity_body: Option<&[u8]>,
    observed_at: DateTime<Utc>,
) -> Result<Vec<RawMetricRecord>, SourceFailure> {
    let payload: RepositoryPayload = serde_json::from_slice(repository_body).map_err(|err| {
        SourceFailure::transient(format!("malformed repository response for {repository}: {err}"))
    })?;

    let mut values: Vec<(&str, MetricValue)> = vec![(
        "github_repository",
        MetricValue::Text(payload.full_name.unwrap_or_else(|| repository.to_string())),
    )];
    if let Some(language) = payload.language {
        values.push(("language", MetricValue::Text(language)));
    }
    let counts = [
        ("stars", payload.stargazers_count),
        ("forks", payload.forks_count),
        ("watchers", payload.watchers_count),
        ("open_issues", payload.open_issues_count),
        ("size_kb", payload.size),
    ];
    for (metric, count) in counts {
        if let Some(count) = count {
            values.push((metric, MetricValue::Integer(count)));
        }
    }
    if let Some(created_at) = payload.created_at {
        values.push(("created_at", MetricValue::Timestamp(created_at)));
    }
    if let Some(updated_at) = payload.updated_at {
        values.push(("updated_at", MetricValue::Timestamp(updated_at)));
    }

    if let Some(contributors) = contributors_body.and_then(|body| parse_weekly(repository, "contributors", body)) {
        values.push(("total_contributors", MetricValue::Integer(contributors.len() as i64)));
        values.push((
            "total_commits",
            MetricValue::Integer(contributors.iter().map(|c| c.total).sum()),
        ));
    }
    if let Some(weeks) = commit_activity_body.and_then(|body| parse_weekly(repository, "commit_activity", body)) {
        values.push((
            "commits_last_year",
            MetricValue::Integer(weeks.iter().map(|w| w.total).sum()),
        ));
        let recent = &weeks[weeks.len().saturating_sub(RECENT_WEEKS)..];
        values.push((
            "commits_last_month",
            MetricValue::Integer(recent.iter().map(|w| w.total).sum()),
        ));
    }

    Ok(values
        .into_iter()
        .map(|(metric, value)| RawMetricRecord::new(technology, SourceTag::Github, metric, value, observed_at))
        .collect())
}

fn parse_weekly(repository: &str, kind: &str, body: &[u8]) -> Option<Vec<WeeklyTotal>> {
    match serde_json::from_slice(body) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(repository, kind, error = %err, "ignoring malformed statistics response");
            None
        }
    }
}
