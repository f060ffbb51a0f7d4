use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tmart_core::{MetricValue, RawMetricRecord, SourceTag, Technology};
use tmart_storage::{HttpFetcher, HttpRequest, RawResponseArchive};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{archive_body, FetchContext, SourceConnector, SourceFailure};

pub const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com";
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Server-side wait per query or poll request; kept below the HTTP timeout.
const QUERY_WAIT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(2);
/// Tokens are renewed this long before the issuer's expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

const DOWNLOADS_QUERY: &str = r#"
SELECT
  file.project AS pypi_name,
  COUNT(*) AS total_downloads_alltime,
  COUNTIF(DATE(timestamp) BETWEEN DATE_SUB(CURRENT_DATE(), INTERVAL 4 WEEK) AND CURRENT_DATE()) AS downloads_last_month,
  COUNTIF(DATE(timestamp) BETWEEN DATE_SUB(CURRENT_DATE(), INTERVAL 1 YEAR) AND CURRENT_DATE()) AS downloads_last_year
FROM `bigquery-public-data.pypi.file_downloads`
WHERE file.project IN UNNEST(@packages)
GROUP BY pypi_name
ORDER BY pypi_name
"#;

/// Normalized project name as the download dataset records it: lowercase,
/// with runs of `-`, `_` and `.` folded into one `-`.
pub fn normalize_package_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for ch in raw.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            pending_separator = true;
            continue;
        }
        if pending_separator && !out.is_empty() {
            out.push('-');
        }
        pending_separator = false;
        out.extend(ch.to_lowercase());
    }
    out
}

/// Request body for the downloads query over `packages`.
pub fn downloads_query_body(packages: &[String]) -> JsonValue {
    let values: Vec<JsonValue> = packages.iter().map(|p| json!({ "value": p })).collect();
    json!({
        "query": DOWNLOADS_QUERY,
        "useLegacySql": false,
        "parameterMode": "NAMED",
        "timeoutMs": QUERY_WAIT_MS,
        "queryParameters": [{
            "name": "packages",
            "parameterType": { "type": "ARRAY", "arrayType": { "type": "STRING" } },
            "parameterValue": { "arrayValues": values }
        }]
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCounts {
    pub total_downloads_alltime: i64,
    pub downloads_last_month: i64,
    pub downloads_last_year: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
}

/// Identifies a query job that is still running.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReference {
    pub job_id: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// A query response either carries the result or names the job to poll.
#[derive(Debug, PartialEq)]
pub enum QueryState {
    Complete(BTreeMap<String, DownloadCounts>),
    Running(JobReference),
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Option<JsonValue>,
}

/// Parses a query or poll response. An unfinished job without a job
/// reference cannot be polled and is reported as transient.
pub fn parse_query_response(body: &[u8]) -> Result<QueryState, SourceFailure> {
    let malformed = |reason: String| SourceFailure::transient(format!("malformed query response: {reason}"));

    let response: QueryResponse = serde_json::from_slice(body).map_err(|e| malformed(e.to_string()))?;
    if !response.job_complete {
        return match response.job_reference {
            Some(job) => Ok(QueryState::Running(job)),
            None => Err(SourceFailure::transient("query is still running and has no job reference")),
        };
    }
    let Some(schema) = response.schema else {
        return Ok(QueryState::Complete(BTreeMap::new()));
    };

    let column = |name: &str| {
        schema
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| malformed(format!("missing column {name}")))
    };
    let name_col = column("pypi_name")?;
    let total_col = column("total_downloads_alltime")?;
    let month_col = column("downloads_last_month")?;
    let year_col = column("downloads_last_year")?;

    let mut out = BTreeMap::new();
    for row in &response.rows {
        let cell = |idx: usize| row.f.get(idx).and_then(|c| c.v.as_ref());
        let count = |idx: usize| -> Result<i64, SourceFailure> {
            match cell(idx) {
                Some(JsonValue::String(s)) => s.parse().map_err(|_| malformed(format!("`{s}` is not a count"))),
                Some(JsonValue::Number(n)) => n.as_i64().ok_or_else(|| malformed(format!("`{n}` is not a count"))),
                _ => Ok(0),
            }
        };
        let Some(JsonValue::String(name)) = cell(name_col) else {
            return Err(malformed("row without pypi_name".to_string()));
        };
        out.insert(
            normalize_package_name(name),
            DownloadCounts {
                total_downloads_alltime: count(total_col)?,
                downloads_last_month: count(month_col)?,
                downloads_last_year: count(year_col)?,
            },
        );
    }
    Ok(QueryState::Complete(out))
}

/// Supplies bearer tokens for the query API.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self, ctx: &FetchContext) -> Result<String, SourceFailure>;
}

#[derive(Debug, Clone)]
pub struct StaticAccessToken(pub String);

#[async_trait]
impl AccessTokenProvider for StaticAccessToken {
    async fn access_token(&self, _ctx: &FetchContext) -> Result<String, SourceFailure> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
    #[serde(default)]
    private_key_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges a signed service-account assertion for an access token and
/// reuses it until shortly before it expires.
pub struct ServiceAccountTokenProvider {
    http: Arc<HttpFetcher>,
    key: ServiceAccountKey,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokenProvider {
    pub fn from_json(http: Arc<HttpFetcher>, json: &str) -> anyhow::Result<Self> {
        let key: ServiceAccountKey =
            serde_json::from_str(json).context("parsing service account key")?;
        Ok(Self {
            http,
            key,
            cached: Mutex::new(None),
        })
    }

    pub async fn from_file(http: Arc<HttpFetcher>, path: &Path) -> anyhow::Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading service account key {}", path.display()))?;
        Self::from_json(http, &json)
    }

    pub fn with_token_uri(mut self, token_uri: impl Into<String>) -> Self {
        self.key.token_uri = token_uri.into();
        self
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, SourceFailure> {
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: BIGQUERY_SCOPE,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: (now + ChronoDuration::hours(1)).timestamp(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| SourceFailure::fatal(format!("unusable service account key: {e}")))?;
        encode(&header, &claims, &signing_key)
            .map_err(|e| SourceFailure::fatal(format!("signing service account assertion: {e}")))
    }
}

#[async_trait]
impl AccessTokenProvider for ServiceAccountTokenProvider {
    async fn access_token(&self, ctx: &FetchContext) -> Result<String, SourceFailure> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at > now {
                return Ok(token.token.clone());
            }
        }

        let assertion = self.signed_assertion(now)?;
        let request = HttpRequest::post_form(
            self.key.token_uri.clone(),
            vec![
                ("grant_type".to_string(), JWT_BEARER_GRANT.to_string()),
                ("assertion".to_string(), assertion),
            ],
        );
        let response = self
            .http
            .fetch(ctx.run_id, "google-oauth", &request)
            .await
            .map_err(|err| match err.status() {
                Some(400 | 401) => SourceFailure::fatal(format!("token exchange rejected: {err}")),
                _ => SourceFailure::from_fetch_error(&err, &self.key.token_uri),
            })?;
        let parsed: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| SourceFailure::transient(format!("malformed token response: {e}")))?;

        debug!(client = %self.key.client_email, expires_in = parsed.expires_in, "obtained access token");
        let token = parsed.access_token.clone();
        *cached = Some(CachedToken {
            token: parsed.access_token,
            expires_at: now + ChronoDuration::seconds(parsed.expires_in - TOKEN_EXPIRY_MARGIN_SECS),
        });
        Ok(token)
    }
}

#[derive(Debug, Clone)]
struct BatchResult {
    run_id: Uuid,
    counts: BTreeMap<String, DownloadCounts>,
}

/// Package download statistics from the public downloads dataset.
///
/// [`SourceConnector::prepare`] answers the whole run with one query;
/// [`SourceConnector::fetch`] then serves each technology from that result
/// and only queries on its own when no batch exists for the run.
pub struct PypiConnector {
    http: Arc<HttpFetcher>,
    project: String,
    api_base: String,
    tokens: Arc<dyn AccessTokenProvider>,
    archive: Option<RawResponseArchive>,
    poll_interval: StdDuration,
    batch: Mutex<Option<BatchResult>>,
}

impl PypiConnector {
    pub fn new(
        http: Arc<HttpFetcher>,
        project: impl Into<String>,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Self {
        Self {
            http,
            project: project.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            tokens,
            archive: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch: Mutex::new(None),
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

    pub fn with_poll_interval(mut self, interval: StdDuration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn send(&self, ctx: &FetchContext, request: HttpRequest) -> Result<QueryState, SourceFailure> {
        let response = self
            .http
            .fetch(ctx.run_id, SourceTag::Pypi.as_str(), &request)
            .await
            .map_err(|err| SourceFailure::from_fetch_error(&err, &self.project))?;
        archive_body(self.archive.as_ref(), SourceTag::Pypi, &response.body).await;
        parse_query_response(&response.body)
    }

    fn poll_url(&self, job: &JobReference) -> String {
        let mut url = format!(
            "{}/bigquery/v2/projects/{}/queries/{}?timeoutMs={QUERY_WAIT_MS}",
            self.api_base, self.project, job.job_id
        );
        if let Some(location) = &job.location {
            url.push_str("&location=");
            url.push_str(location);
        }
        url
    }

    async fn query(
        &self,
        ctx: &FetchContext,
        packages: &[String],
    ) -> Result<BTreeMap<String, DownloadCounts>, SourceFailure> {
        let token = self.tokens.access_token(ctx).await?;
        let url = format!("{}/bigquery/v2/projects/{}/queries", self.api_base, self.project);
        let request = HttpRequest::post_json(url, downloads_query_body(packages)).bearer(token);
        let mut state = self.send(ctx, request).await?;

        // Polls until the job finishes. The caller's run deadline bounds
        // how long this can take.
        let mut polls = 0u32;
        loop {
            let job = match state {
                QueryState::Complete(counts) => return Ok(counts),
                QueryState::Running(job) => job,
            };
            polls += 1;
            if polls % 10 == 0 {
                warn!(job_id = %job.job_id, polls, "download query is still running");
            } else {
                debug!(job_id = %job.job_id, polls, "download query is still running");
            }
            tokio::time::sleep(self.poll_interval).await;
            let token = self.tokens.access_token(ctx).await?;
            state = self.send(ctx, HttpRequest::get(self.poll_url(&job)).bearer(token)).await?;
        }
    }

    fn records(
        technology: &Technology,
        package: &str,
        counts: DownloadCounts,
        observed_at: DateTime<Utc>,
    ) -> Vec<RawMetricRecord> {
        let values = [
            ("pypi_name", MetricValue::Text(package.to_string())),
            ("total_downloads_alltime", MetricValue::Integer(counts.total_downloads_alltime)),
            ("downloads_last_month", MetricValue::Integer(counts.downloads_last_month)),
            ("downloads_last_year", MetricValue::Integer(counts.downloads_last_year)),
        ];
        values
            .into_iter()
            .map(|(metric, value)| {
                RawMetricRecord::new(&technology.name, SourceTag::Pypi, metric, value, observed_at)
            })
            .collect()
    }
}

#[async_trait]
impl SourceConnector for PypiConnector {
    fn source(&self) -> SourceTag {
        SourceTag::Pypi
    }

    async fn prepare(
        &self,
        ctx: &FetchContext,
        technologies: &[Technology],
    ) -> Result<(), SourceFailure> {
        let mut packages: Vec<String> = technologies
            .iter()
            .filter_map(|t| t.pypi_package.as_deref())
            .map(normalize_package_name)
            .collect();
        packages.sort();
        packages.dedup();
        if packages.is_empty() {
            return Ok(());
        }

        let counts = self.query(ctx, &packages).await?;
        info!(requested = packages.len(), found = counts.len(), "batched download query complete");
        *self.batch.lock().await = Some(BatchResult {
            run_id: ctx.run_id,
            counts,
        });
        Ok(())
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        technology: &Technology,
    ) -> Result<Vec<RawMetricRecord>, SourceFailure> {
        let Some(raw_package) = technology.pypi_package.as_deref() else {
            return Ok(Vec::new());
        };
        let package = normalize_package_name(raw_package);

        let batched = {
            let batch = self.batch.lock().await;
            batch
                .as_ref()
                .filter(|b| b.run_id == ctx.run_id)
                .map(|b| b.counts.get(&package).copied())
        };
        let counts = match batched {
            Some(found) => found,
            None => self
                .query(ctx, std::slice::from_ref(&package))
                .await?
                .get(&package)
                .copied(),
        };

        match counts {
            Some(counts) => Ok(Self::records(technology, &package, counts, Utc::now())),
            None => Err(SourceFailure::not_found(raw_package)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::extract::{Form, Path as AxumPath, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use tmart_storage::{BackoffPolicy, HttpClientConfig};

    use crate::test_support::{fixture, spawn_server};
    use crate::FailureKind;

    const QUERY_PATH: &str = "/bigquery/v2/projects/test-project/queries";

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(5),
                backoff: BackoffPolicy {
                    max_retries: 1,
                    base_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(10),
                },
                ..HttpClientConfig::default()
            })
            .unwrap(),
        )
    }

    fn static_token() -> Arc<dyn AccessTokenProvider> {
        Arc::new(StaticAccessToken("bq-token".to_string()))
    }

    async fn query_server(hits: Arc<AtomicUsize>) -> String {
        let router = Router::new().route(
            QUERY_PATH,
            post(move |headers: HeaderMap, Json(body): Json<JsonValue>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
                    if auth != Some("Bearer bq-token") {
                        return (StatusCode::UNAUTHORIZED, Vec::new());
                    }
                    assert_eq!(body["useLegacySql"], json!(false));
                    assert_eq!(body["queryParameters"][0]["name"], json!("packages"));
                    (StatusCode::OK, fixture("pypi/downloads_query_response.json"))
                }
            }),
        );
        spawn_server(router).await
    }

    #[test]
    fn package_names_normalize_like_the_index() {
        assert_eq!(normalize_package_name("Great_Expectations"), "great-expectations");
        assert_eq!(normalize_package_name(" zope.interface "), "zope-interface");
        assert_eq!(normalize_package_name("apache-airflow"), "apache-airflow");
        assert_eq!(normalize_package_name("a__-.b"), "a-b");
    }

    #[test]
    fn query_body_binds_packages_as_array_parameter() {
        let body = downloads_query_body(&["duckdb".to_string(), "polars".to_string()]);
        assert!(body["query"].as_str().unwrap().contains("IN UNNEST(@packages)"));
        assert_eq!(
            body["queryParameters"][0]["parameterValue"]["arrayValues"],
            json!([{ "value": "duckdb" }, { "value": "polars" }])
        );
    }

    fn complete(body: &[u8]) -> BTreeMap<String, DownloadCounts> {
        match parse_query_response(body).unwrap() {
            QueryState::Complete(counts) => counts,
            QueryState::Running(job) => panic!("job {} still running", job.job_id),
        }
    }

    #[test]
    fn parses_fixture_rows() {
        let counts = complete(&fixture("pypi/downloads_query_response.json"));
        assert_eq!(counts.len(), 2);
        assert_eq!(
            counts["duckdb"],
            DownloadCounts {
                total_downloads_alltime: 183_204_117,
                downloads_last_month: 9_632_077,
                downloads_last_year: 92_440_310,
            }
        );
    }

    #[test]
    fn running_jobs_name_the_job_to_poll() {
        let running = parse_query_response(
            br#"{"jobComplete": false, "jobReference": {"projectId": "p", "jobId": "job_42", "location": "US"}}"#,
        )
        .unwrap();
        assert_eq!(
            running,
            QueryState::Running(JobReference {
                job_id: "job_42".to_string(),
                location: Some("US".to_string()),
            })
        );

        let orphaned = parse_query_response(br#"{"jobComplete": false}"#).unwrap_err();
        assert_eq!(orphaned.kind(), FailureKind::Transient);
    }

    #[test]
    fn malformed_responses_are_transient() {
        let bad = br#"{"jobComplete": true, "schema": {"fields": [{"name": "pypi_name"}]}, "rows": []}"#;
        assert_eq!(parse_query_response(bad).unwrap_err().kind(), FailureKind::Transient);

        assert!(complete(br#"{"jobComplete": true}"#).is_empty());
    }

    /// Answers the query with a running job and reports it finished after
    /// `pending_polls` polls.
    async fn slow_query_server(
        pending_polls: usize,
        queries: Arc<AtomicUsize>,
        polls: Arc<AtomicUsize>,
    ) -> String {
        let running = json!({
            "jobComplete": false,
            "jobReference": { "projectId": "test-project", "jobId": "job_slow", "location": "US" }
        });
        let submitted = running.clone();
        let router = Router::new()
            .route(
                QUERY_PATH,
                post(move || {
                    let queries = queries.clone();
                    let submitted = submitted.clone();
                    async move {
                        queries.fetch_add(1, Ordering::SeqCst);
                        Json(submitted)
                    }
                }),
            )
            .route(
                &format!("{QUERY_PATH}/{{job_id}}"),
                get(
                    move |AxumPath(job_id): AxumPath<String>,
                          Query(params): Query<HashMap<String, String>>| {
                        let polls = polls.clone();
                        let running = running.clone();
                        async move {
                            assert_eq!(job_id, "job_slow");
                            assert_eq!(params.get("location").map(String::as_str), Some("US"));
                            let seen = polls.fetch_add(1, Ordering::SeqCst) + 1;
                            if seen > pending_polls {
                                (StatusCode::OK, fixture("pypi/downloads_query_response.json"))
                            } else {
                                (StatusCode::OK, serde_json::to_vec(&running).unwrap())
                            }
                        }
                    },
                ),
            );
        spawn_server(router).await
    }

    #[tokio::test]
    async fn running_batch_is_polled_not_resubmitted() {
        let queries = Arc::new(AtomicUsize::new(0));
        let polls = Arc::new(AtomicUsize::new(0));
        let base = slow_query_server(2, queries.clone(), polls.clone()).await;
        let connector = PypiConnector::new(fetcher(), "test-project", static_token())
            .with_api_base(base)
            .with_poll_interval(Duration::from_millis(5));
        let ctx = FetchContext::new(Uuid::new_v4());
        let duckdb = Technology::new("DuckDB").with_pypi("duckdb");
        let polars = Technology::new("Polars").with_pypi("polars");

        connector
            .prepare(&ctx, &[duckdb.clone(), polars.clone()])
            .await
            .unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 3);

        assert_eq!(connector.fetch(&ctx, &duckdb).await.unwrap().len(), 4);
        assert_eq!(connector.fetch(&ctx, &polars).await.unwrap().len(), 4);
        assert_eq!(queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_job_that_never_finishes_keeps_polling_without_new_queries() {
        let queries = Arc::new(AtomicUsize::new(0));
        let polls = Arc::new(AtomicUsize::new(0));
        let base = slow_query_server(usize::MAX, queries.clone(), polls.clone()).await;
        let connector = PypiConnector::new(fetcher(), "test-project", static_token())
            .with_api_base(base)
            .with_poll_interval(Duration::from_millis(5));
        let technologies: Vec<Technology> = ["duckdb", "polars", "dagster"]
            .iter()
            .map(|p| Technology::new(*p).with_pypi(*p))
            .collect();

        let outcome = tokio::time::timeout(
            Duration::from_millis(300),
            connector.prepare(&FetchContext::new(Uuid::new_v4()), &technologies),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(queries.load(Ordering::SeqCst), 1);
        assert!(polls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn prepare_batches_the_run_and_fetch_reuses_it() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = query_server(hits.clone()).await;
        let connector = PypiConnector::new(fetcher(), "test-project", static_token()).with_api_base(base);
        let ctx = FetchContext::new(Uuid::new_v4());

        let duckdb = Technology::new("DuckDB").with_pypi("DuckDB");
        let polars = Technology::new("Polars").with_pypi("polars");
        let missing = Technology::new("Left Pad").with_pypi("left_pad");
        connector
            .prepare(&ctx, &[duckdb.clone(), polars.clone(), missing.clone()])
            .await
            .unwrap();

        let records = connector.fetch(&ctx, &duckdb).await.unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.technology == "duckdb" && r.source == SourceTag::Pypi));
        let last_month = records.iter().find(|r| r.metric == "downloads_last_month").unwrap();
        assert_eq!(last_month.value, MetricValue::Integer(9_632_077));

        connector.fetch(&ctx, &polars).await.unwrap();
        let err = connector.fetch(&ctx, &missing).await.unwrap_err();
        assert_eq!(err, SourceFailure::not_found("left_pad"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_without_batch_queries_one_package() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = query_server(hits.clone()).await;
        let connector = PypiConnector::new(fetcher(), "test-project", static_token()).with_api_base(base);

        let polars = Technology::new("Polars").with_pypi("polars");
        let records = connector
            .fetch(&FetchContext::new(Uuid::new_v4()), &polars)
            .await
            .unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let github_only = Technology::new("Kafka").with_github("apache/kafka");
        let records = connector
            .fetch(&FetchContext::new(Uuid::new_v4()), &github_only)
            .await
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal() {
        let base = query_server(Arc::new(AtomicUsize::new(0))).await;
        let connector = PypiConnector::new(
            fetcher(),
            "test-project",
            Arc::new(StaticAccessToken("wrong".to_string())),
        )
        .with_api_base(base);

        let err = connector
            .prepare(
                &FetchContext::new(Uuid::new_v4()),
                &[Technology::new("DuckDB").with_pypi("duckdb")],
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[derive(Debug, Deserialize)]
    struct TokenForm {
        grant_type: String,
        assertion: String,
    }

    #[derive(Debug, Deserialize)]
    struct DecodedClaims {
        iss: String,
        scope: String,
        aud: String,
    }

    #[tokio::test]
    async fn service_account_assertion_is_signed_and_token_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/token",
            post(move |Form(form): Form<TokenForm>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(form.grant_type, JWT_BEARER_GRANT);
                    Json(json!({
                        "access_token": format!("ya29.{}", form.assertion.len()),
                        "expires_in": 3599,
                        "token_type": "Bearer"
                    }))
                }
            }),
        );
        let base = spawn_server(router).await;
        let token_uri = format!("{base}/token");

        let key_json = String::from_utf8(fixture("pypi/test_service_account.json")).unwrap();
        let provider = ServiceAccountTokenProvider::from_json(fetcher(), &key_json)
            .unwrap()
            .with_token_uri(token_uri.clone());
        let ctx = FetchContext::new(Uuid::new_v4());

        let first = provider.access_token(&ctx).await.unwrap();
        let second = provider.access_token(&ctx).await.unwrap();
        assert!(first.starts_with("ya29."));
        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let assertion = provider.signed_assertion(Utc::now()).unwrap();
        let public_key = fixture("pypi/test_service_account.pub.pem");
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[token_uri.as_str()]);
        let decoded = decode::<DecodedClaims>(
            &assertion,
            &DecodingKey::from_rsa_pem(&public_key).unwrap(),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims.iss, provider.client_email());
        assert_eq!(decoded.claims.scope, BIGQUERY_SCOPE);
        assert_eq!(decoded.claims.aud, token_uri);
        assert_eq!(decoded.header.kid.as_deref(), Some("0123456789abcdef"));
    }

    #[tokio::test]
    async fn garbage_key_material_is_fatal() {
        let json = r#"{"client_email":"x@y","private_key":"not a pem","token_uri":"http://127.0.0.1:9/token"}"#;
        let provider = ServiceAccountTokenProvider::from_json(fetcher(), json).unwrap();
        assert!(provider.signed_assertion(Utc::now()).unwrap_err().is_fatal());
    }
}
