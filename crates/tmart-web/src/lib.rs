//! Read-only JSON API over the current datamart snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tmart_core::{canonical_name, DatamartRow, DatamartSnapshot};
use tmart_storage::Warehouse;
use tmart_sync::{recent_run_summaries, RunSummary, SyncConfig};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "tmart-web";

#[derive(Clone)]
pub struct AppState {
    pub warehouse: Arc<dyn Warehouse>,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(warehouse: Arc<dyn Warehouse>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            warehouse,
            reports_dir: reports_dir.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    warehouse: String,
}

#[derive(Debug, Serialize)]
struct DatamartInfo {
    run_id: String,
    built_at: String,
    technologies: usize,
    metrics: usize,
}

#[derive(Debug, Serialize)]
struct TechnologiesBody<'a> {
    run_id: String,
    built_at: String,
    rows: &'a [DatamartRow],
}

#[derive(Debug, Serialize)]
struct TechnologyBody<'a> {
    run_id: String,
    built_at: String,
    row: &'a DatamartRow,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/datamart", get(datamart_handler))
        .route("/technologies", get(technologies_handler))
        .route("/technologies/{name}", get(technology_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(bind, warehouse = %state.warehouse.describe(), "serving datamart api");
    axum::serve(listener, app(state)).await.context("serving http")?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let warehouse = config.warehouse.open().await.context("opening warehouse")?;
    serve(&config.bind, AppState::new(warehouse, config.reports_dir.clone())).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(HealthBody {
        status: "ok",
        warehouse: state.warehouse.describe(),
    })
    .into_response()
}

async fn datamart_handler(State(state): State<Arc<AppState>>) -> Response {
    match current_snapshot(&state).await {
        Ok(Some(snapshot)) => Json(DatamartInfo {
            run_id: snapshot.run_id.to_string(),
            built_at: snapshot.built_at.to_rfc3339(),
            technologies: snapshot.rows.len(),
            metrics: snapshot.metric_count(),
        })
        .into_response(),
        Ok(None) => not_built(),
        Err(err) => server_error(err),
    }
}

async fn technologies_handler(State(state): State<Arc<AppState>>) -> Response {
    match current_snapshot(&state).await {
        Ok(Some(snapshot)) => Json(TechnologiesBody {
            run_id: snapshot.run_id.to_string(),
            built_at: snapshot.built_at.to_rfc3339(),
            rows: &snapshot.rows,
        })
        .into_response(),
        Ok(None) => not_built(),
        Err(err) => server_error(err),
    }
}

async fn technology_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let snapshot = match current_snapshot(&state).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return not_built(),
        Err(err) => return server_error(err),
    };
    let key = canonical_name(&name);
    match snapshot.row(&key) {
        Some(row) => Json(TechnologyBody {
            run_id: snapshot.run_id.to_string(),
            built_at: snapshot.built_at.to_rfc3339(),
            row,
        })
        .into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("technology `{key}` is not in the datamart"),
        ),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    match recent_run_summaries(&state.reports_dir, limit) {
        Ok(runs) => Json(runs.into_iter().map(|(summary, _)| summary).collect::<Vec<RunSummary>>())
            .into_response(),
        Err(err) => server_error(err),
    }
}

/// One read per request, so a response never mixes two snapshots.
async fn current_snapshot(state: &AppState) -> anyhow::Result<Option<DatamartSnapshot>> {
    state
        .warehouse
        .read_datamart()
        .await
        .context("reading datamart")
}

fn not_built() -> Response {
    error_response(StatusCode::NOT_FOUND, "datamart has not been built yet".to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use tmart_core::{DatamartCell, MetricValue, SourceTag};
    use tmart_storage::MemoryWarehouse;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn seeded_state() -> AppState {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let at = Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).single().unwrap();
        let mut row = DatamartRow::new("great-expectations");
        row.metrics.insert(
            "stars".to_string(),
            DatamartCell {
                source: SourceTag::Github,
                value: MetricValue::Integer(10_100),
                observed_at: at,
                staging_seq: 1,
            },
        );
        warehouse
            .replace_datamart(&DatamartSnapshot {
                run_id: Uuid::new_v4(),
                built_at: at,
                rows: vec![row],
            })
            .await
            .unwrap();
        AppState::new(warehouse, std::env::temp_dir().join("tmart-web-no-reports"))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let (status, body) = get_json(app(seeded_state().await), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["warehouse"], "memory");
    }

    #[tokio::test]
    async fn datamart_metadata_and_rows() {
        let app = app(seeded_state().await);
        let (status, info) = get_json(app.clone(), "/datamart").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["technologies"], 1);
        assert_eq!(info["metrics"], 1);

        let (status, all) = get_json(app, "/technologies").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all["run_id"], info["run_id"]);
        assert_eq!(all["rows"][0]["metrics"]["stars"]["value"]["value"], 10_100);
    }

    #[tokio::test]
    async fn technology_lookup_canonicalizes_the_name() {
        let app = app(seeded_state().await);
        let (status, body) = get_json(app.clone(), "/technologies/Great%20Expectations").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["row"]["technology"], "great-expectations");

        let (status, body) = get_json(app, "/technologies/kafka").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("kafka"));
    }

    #[tokio::test]
    async fn unbuilt_datamart_is_not_found() {
        let state = AppState::new(Arc::new(MemoryWarehouse::new()), std::env::temp_dir());
        let (status, _) = get_json(app(state), "/datamart").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn runs_lists_published_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let state = seeded_state().await;
        let state = AppState::new(state.warehouse, dir.path());
        let (status, body) = get_json(app(state), "/runs?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 0);
    }
}
