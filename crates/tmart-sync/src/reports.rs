use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tmart_storage::Warehouse;
use tokio::fs;
use tracing::{error, info};

use crate::export::export_datamart_parquet;
use crate::pipeline::{RunStatus, RunSummary};

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "run_brief.md";

/// Writes `<reports_root>/<run_id>/run_summary.json` and `run_brief.md`.
pub async fn write_run_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    fs::write(run_dir.join(BRIEF_FILE), render_brief(summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(run_dir)
}

/// Reports plus a Parquet export of the datamart the run left behind.
pub async fn publish_run(
    reports_root: &Path,
    summary: &RunSummary,
    warehouse: &dyn Warehouse,
) -> Result<PathBuf> {
    let run_dir = write_run_reports(reports_root, summary).await?;
    if let Some(snapshot) = warehouse
        .read_datamart()
        .await
        .context("reading datamart for export")?
    {
        let manifest = export_datamart_parquet(&run_dir, &snapshot)?;
        info!(run_id = %summary.run_id, manifest = %manifest.display(), "exported datamart snapshot");
    }
    Ok(run_dir)
}

/// Publishing is reporting only; a failure here is logged and never changes
/// the outcome of the run it describes.
pub async fn publish_or_log(reports_root: &Path, summary: &RunSummary, warehouse: &dyn Warehouse) {
    match publish_run(reports_root, summary, warehouse).await {
        Ok(run_dir) => info!(run_id = %summary.run_id, reports = %run_dir.display(), "run published"),
        Err(err) => error!(
            run_id = %summary.run_id,
            error = %format!("{err:#}"),
            "publishing run reports failed"
        ),
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Done => "done",
        RunStatus::PartialFailure => "partial failure",
        RunStatus::Aborted => "aborted",
    }
}

pub fn render_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Technology Metrics Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Status: {}", status_label(summary.status)),
        format!("- Technologies tracked: {}", summary.technologies),
    ];
    if let Some(reason) = &summary.aborted_reason {
        lines.push(format!("- Aborted: {reason}"));
    }
    if let Some(outcome) = &summary.materialization {
        lines.push(format!(
            "- Datamart: {} technologies, {} metrics from {} staging rows",
            outcome.technologies, outcome.metrics, outcome.staging_rows
        ));
    }

    lines.push(String::new());
    lines.push("## Sources".to_string());
    lines.push(String::new());
    lines.push("| source | technologies | ok | failed | records | appended | staging rows |".to_string());
    lines.push("|---|---|---|---|---|---|---|".to_string());
    for s in &summary.sources {
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} |",
            s.source,
            s.technologies,
            s.succeeded,
            s.failed,
            s.fetched_records,
            s.appended_rows,
            s.total_rows.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string()),
        ));
    }

    if !summary.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        lines.push(String::new());
        lines.push("| technology | source | phase | kind | message |".to_string());
        lines.push("|---|---|---|---|---|".to_string());
        for f in &summary.failures {
            lines.push(format!(
                "| {} | {} | {} | {} | {} |",
                f.technology,
                f.source,
                f.phase,
                f.kind.map(|k| k.as_str()).unwrap_or("staging"),
                f.message.replace('|', "\\|"),
            ));
        }
    }

    if let Some(outcome) = summary.materialization.as_ref().filter(|o| !o.errors.is_empty()) {
        lines.push(String::new());
        lines.push("## Skipped Metrics".to_string());
        lines.push(String::new());
        for err in &outcome.errors {
            lines.push(format!("- {err}"));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Run summaries found under `reports_root`, newest first, at most `limit`.
/// A missing reports directory means no runs yet.
pub fn recent_run_summaries(reports_root: &Path, limit: usize) -> Result<Vec<(RunSummary, PathBuf)>> {
    let entries = match std::fs::read_dir(reports_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_root.display()));
        }
    };

    let mut summaries = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path().join(SUMMARY_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push((summary, entry.path()));
    }
    summaries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));
    summaries.truncate(limit);
    Ok(summaries)
}

/// Markdown digest of the `runs` most recent run summaries under
/// `reports_root`, newest first.
pub fn report_recent_runs_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let summaries = recent_run_summaries(reports_root, runs.max(1))?;

    let mut lines = vec!["# Recent Technology Metrics Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (summary, dir) in summaries {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- status: {}", status_label(summary.status)));
        lines.push(format!("- failures: {}", summary.failures.len()));
        if let Some(outcome) = &summary.materialization {
            lines.push(format!(
                "- datamart: {} technologies / {} metrics",
                outcome.technologies, outcome.metrics
            ));
        }
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(format!("- brief: `{}`", dir.join(BRIEF_FILE).display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
