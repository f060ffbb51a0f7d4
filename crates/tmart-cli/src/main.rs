use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tmart_core::SourceTag;
use tmart_sync::{near_duplicates, Registry, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tmart")]
#[command(about = "Technology metrics mart: fetch, stage and materialize technology metrics")]
struct Cli {
    /// Debug-level logging unless TMART_LOG says otherwise.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Errors only unless TMART_LOG says otherwise.
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and publish reports.
    Sync,
    /// Rebuild the datamart from stored staging without fetching.
    Rebuild,
    /// Apply warehouse schema migrations.
    Migrate,
    /// Load and validate the technology registry.
    Registry {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Summarize recent runs as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Serve the read-only datamart API.
    Serve,
    /// Run the pipeline on the configured cron schedule until Ctrl-C.
    Schedule,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let fallback = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env("TMART_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli.command.unwrap_or(Commands::Sync)).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Sync => {
            let summary = tmart_sync::run_sync_once_from_env().await?;
            println!(
                "sync {}: run_id={} technologies={} failures={} staged={}",
                match summary.status {
                    tmart_sync::RunStatus::Done => "complete",
                    tmart_sync::RunStatus::PartialFailure => "partially failed",
                    tmart_sync::RunStatus::Aborted => "aborted",
                },
                summary.run_id,
                summary.technologies,
                summary.failures.len(),
                summary.sources.iter().map(|s| s.appended_rows).sum::<usize>(),
            );
            Ok(ExitCode::from(summary.exit_code() as u8))
        }
        Commands::Rebuild => {
            let outcome = tmart_sync::rebuild_from_env().await?;
            println!(
                "datamart rebuilt: run_id={} technologies={} metrics={} skipped={}",
                outcome.run_id,
                outcome.technologies,
                outcome.metrics,
                outcome.errors.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate => {
            tmart_sync::migrate_from_env().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Registry { path } => {
            let path = match path {
                Some(path) => path,
                None => SyncConfig::from_env()?.registry_path,
            };
            let registry = Registry::load(&path)
                .await
                .with_context(|| format!("validating {}", path.display()))?;
            print_registry(&registry);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env()?;
            let markdown = tmart_sync::report_recent_runs_markdown(&config.reports_dir, runs)?;
            println!("{markdown}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve => {
            tmart_web::serve_from_env().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            tmart_sync::run_scheduler_from_env().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_registry(registry: &Registry) {
    println!("registry {} is valid", registry.path().display());
    for tag in SourceTag::ALL {
        if let Some(settings) = registry.settings(tag) {
            println!(
                "  source {tag}: {} ({} metrics, {} technologies)",
                if settings.enabled { "enabled" } else { "disabled" },
                settings.metrics.len(),
                registry.technologies_for(tag).len(),
            );
        }
    }
    for technology in registry.technologies() {
        println!(
            "  {:<24} github={:<32} pypi={}",
            technology.name,
            technology.github_repository.as_deref().unwrap_or("-"),
            technology.pypi_package.as_deref().unwrap_or("-"),
        );
    }
    for (a, b, score) in near_duplicates(registry.technologies()) {
        println!("  warning: `{a}` and `{b}` look alike ({score:.3})");
    }
}
