//! Ingest Service - Loads state education spreadsheets into the database
//!
//! Responsibilities:
//! - Read configured datasets (CSV and workbook sources, one file per year)
//! - Normalize values and resolve entity names against the database
//! - Merge rows reported under legacy entity spellings
//! - Build a deferred statement sequence, cached per dataset
//! - Execute statements, skipping duplicates on re-runs
//!
//! CRITICAL: Parsing must be DETERMINISTIC
//! Same source files + same config = same statement sequence

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use ingest::cache::CacheStore;
use ingest::config::ImportConfig;
use ingest::execute::{execute_sequence, ExecutionPolicy, ExecutionReport, PgSink};
use ingest::pipeline::run_dataset;
use ingest::statement::Statement;
use ingest::store::PgEntityStore;

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Loads education statistics spreadsheets")]
struct Args {
    /// Dataset configuration file
    #[arg(long, default_value = "config/datasets.json")]
    config: PathBuf,

    /// Only run this dataset id
    #[arg(long)]
    dataset: Option<String>,

    /// Directory holding the source spreadsheets
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory for cached statement sequences
    #[arg(long, default_value = ".cache")]
    cache_dir: PathBuf,

    /// Dry run - build statements but don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Ignore cached statements and rebuild from source files
    #[arg(long, default_value = "false")]
    refresh: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;

    println!("=== Education Statistics Ingest ===");
    println!("Started: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!("Config: {}", args.config.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let config = ImportConfig::load(&args.config)?;
    let cache = CacheStore::new(&args.cache_dir);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;
    let store = PgEntityStore::new(pool.clone());

    let mut totals = ExecutionReport::default();
    for dataset in &config.datasets {
        if let Some(only) = &args.dataset {
            if &dataset.id != only {
                continue;
            }
        }

        println!("\n=== Dataset: {} ===", dataset.name);

        if args.refresh {
            cache.remove(&dataset.id)?;
        }

        let statements: Vec<Statement> = match cache.load(&dataset.id)? {
            Some(cached) => {
                println!(
                    "Loaded {} statements from cache ({})",
                    cached.len(),
                    cache.path_for(&dataset.id).display()
                );
                println!("Warning: cached statements may be stale; use --refresh to rebuild");
                cached
            }
            None => {
                let output = run_dataset(dataset, &args.data_dir, &store).await?;

                println!("Files read: {}", output.stats.files_read);
                println!("Files skipped: {}", output.stats.files_skipped);
                println!("Rows seen: {}", output.stats.rows_seen);
                println!("Rows skipped: {}", output.stats.rows_skipped);
                println!("Facts built: {}", output.stats.facts_built);
                println!("Merged facts: {}", output.stats.merged_facts);
                println!("Subgroups created: {}", output.stats.subgroups_created);
                if !output.unresolved.is_empty() {
                    println!(
                        "\n{} names could not be resolved:",
                        output.unresolved.total()
                    );
                    print!("{}", output.unresolved.render());
                }

                cache.save(&dataset.id, &output.statements)?;
                println!(
                    "Cached {} statements at {}",
                    output.statements.len(),
                    cache.path_for(&dataset.id).display()
                );
                output.statements
            }
        };

        if args.dry_run {
            println!("Dry run - {} statements not executed", statements.len());
            continue;
        }

        // Reference rows abort the dataset on failure; fact rows are
        // best-effort so one bad row doesn't sink the rest.
        let reference_tables = dataset.reference_tables();
        let split = statements
            .iter()
            .position(|s| !reference_tables.contains(&s.table.as_str()))
            .unwrap_or(statements.len());
        let (reference, facts) = statements.split_at(split);

        let mut sink = PgSink::new(pool.clone());
        let mut report = execute_sequence(&mut sink, reference, ExecutionPolicy::FailFast).await?;
        report.merge(execute_sequence(&mut sink, facts, ExecutionPolicy::BestEffort).await?);

        println!("Executed: {}", report.executed);
        println!("Skipped (duplicate): {}", report.skipped);
        if !report.ok() {
            println!("Failed: {}", report.failures.len());
            for failure in report.failures.iter().take(5) {
                println!("  {} -> {}", failure.statement.excerpt(80), failure.error);
            }
        }
        totals.merge(report);
    }

    println!("\n=== Ingest Complete ===");
    println!("Statements executed: {}", totals.executed);
    println!("Duplicates skipped: {}", totals.skipped);
    if !totals.ok() {
        println!("Failures: {}", totals.failures.len());
    }

    Ok(())
}
