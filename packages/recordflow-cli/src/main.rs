//! `recordflow` command line: load a JSONL export of facility records and
//! run the enrichment pipeline against a local SQLite ledger.

use anyhow::{bail, Context, Result};
use clap::Parser;
use recordflow_orchestration::{
    open_pipeline_db, BackoffPolicy, Pricing, RateLimiterSet, RunController, RunOptions,
    RunReport, SqliteDedupIndex, SqliteStateStore, StageDefinition, StageExecutor, StageRegistry,
};
use recordflow_stages::{
    init_sink_schema, load_records_jsonl, ArtifactStore, FinalizeStage, GenAiClient, GenAiConfig,
    PlacesConfig, PlacesStage, ResearchStage, ScrapeStage, SinkStage,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "recordflow", about = "Resumable enrichment pipeline for facility records")]
struct Args {
    /// JSONL input file, one record per line.
    #[arg(short, long)]
    input: PathBuf,

    /// SQLite database holding the ledger, dedup index and output table.
    #[arg(long, default_value = "recordflow.db")]
    db: PathBuf,

    /// Directory for stage artifacts.
    #[arg(long, default_value = "artifacts")]
    artifacts: PathBuf,

    /// Concurrent workers; defaults to the CPU count.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Continue a previous run against the same database.
    #[arg(long)]
    resume: bool,

    /// Process at most this many records from the input.
    #[arg(long)]
    limit: Option<usize>,
}

fn registry() -> Result<StageRegistry> {
    let mut registry = StageRegistry::new();
    registry.register(
        StageDefinition::new("places", vec![])
            .with_max_attempts(3)
            .with_backoff(BackoffPolicy::new(Duration::from_secs(2)))
            .with_timeout(Duration::from_secs(30))
            .with_rate_limit_key("places_api"),
    )?;
    registry.register(
        StageDefinition::new("research", vec!["places"])
            .with_max_attempts(2)
            .with_backoff(BackoffPolicy::new(Duration::from_secs(10)))
            .with_timeout(Duration::from_secs(60))
            .with_rate_limit_key("genai"),
    )?;
    registry.register(
        StageDefinition::new("scrape", vec!["places"])
            .with_max_attempts(3)
            .with_backoff(BackoffPolicy::new(Duration::from_secs(2)))
            .with_timeout(Duration::from_secs(45))
            .with_rate_limit_key("scrape")
            .with_dedup_key(ScrapeStage::fingerprint),
    )?;
    registry.register(
        StageDefinition::new("finalize", vec!["research", "scrape"])
            .with_max_attempts(2)
            .with_backoff(BackoffPolicy::new(Duration::from_secs(10)))
            .with_timeout(Duration::from_secs(90))
            .with_rate_limit_key("genai"),
    )?;
    registry.register(
        StageDefinition::new("sink", vec!["finalize"])
            .side_effecting()
            .with_max_attempts(3)
            .with_backoff(BackoffPolicy::new(Duration::from_secs(1)))
            .with_timeout(Duration::from_secs(30)),
    )?;
    Ok(registry)
}

fn print_report(report: &RunReport) {
    println!();
    println!(
        "Run {} over {} records in {:.1}s{}",
        report.run_id,
        report.records_total,
        report.duration.as_secs_f64(),
        if report.cancelled { " (cancelled)" } else { "" },
    );
    println!(
        "{:<12} {:>10} {:>8} {:>8} {:>8}",
        "stage", "succeeded", "failed", "skipped", "pending"
    );
    for (stage, counts) in &report.per_stage {
        println!(
            "{stage:<12} {:>10} {:>8} {:>8} {:>8}",
            counts.succeeded,
            counts.failed,
            counts.skipped,
            counts.pending + counts.running,
        );
    }
    if !report.usage.is_empty() {
        println!();
        for (stage, usage) in &report.usage {
            println!(
                "{stage}: {} input tokens, {} output tokens",
                usage.input_tokens, usage.output_tokens
            );
        }
        println!("estimated model cost: ${:.4}", report.cost_usd);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let places_key = std::env::var("GOOGLE_PLACES_API_KEY")
        .context("GOOGLE_PLACES_API_KEY is not set")?;
    let genai_key =
        std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY is not set")?;

    let records = load_records_jsonl(&args.input, args.limit)?;
    info!(records = records.len(), input = %args.input.display(), "loaded input");

    let pool = open_pipeline_db(&args.db).await?;
    init_sink_schema(&pool).await?;
    let store = Arc::new(SqliteStateStore::new(pool.clone()));
    let dedup = Arc::new(SqliteDedupIndex::new(pool.clone()));
    let artifacts = ArtifactStore::new(&args.artifacts);

    let genai = GenAiConfig::new(genai_key);
    let mut executors: HashMap<String, Arc<dyn StageExecutor>> = HashMap::new();
    executors.insert(
        "places".into(),
        Arc::new(PlacesStage::new(
            PlacesConfig::new(places_key),
            artifacts.clone(),
        )?),
    );
    executors.insert(
        "research".into(),
        Arc::new(ResearchStage::new(
            GenAiClient::new(genai.clone())?,
            artifacts.clone(),
        )),
    );
    executors.insert("scrape".into(), Arc::new(ScrapeStage::new(artifacts.clone())?));
    executors.insert(
        "finalize".into(),
        Arc::new(FinalizeStage::new(GenAiClient::new(genai)?, artifacts.clone())),
    );
    executors.insert("sink".into(), Arc::new(SinkStage::new(pool, artifacts)));

    let limiters = Arc::new(
        RateLimiterSet::new()
            .with_limit("places_api", 4)
            .with_limit("genai", 2)
            .with_limit("scrape", 8),
    );

    let controller = RunController::new(
        Arc::new(registry()?),
        store,
        dedup,
        limiters,
        executors,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    let options = RunOptions {
        worker_count: args.workers.unwrap_or_else(num_cpus::get),
        resume: args.resume,
        progress_interval: Duration::from_secs(5),
        pricing: Pricing::default(),
    };

    let report = controller.run(records, options, cancel).await?;
    print_report(&report);

    if report.cancelled {
        bail!("run was interrupted; re-run with --resume to continue");
    }
    Ok(())
}
