use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use revledger_adapters::DecodedRow;
use revledger_analytics::{AggregationEngine, CompanyFilter, DateRange};
use revledger_storage::{CanonicalStore, MemoryStore, PgStore};
use revledger_sync::{
    maybe_build_scheduler, CompanyRegistry, SourceKind, SyncConfig, SyncPipeline, UploadKind,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const MAX_DB_CONNECTIONS: u32 = 8;

#[derive(Debug, Parser)]
#[command(name = "revledger-cli")]
#[command(about = "Revenue ledger sync and analytics")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Use a throwaway in-memory store instead of DATABASE_URL
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull every configured source into the canonical store
    Sync {
        #[arg(long)]
        company: Option<Uuid>,
        /// payments, memberships, sheet or crm
        #[arg(long)]
        source: Option<SourceKind>,
    },
    /// Load an Elective or Fanbasis CSV export
    Ingest {
        #[arg(long)]
        company: Uuid,
        /// elective or fanbasis
        #[arg(long)]
        kind: UploadKind,
        file: PathBuf,
    },
    /// Print dashboard metrics as JSON
    Dashboard {
        #[arg(long = "company")]
        companies: Vec<Uuid>,
        /// YYYY-MM-DD, defaults to 30 days ago
        #[arg(long)]
        from: Option<String>,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        to: Option<String>,
        /// Per-customer revenue instead of the summary
        #[arg(long)]
        customers: bool,
    },
    /// Apply database migrations
    Migrate,
    /// Run the cron scheduler until interrupted
    Schedule,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);
    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Sync {
        company: None,
        source: None,
    });

    if let Commands::Migrate = command {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL is required for migrate")?;
        let store = PgStore::connect(url, MAX_DB_CONNECTIONS).await?;
        store.migrate().await.context("running migrations")?;
        info!("migrations applied");
        return Ok(());
    }

    match config.database_url.as_deref().filter(|_| !cli.memory) {
        Some(url) => {
            let store = PgStore::connect(url, MAX_DB_CONNECTIONS)
                .await
                .context("connecting to database")?;
            run(Arc::new(store), &config, command).await
        }
        None => {
            if !cli.memory {
                warn!("DATABASE_URL not set; using an in-memory store");
            }
            run(Arc::new(MemoryStore::new()), &config, command).await
        }
    }
}

async fn run<S>(store: Arc<S>, config: &SyncConfig, command: Commands) -> Result<()>
where
    S: CanonicalStore + 'static,
{
    match command {
        Commands::Sync { company, source } => {
            let pipeline = load_pipeline(store, config).await?;
            match (company, source) {
                (None, None) => print_json(&pipeline.sync_all().await?),
                (Some(company), None) => print_json(&pipeline.sync_company(company).await?),
                (Some(company), Some(kind)) => {
                    print_json(&pipeline.sync_company_source(company, kind).await?)
                }
                (None, Some(kind)) => {
                    pipeline.register_companies().await?;
                    let ids: Vec<Uuid> = pipeline.companies().map(|c| c.id).collect();
                    let mut reports = Vec::with_capacity(ids.len());
                    for id in ids {
                        reports.push(pipeline.sync_company_source(id, kind).await?);
                    }
                    print_json(&reports)
                }
            }
        }
        Commands::Ingest { company, kind, file } => {
            let pipeline = load_pipeline(store, config).await?;
            let rows = read_csv_rows(&file)?;
            let report = pipeline.ingest_upload(company, kind, &rows).await?;
            print_json(&report)
        }
        Commands::Dashboard {
            companies,
            from,
            to,
            customers,
        } => {
            let today = Utc::now().date_naive();
            let range = DateRange::parse(
                &from.unwrap_or_else(|| (today - Duration::days(30)).to_string()),
                &to.unwrap_or_else(|| today.to_string()),
            )?;
            let filter = if companies.is_empty() {
                CompanyFilter::All
            } else {
                CompanyFilter::Only(companies)
            };
            let engine = AggregationEngine::new(store);
            if customers {
                print_json(&engine.customer_revenue(&filter, &range).await?)
            } else {
                print_json(&engine.compute_dashboard(&filter, &range).await?)
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(load_pipeline(store, config).await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline, config).await? else {
                bail!("scheduler is disabled; set REVLEDGER_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(())
        }
        Commands::Migrate => bail!("migrate runs before a store is opened"),
    }
}

async fn load_pipeline<S>(store: Arc<S>, config: &SyncConfig) -> Result<SyncPipeline<S>>
where
    S: CanonicalStore + 'static,
{
    let registry = CompanyRegistry::load(&config.companies_file)
        .await
        .with_context(|| format!("loading {}", config.companies_file.display()))?;
    Ok(SyncPipeline::from_config(store, config, &registry)?)
}

/// Header row plus data rows as header -> cell maps.
fn read_csv_rows(path: &Path) -> Result<Vec<DecodedRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading {} row {}", path.display(), line + 1))?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
