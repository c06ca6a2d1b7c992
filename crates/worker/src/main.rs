//! Refresh worker binary.
//!
//! `run` keeps a worker pool (and the abandoned-claim sweeper) alive until
//! Ctrl-C. The other subcommands perform a single operation and exit, which
//! is handy from scripts and during incidents.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use viewforge_core::SourceSlug;
use viewforge_infra::jobs::{
    CoalescingEnqueuer, Dispatcher, EnqueueResult, JobStore, JobType, PostgresJobStore,
    RetryController, WorkerPool,
};
use viewforge_infra::pipeline::RefreshPipeline;
use viewforge_infra::publish::{ArtifactPublisher, DirectoryPublisher, NoopPublisher};
use viewforge_infra::sources::PostgresSourceStore;
use viewforge_infra::views::{CatalogResolver, PostgresArtifactStore, PostgresDependencyCatalog};
use viewforge_infra::{RefreshConfig, schema};

#[derive(Parser)]
#[command(name = "viewforge-worker")]
#[command(about = "Coalescing refresh queue for source-derived views")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the database schema
    Migrate,

    /// Create a source or replace its configuration
    PutSource {
        slug: String,
        /// Path to the JSON configuration
        config: PathBuf,
    },

    /// Register an id in the dependency catalog
    RegisterDependency {
        id: String,
        #[arg(long)]
        label: Option<String>,
    },

    /// Request a refresh of one source
    Enqueue {
        slug: String,
        #[arg(long = "dependency")]
        dependencies: Vec<String>,
    },

    /// Run workers until interrupted
    Run,

    /// Process at most one queued job
    ProcessOne,

    /// Return abandoned claims to the queue once
    Reclaim {
        /// Overrides VIEWFORGE_CLAIM_TIMEOUT_SECS
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Print job counts per state
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    viewforge_observability::init();

    let cli = Cli::parse();
    let config = RefreshConfig::from_env()?;
    let pool = connect(&config).await?;

    match cli.command {
        Commands::Migrate => {
            schema::apply(&pool).await?;
            tracing::info!("schema applied");
        }
        Commands::PutSource { slug, config: path } => {
            let slug = SourceSlug::new(slug)?;
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            let source = PostgresSourceStore::new(pool).upsert(&slug, &value).await?;
            println!("{}", source.updated_at.to_rfc3339());
        }
        Commands::RegisterDependency { id, label } => {
            PostgresDependencyCatalog::new(pool)
                .register(&id, label.as_deref())
                .await?;
        }
        Commands::Enqueue { slug, dependencies } => {
            let slug = SourceSlug::new(slug)?;
            let enqueuer = CoalescingEnqueuer::new(
                PostgresJobStore::new(pool.clone()),
                PostgresSourceStore::new(pool),
            );
            match enqueuer.enqueue(&slug, dependencies).await? {
                EnqueueResult::Inserted(id) => println!("inserted {id}"),
                EnqueueResult::Coalesced(id) => println!("coalesced into {id}"),
                EnqueueResult::SourceMissing => anyhow::bail!("source {slug} does not exist"),
            }
        }
        Commands::Run => {
            let handle = WorkerPool::new(dispatcher(pool, &config), config.worker_pool()).start();
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            tracing::info!("shutdown requested; waiting for in-flight jobs");
            let stats = handle.stats();
            handle.shutdown().await;
            println!("{}", serde_json::to_string(&stats)?);
        }
        Commands::ProcessOne => {
            let outcome = dispatcher(pool, &config)
                .process_one_queued_job(JobType::RefreshViews)
                .await?;
            match outcome {
                Some(outcome) => println!("{}", outcome.as_str()),
                None => println!("idle"),
            }
        }
        Commands::Reclaim { timeout_secs } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .or(config.claim_timeout)
                .context("no claim timeout: pass --timeout-secs or set VIEWFORGE_CLAIM_TIMEOUT_SECS")?;
            let reclaimed = dispatcher(pool, &config).reclaim_abandoned(timeout).await?;
            for entry in &reclaimed {
                println!("{} {:?}", entry.job.id, entry.disposition);
            }
        }
        Commands::Stats => {
            let stats = PostgresJobStore::new(pool)
                .stats(JobType::RefreshViews)
                .await?;
            println!("{}", serde_json::to_string(&stats)?);
        }
    }

    Ok(())
}

async fn connect(config: &RefreshConfig) -> Result<PgPool> {
    let url = config.require_database_url()?;
    PgPoolOptions::new()
        .max_connections(config.workers as u32 + 2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("connecting to Postgres")
}

fn dispatcher(pool: PgPool, config: &RefreshConfig) -> Dispatcher {
    let publisher: Arc<dyn ArtifactPublisher> = match &config.publish_dir {
        Some(dir) => Arc::new(DirectoryPublisher::new(dir)),
        None => Arc::new(NoopPublisher),
    };

    let pipeline = RefreshPipeline::new(
        Arc::new(PostgresSourceStore::new(pool.clone())),
        Arc::new(PostgresArtifactStore::new(pool.clone())),
        Arc::new(CatalogResolver::new(PostgresDependencyCatalog::new(pool.clone()))),
        publisher,
    );

    Dispatcher::new(
        Arc::new(PostgresJobStore::new(pool)),
        pipeline,
        RetryController::new(config.retry.clone()),
    )
}
