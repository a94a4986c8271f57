use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reviewd_config::Config;
use reviewd_core::exec::LocalExecutor;
use reviewd_server::app::{AppState, build_router};
use reviewd_server::gate::Gate;
use reviewd_server::publisher::GithubForge;
use reviewd_server::queue::PgJobQueue;
use reviewd_server::store::PgStore;
use reviewd_server::worker::{ReviewWorker, WorkerConfig};

#[derive(Parser)]
#[command(name = "revd", about = "Automated pull-request review service", version)]
struct Cli {
    /// Path to the config file (falls back to REVIEWD_CONFIG, then
    /// /etc/reviewd/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run only the webhook server
    Serve,
    /// Run only the review worker
    Worker,
    /// Run the webhook server and the worker in one process (default)
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("database connection failed")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let gate = Arc::new(Gate::new(
        store.clone(),
        config.limits.reviews_per_repo_per_hour,
    ));
    let queue = Arc::new(PgJobQueue::new(
        pool,
        config.queue.lease_ms,
        config.queue.max_retries,
    ));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        shutdown.cancel();
    });

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Serve => {
            serve(&config, store, gate, queue, cancel).await?;
        }
        Commands::Worker => {
            worker(&config, store, gate, queue)?.run(cancel).await;
        }
        Commands::Run => {
            let w = worker(&config, store.clone(), gate.clone(), queue.clone())?;
            let worker_cancel = cancel.clone();
            let handle = tokio::spawn(async move { w.run(worker_cancel).await });
            serve(&config, store, gate, queue, cancel).await?;
            let _ = handle.await;
        }
    }
    Ok(())
}

async fn serve(
    config: &Config,
    store: Arc<PgStore>,
    gate: Arc<Gate>,
    queue: Arc<PgJobQueue>,
    cancel: CancellationToken,
) -> Result<()> {
    let state = AppState {
        gate,
        store,
        queue,
        webhook_secret: config.server.webhook_secret.clone(),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "webhook server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("server error")
}

fn worker(
    config: &Config,
    store: Arc<PgStore>,
    gate: Arc<Gate>,
    queue: Arc<PgJobQueue>,
) -> Result<ReviewWorker> {
    let provider: Arc<dyn reviewd_provider::Provider> =
        Arc::from(reviewd_provider::create_provider(config)?);
    let forge = Arc::new(GithubForge::new(
        config.forge.api_url.clone(),
        config.forge.token.clone().unwrap_or_default(),
    ));

    let worker_config = WorkerConfig {
        batch_size: config.queue.batch_size,
        min_poll_interval: std::time::Duration::from_millis(config.queue.poll_interval_ms),
        max_poll_interval: std::time::Duration::from_millis(config.queue.max_poll_interval_ms),
        model: config.model.id.clone(),
        forge_token: config.forge.token.clone(),
        ..Default::default()
    };

    Ok(ReviewWorker::new(
        queue,
        gate,
        store,
        forge,
        provider,
        Arc::new(LocalExecutor),
        config.sandbox.root.to_string_lossy().into_owned(),
        worker_config,
    ))
}
