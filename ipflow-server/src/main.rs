use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ipflow_server::api;
use ipflow_server::config::Config;
use ipflow_server::notifier::{Notifier, OutboxNotifier, TracingNotifier};
use ipflow_server::{sweep_loop, SqliteRepository, SystemClock, WorkflowOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting IP disclosure workflow server");

    let config = Config::from_env().context("Failed to load configuration from environment")?;
    let policies = config.sla_policies()?;

    let db_path = config.db_path();
    info!("Using state database: {}", db_path.display());
    let repo = SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?;
    match repo.oldest_open_stage().await {
        Ok(Some(since)) => info!("Oldest open stage was opened at {}", since),
        Ok(None) => info!("No open stages"),
        Err(e) => anyhow::bail!("Failed to read open stages: {}", e),
    }

    let notifier: Arc<dyn Notifier> = match &config.notification_outbox_path {
        Some(path) => {
            info!("Writing notifications to outbox: {}", path.display());
            Arc::new(OutboxNotifier::new(path.clone()))
        }
        None => {
            info!("No notification outbox configured; notifications are logged only");
            Arc::new(TracingNotifier)
        }
    };

    let orchestrator = Arc::new(WorkflowOrchestrator::new(
        Arc::new(repo),
        notifier,
        Arc::new(SystemClock),
        policies,
    ));

    let app = api::router(orchestrator.clone())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let sweep_orchestrator = orchestrator.clone();
    let every = config.sweep_interval;
    tokio::spawn(async move {
        sweep_loop(sweep_orchestrator, every).await;
    });
    info!("Overdue sweep runs every {}s", every.as_secs());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
