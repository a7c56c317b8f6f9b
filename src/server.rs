/// Server setup and initialization
///
/// Wires together all components: store, node executor, execution engine,
/// run orchestration and the cron reconciler. Serves a health endpoint and
/// shuts the reconciler down cleanly on ctrl-c.

use crate::{
    config::Config,
    runtime::{
        engine::ExecutionEngine,
        executor::NodeExecutor,
        integrations::{ConnectorRegistry, JsonPayloadDecryptor},
        orchestrator::{FlowRunner, LocalOrchestrator, RetryPolicy, RunDispatcher},
        scheduler::CronReconciler,
    },
    workflow::storage::SqliteStore,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Fully wired runtime components
pub struct Services {
    pub store: Arc<SqliteStore>,
    pub engine: Arc<ExecutionEngine>,
    pub orchestrator: Arc<LocalOrchestrator>,
    pub dispatcher: Arc<RunDispatcher>,
    pub reconciler: Arc<CronReconciler>,
}

/// Build every runtime component from configuration
pub async fn build_services(config: &Config, connectors: ConnectorRegistry) -> Result<Services> {
    ensure_database_dir(&config.database.url)?;

    tracing::info!("📋 Opening SQLite store: {}", config.database.url);
    let store = if config.database.url.contains(":memory:") {
        SqliteStore::in_memory().await
    } else {
        SqliteStore::connect(&config.database.url).await
    }
    .map_err(|e| anyhow::anyhow!("Failed to open store {}: {}", config.database.url, e))?;
    let store = Arc::new(store);

    tracing::info!("⚙️ Initializing node executor with {} connector(s)", connectors.keys().len());
    let executor = Arc::new(NodeExecutor::new(
        store.clone(),
        Arc::new(JsonPayloadDecryptor),
        connectors,
        Duration::from_secs(config.engine.http_timeout_secs),
    )?);

    tracing::info!("🚀 Initializing execution engine");
    let engine = Arc::new(ExecutionEngine::new(executor, store.clone()));

    let runner = Arc::new(FlowRunner::new(
        Arc::clone(&engine),
        store.clone(),
        store.clone(),
        RetryPolicy::from_config(&config.engine),
    ));
    let orchestrator = Arc::new(LocalOrchestrator::new(runner, config.engine.task_queue.clone()));
    let dispatcher = Arc::new(RunDispatcher::new(
        store.clone(),
        orchestrator.clone(),
        config.engine.task_queue.clone(),
    ));

    tracing::info!("⏰ Initializing cron reconciler");
    let reconciler = Arc::new(CronReconciler::new(
        store.clone(),
        Arc::clone(&dispatcher),
        Duration::from_secs(config.scheduler.tick_interval_secs.max(1)),
    ));

    Ok(Services {
        store,
        engine,
        orchestrator,
        dispatcher,
        reconciler,
    })
}

/// Create the HTTP router
pub fn create_router() -> Router {
    Router::new().route("/healthz", get(health_check))
}

/// Start the service with the given configuration
///
/// Runs until ctrl-c, then stops the cron reconciler before returning.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting nodeloom worker...");
    let services = build_services(&config, ConnectorRegistry::new()).await?;

    let scheduler = if config.scheduler.enabled {
        Some(services.reconciler.spawn())
    } else {
        tracing::info!("⏸️ Cron reconciler disabled by configuration");
        None
    };

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, create_router().into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = scheduler {
        handle.stop().await?;
    }
    tracing::info!("👋 Shutdown complete");
    Ok(())
}

/// Create the parent directory of a file-backed SQLite URL
fn ensure_database_dir(url: &str) -> Result<()> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = std::path::Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tracing::info!("📁 Ensuring database directory exists: {}", parent.display());
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Failed to create database directory: {}", e))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown signal received");
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{store::FlowStore, types::FlowRecord};

    #[tokio::test]
    async fn test_build_services_on_memory_database() {
        let mut config = Config::default();
        config.database.url = "sqlite::memory:".to_string();
        let services = build_services(&config, ConnectorRegistry::new()).await.unwrap();

        services
            .store
            .save_flow(&FlowRecord {
                id: "f1".into(),
                name: "Flow".into(),
                archived: false,
                definition: r#"{"nodes": []}"#.into(),
            })
            .await
            .unwrap();
        assert_eq!(services.store.list_flows().await.unwrap().len(), 1);
    }

    #[test]
    fn test_memory_url_needs_no_directory() {
        assert!(ensure_database_dir("sqlite::memory:").is_ok());
    }
}
