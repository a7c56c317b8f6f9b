/// nodeloom worker
///
/// Main entry point. Loads configuration from the environment and runs the
/// worker: run orchestration, cron reconciliation and a health check at /healthz.

use nodeloom::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (defaults to 0.0.0.0:3004 and data/nodeloom.db)
    let config = Config::default();

    start_server(config).await
}
