use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use webpilot::config::{Cli, Config};
use webpilot::runner::Runner;
use webpilot::scheduler::TaskScheduler;
use webpilot::server::{self, AppState};
use webpilot::store::TaskStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webpilot=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli)?;
    tracing::info!(
        db = %config.db_path.display(),
        headless = config.headless,
        timeout_secs = config.web_timeout.as_secs(),
        "starting webpilot"
    );

    let store = Arc::new(TaskStore::open(&config.db_path)?);
    let scheduler = Arc::new(TaskScheduler::new(store));
    let (event_tx, _) = broadcast::channel(64);
    let runner = Runner::new(scheduler.clone(), config.clone(), event_tx.clone());

    if cli.once {
        let executed = runner.drain().await?;
        tracing::info!(executed, "queue drained");
        return Ok(());
    }

    server::start(
        Arc::new(AppState {
            scheduler,
            event_tx,
        }),
        config.port,
    )
    .await?;

    runner.run().await;
    Ok(())
}
