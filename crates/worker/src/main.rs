//! Billing worker
//!
//! Polls stored payment-processor events and applies them to customer
//! records. Events are written by the webhook receiver with status `new`;
//! this process drives them to a terminal status.

mod event_poller;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use subtrack_billing::PgStore;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;

    let store = PgStore::new(pool);
    store.ensure_free_default_plan().await?;

    tracing::info!("Billing worker started");

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        interval.tick().await;
        event_poller::run_once(&store).await;
    }
}
