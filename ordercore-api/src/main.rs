//! `ordercore-server`: HTTP intake and the dispatch worker in one process.

use std::sync::Arc;

use anyhow::Context;
use ordercore::OrderCore;
use ordercore::OrderCoreConfig;
use ordercore_api::{serve, ServerSettings};
use ordercore_memory::{InMemoryHistoryStore, InMemoryOrderStore, InMemoryWorkQueue};
use ordercore_postgres::PostgresBackend;
use ordercore_types::{Clock, SystemClock};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = OrderCoreConfig::from_env().context("invalid ordercore configuration")?;
    let settings = ServerSettings::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if let Some(database_url) = settings.database_url {
        let backend = PostgresBackend::new(database_url)
            .await
            .context("failed to connect to postgres")?;
        backend.migrate().await.context("failed to migrate postgres")?;
        info!("[server.backend] using postgres");

        let core = OrderCore::new(
            &config,
            Arc::new(backend.order_store()),
            Arc::new(backend.work_queue()),
            Arc::new(backend.history_store()),
            clock,
        );
        serve(core, settings.bind_addr).await
    } else {
        warn!("[server.backend] DATABASE_URL not set; state is kept in memory only");

        let core = OrderCore::new(
            &config,
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(InMemoryWorkQueue::new()),
            Arc::new(InMemoryHistoryStore::new()),
            clock,
        );
        serve(core, settings.bind_addr).await
    }
}
