use anyhow::{bail, Result};
use spalloc_bmp_core::report::{LogOnlyEmailSender, StaticSerialMapper};
use spalloc_bmp_core::txrx::DummyConnector;
use spalloc_bmp_core::{BmpController, MemoryStore, Store};
use spalloc_bmp_server::settings::{seed_memory_store, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = match config_path() {
        Some(path) => ServerConfig::load(&path)?,
        None => {
            tracing::warn!("no config file given, running with defaults");
            ServerConfig::default()
        }
    };

    // The wire encoding lives outside this service; without it, only the
    // no-hardware stub can drive the machines.
    if !config.controller.use_dummy_bmp {
        bail!("no hardware transceiver backend is compiled into this build; set use_dummy_bmp");
    }

    let store: Arc<dyn Store> = match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to PostgreSQL");
            let pool = sqlx::PgPool::connect(url).await?;
            let pg = spalloc_bmp_core::PostgresStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "database_url set but the postgres feature is not enabled, using MemoryStore"
            );
            let store = MemoryStore::new();
            seed_memory_store(&store, &config).await;
            Arc::new(store)
        }
        None => {
            tracing::info!("using MemoryStore seeded from the config file");
            let store = MemoryStore::new();
            seed_memory_store(&store, &config).await;
            Arc::new(store)
        }
    };

    let controller = BmpController::new(
        config.controller.clone(),
        store,
        Arc::new(DummyConnector),
        Arc::new(LogOnlyEmailSender),
        Arc::new(StaticSerialMapper::new(config.serial_map.clone())),
    )
    .await?;
    controller.start();
    tracing::info!(
        period_ms = config.controller.period_ms,
        "BMP controller running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received");
    controller.shutdown().await?;
    Ok(())
}

/// Config path from `--config <path>` or the `SPALLOC_BMP_CONFIG` env var.
fn config_path() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(path) = args
        .windows(2)
        .find(|w| w[0] == "--config")
        .map(|w| PathBuf::from(&w[1]))
    {
        return Some(path);
    }
    std::env::var_os("SPALLOC_BMP_CONFIG").map(PathBuf::from)
}
