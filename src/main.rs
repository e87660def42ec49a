use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use am_relayer::anchor::WatermarkCache;
use am_relayer::api::{self, AppState};
use am_relayer::chain::{ChainClientRegistry, HttpChainClient};
use am_relayer::config::Config;
use am_relayer::db::{
    self, MemoryMessagePool, MemoryWatermarkStore, MessagePool, PgMessagePool, PgWatermarkStore, WatermarkStore,
};
use am_relayer::lock::{ClusterLock, LocalLock, PgAdvisoryLock};
use am_relayer::network::{DenyListAcl, HttpRoutingDirectory, StaticDomainRegistry};
use am_relayer::runner::{Runner, RunnerDeps};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting AM relayer");

    let config = Config::load()?;
    tracing::info!(
        chains = config.chains.len(),
        peers = config.peers.len(),
        persistent = config.database.is_some(),
        "Configuration loaded"
    );

    let pool: Arc<dyn MessagePool>;
    let watermarks: Arc<dyn WatermarkStore>;
    let lock: Arc<dyn ClusterLock>;
    match &config.database {
        Some(database) => {
            let pg = db::create_pool(&database.url, database.max_connections).await?;
            tracing::info!("Database connected");
            db::run_migrations(&pg).await?;
            tracing::info!("Database migrations complete");
            pool = Arc::new(PgMessagePool::new(pg.clone()));
            watermarks = Arc::new(PgWatermarkStore::new(pg.clone()));
            lock = Arc::new(PgAdvisoryLock::new(pg));
        }
        None => {
            tracing::warn!("DATABASE_URL not set, running single-node with in-memory storage");
            pool = Arc::new(MemoryMessagePool::new());
            watermarks = Arc::new(MemoryWatermarkStore::new());
            lock = Arc::new(LocalLock::new());
        }
    }

    let mut clients = ChainClientRegistry::new();
    for chain in &config.chains {
        let client = HttpChainClient::new(
            chain.key(),
            chain.plugin_url.clone(),
            config.anchor.block_fetch_timeout(),
        )?;
        tracing::info!(
            chain = %chain.key(),
            domain = %chain.domain,
            plugin = %chain.plugin_url,
            "Chain client created"
        );
        clients.insert(chain.key(), Arc::new(client));
    }
    let clients = Arc::new(clients);

    let heights = Arc::new(WatermarkCache::new(watermarks));
    let deps = RunnerDeps {
        pool: pool.clone(),
        heights: heights.clone(),
        clients,
        lock,
        domains: Arc::new(StaticDomainRegistry::new(&config.chains, &config.extra_local_domains)),
        routing: Arc::new(HttpRoutingDirectory::new(
            &config.peers,
            config.anchor.block_fetch_timeout(),
        )?),
        acl: Arc::new(DenyListAcl::new(&config.acl_deny)),
    };
    let runner = Runner::new(&config, deps)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let api_state = AppState {
        chains: Arc::new(config.chains.iter().map(|c| c.key()).collect()),
        heights: heights.clone(),
        pool,
        health: runner.health(),
        processor: runner.processor(),
        started: Instant::now(),
    };
    let api_shutdown = shutdown_rx.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state, api_shutdown).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let flush_handle = heights.spawn_flush_loop(config.watermark_flush_interval(), shutdown_rx.clone());

    tracing::info!("Pipeline initialized, starting stage loops");
    let loops = runner.spawn(shutdown_rx);
    for handle in futures::future::join_all(loops).await {
        if let Err(e) = handle {
            tracing::error!(error = %e, "Stage loop panicked");
        }
    }

    // Final watermark flush happens inside the flush loop
    if let Err(e) = flush_handle.await {
        tracing::error!(error = %e, "Watermark flush loop panicked");
    }
    let _ = api_handle.await;

    tracing::info!("AM relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,am_relayer=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
