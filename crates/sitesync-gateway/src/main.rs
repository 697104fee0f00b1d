use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use sitesync_core::config::SitesyncConfig;
use sitesync_core::{Clock, KvStore, SystemClock};
use sitesync_scheduler::SchedulerEngine;
use sitesync_store::{LocalStore, SqliteKvStore};
use sitesync_sync::{
    AlertNotifier, ConnectionPool, FailureRecorder, HttpSourceConnector, PiiProtector, RetryPolicy,
    SyncOrchestrator, SyncRunner, SyncSettings,
};

mod app;
mod http;

const KV_PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Parser)]
#[command(name = "sitesync-gateway", version, about = "Employee sync scheduler and control API")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sitesync_gateway=info,sitesync_sync=info,sitesync_scheduler=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let args = Args::parse();

    // --config > SITESYNC_CONFIG > ~/.sitesync/sitesync.toml
    let config_path = args
        .config
        .or_else(|| std::env::var("SITESYNC_CONFIG").ok());
    let config = SitesyncConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        SitesyncConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    // each subsystem gets its own connection
    let store = Arc::new(LocalStore::new(open_db(db_path)?)?);
    let kv_store = Arc::new(SqliteKvStore::new(open_db(db_path)?, clock.clone())?);
    let kv: Arc<dyn KvStore> = kv_store.clone();
    info!("database ready");

    let runner = build_sync_runner(&config, store, kv.clone(), clock.clone())?;
    let registry = Arc::new(sitesync_sync::build_registry(runner.map(Arc::new)));

    let (engine, scheduler) = SchedulerEngine::new(
        registry.clone(),
        kv,
        clock,
        Duration::from_secs(config.scheduler.tick_interval_secs.max(1)),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(engine.run(shutdown_rx));

    // expired KV entries are invisible to reads; this only reclaims space
    let mut purge_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(KV_PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => match kv_store.purge_expired() {
                    Ok(0) => {}
                    Ok(n) => info!(purged = n, "purged expired kv entries"),
                    Err(e) => warn!(error = %e, "kv purge failed"),
                },
                _ = purge_shutdown.changed() => break,
            }
        }
    });

    let state = Arc::new(app::AppState::new(config.clone(), scheduler, registry.len()));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("SiteSync gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop the scheduler and let an in-flight tick finish
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }
    info!("shutdown complete");
    Ok(())
}

/// Wire the sync stack. `None` when no source is configured; the sync jobs
/// then log and skip.
fn build_sync_runner(
    config: &SitesyncConfig,
    store: Arc<LocalStore>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Option<SyncRunner>> {
    let Some(base_url) = config.source.base_url.as_deref().filter(|u| !u.is_empty()) else {
        info!("source.base_url not set, sync jobs will skip");
        return Ok(None);
    };
    if config.sync.hmac_secret.is_empty() || config.sync.encryption_key.is_empty() {
        warn!("sync.hmac_secret or sync.encryption_key is empty; PII hashes are not secret");
    }

    let connector = HttpSourceConnector::new(base_url, &config.source)?;
    let pool = Arc::new(ConnectionPool::new(
        Arc::new(connector),
        clock.clone(),
        Duration::from_secs(config.source.cache_ttl_secs),
        Duration::from_millis(config.source.ping_timeout_ms),
    ));
    let pii = PiiProtector::new(&config.sync.hmac_secret, &config.sync.encryption_key)?;
    let failures = Arc::new(FailureRecorder::new(
        store.clone(),
        kv.clone(),
        clock.clone(),
        config.telemetry.clone(),
    ));
    let alerts = Arc::new(AlertNotifier::new(&config.alerts, kv.clone()));
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store,
        kv.clone(),
        pool,
        pii,
        failures.clone(),
        clock.clone(),
        SyncSettings::from(&config.sync),
    ));
    info!(base_url = %base_url, site = %config.source.site_cd, "source sync enabled");
    Ok(Some(SyncRunner::new(
        orchestrator,
        failures,
        alerts,
        kv,
        clock,
        RetryPolicy::from(&config.sync),
    )))
}

fn open_db(path: &str) -> rusqlite::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
