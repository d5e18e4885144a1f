//! Fixture exchange service.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the engine from its last snapshot, starts the outbox worker
//! and the HTTP surface, and snapshots periodically until shutdown.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use fixture_exchange::config;
use fixture_exchange::dashboard::{self, DashboardState};
use fixture_exchange::engine::outbox::{Outbox, OutboxWorker};
use fixture_exchange::engine::Engine;
use fixture_exchange::ports::broker::{DisabledBroker, HttpBroker};
use fixture_exchange::ports::memory::{MemoryFixtureStore, MemoryWallet};
use fixture_exchange::ports::notify::TracingNotifier;
use fixture_exchange::ports::{AuctionTransport, FixtureStore, Wallet};
use fixture_exchange::storage;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;
    init_logging();

    let settings = cfg.engine_settings();
    info!(
        group_id = settings.group_id,
        payout_group = settings.payout_group,
        bet_limit = settings.bet_limit,
        unit_price = %settings.unit_price,
        "Fixture exchange starting up"
    );

    // -- Collaborators ---------------------------------------------------

    let fixtures: Arc<dyn FixtureStore> = Arc::new(MemoryFixtureStore::new());
    let wallet: Arc<dyn Wallet> = Arc::new(MemoryWallet::new());

    let transport: Arc<dyn AuctionTransport> = if cfg.broker.enabled {
        let token = config::AppConfig::resolve_env(&cfg.broker.token_env)?;
        Arc::new(HttpBroker::new(
            cfg.broker.url.clone(),
            SecretString::new(token),
            Duration::from_secs(cfg.broker.timeout_secs),
        )?)
    } else {
        warn!("Broker disabled, auction messages stay local");
        Arc::new(DisabledBroker)
    };

    let (outbox, rx) = Outbox::channel();
    let backlog = outbox.backlog();
    let engine = Arc::new(Engine::new(
        settings,
        fixtures,
        wallet.clone(),
        outbox,
        cfg.retry_policy(),
    ));

    // -- Restore state ---------------------------------------------------

    let state_file = cfg.storage.state_file.as_str();
    if let Some(snapshot) = storage::load_snapshot(Some(state_file))? {
        engine
            .restore(snapshot)
            .await
            .with_context(|| format!("Snapshot {state_file} does not fit this engine"))?;
    }

    if let Some(path) = cfg.storage.fixtures_file.as_deref() {
        let seed = storage::load_fixtures(path)?;
        let count = seed.len();
        for fixture in seed {
            let id = fixture.id;
            if let Err(e) = engine.ingest_fixture(fixture).await {
                warn!(fixture_id = id, error = %e, "Fixture ingest failed");
            }
        }
        info!(path, count, "Seed fixtures ingested");
    }

    // -- Background tasks ------------------------------------------------

    let worker = OutboxWorker::new(
        Arc::new(TracingNotifier),
        transport,
        wallet,
        backlog,
        cfg.retry_policy(),
    );
    tokio::spawn(worker.run(rx));

    if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(engine.clone()));
        dashboard::spawn_dashboard(state, cfg.dashboard.port).await?;
    }

    // -- Main loop -------------------------------------------------------

    let mut interval =
        tokio::time::interval(Duration::from_secs(cfg.storage.snapshot_interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.storage.snapshot_interval_secs,
        "Serving. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = persist(&engine, state_file).await {
                    error!(error = %e, "Failed to save snapshot");
                }
                engine.retry_refunds().await;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    persist(&engine, state_file).await?;
    let status = engine.status().await;
    info!(
        fixtures = status.fixtures,
        positions = status.positions,
        open_offers = status.open_offers,
        "Fixture exchange shut down cleanly."
    );

    Ok(())
}

async fn persist(engine: &Engine, path: &str) -> Result<()> {
    let snapshot = engine.snapshot().await?;
    storage::save_snapshot(&snapshot, Some(path))
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fixture_exchange=info"));

    if std::env::var("EXCHANGE_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
