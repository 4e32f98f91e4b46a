//! Gavel marketplace server.
//!
//! Wires the authority, bidding and search sides onto one event bus and
//! serves the HTTP API.
//!
//! ```text
//!            ┌──────────── HTTP (axum) ─────────────┐
//!            │ auctions · bids · search · ws · /metrics
//!            └──────┬──────────────┬────────────────┘
//!                   ▼              ▼
//!          authority store     bid store
//!          (+ outbox)          (+ outbox) ◄── finisher
//!                   │              │
//!                   └── relays ────┘
//!                          ▼
//!                      event bus ──► search · auction · notifications
//!                          │
//!                          └── <queue>-error ──► compensation
//! ```
//!
//! With `DATABASE_URL` unset everything runs in memory, which is only useful
//! for local development: state is lost on exit.

use anyhow::Context;
use gavel_auction::api::{AppState, build_router};
use gavel_auction::compensation::correction_table;
use gavel_auction::config::BrokerKind;
use gavel_auction::consumers::ConsumerSet;
use gavel_auction::postgres::apply_schema;
use gavel_auction::search::{CatchUp, InMemorySearchStore, PostgresSearchStore, SearchProjection, SearchStore};
use gavel_auction::{
    AuctionFinisher, AuctionReconciler, AuctionService, AuctionStore, BidGateway, BidService, BidStore, Config,
    InMemoryAuctionStore, InMemoryBidStore, NotificationFanout, PostgresAuctionStore, PostgresBidStore,
};
use gavel_core::event_bus::EventBus;
use gavel_core::fault::FaultLedger;
use gavel_core::outbox::OutboxStore;
use gavel_postgres::{PostgresFaultLedger, PostgresOutboxStore};
use gavel_redpanda::RedpandaEventBus;
use gavel_runtime::metrics::MetricsServer;
use gavel_runtime::{EventConsumer, FaultCompensator, OutboxRelay};
use gavel_testing::{InMemoryEventBus, InMemoryFaultLedger};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Stores behind the authority, bidding and search sides.
struct Backends {
    authority: Arc<dyn AuctionStore>,
    authority_outbox: Arc<dyn OutboxStore>,
    bids: Arc<dyn BidStore>,
    /// Separate bid outbox to relay; `None` when bids share the authority's outbox table.
    bid_outbox: Option<Arc<dyn OutboxStore>>,
    search: Arc<dyn SearchStore>,
    ledger: Arc<dyn FaultLedger>,
}

async fn connect(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    apply_schema(&pool).await.context("failed to apply schema")?;
    Ok(pool)
}

async fn backends(config: &Config) -> anyhow::Result<Backends> {
    let Some(url) = &config.database.authority_url else {
        warn!("DATABASE_URL not set; running on in-memory stores");
        let authority = Arc::new(InMemoryAuctionStore::new());
        let bids = InMemoryBidStore::new();
        return Ok(Backends {
            authority: authority.clone(),
            authority_outbox: authority,
            bids: Arc::new(bids.clone()),
            bid_outbox: Some(Arc::new(bids)),
            search: Arc::new(InMemorySearchStore::new()),
            ledger: Arc::new(InMemoryFaultLedger::new()),
        });
    };

    let pool = connect(url, config.database.max_connections).await?;
    let search_pool = match &config.database.search_url {
        Some(search_url) => connect(search_url, config.database.max_connections).await?,
        None => pool.clone(),
    };
    info!(separate_search_database = config.database.search_url.is_some(), "Postgres connected");

    Ok(Backends {
        authority: Arc::new(PostgresAuctionStore::new(pool.clone())),
        authority_outbox: Arc::new(PostgresOutboxStore::new(pool.clone())),
        bids: Arc::new(PostgresBidStore::new(pool.clone())),
        bid_outbox: None,
        search: Arc::new(PostgresSearchStore::new(search_pool)),
        ledger: Arc::new(PostgresFaultLedger::new(pool)),
    })
}

/// The shared bus, plus the concrete in-memory bus when one is used so its
/// queues can be bound before anything is published.
fn event_bus(config: &Config) -> anyhow::Result<(Arc<dyn EventBus>, Option<InMemoryEventBus>)> {
    match config.broker.kind {
        BrokerKind::Redpanda => {
            let bus = RedpandaEventBus::new(&config.broker.brokers).context("failed to create Redpanda event bus")?;
            Ok((Arc::new(bus), None))
        }
        BrokerKind::Memory => {
            warn!("Using the in-memory event bus; messages do not survive a restart");
            let bus = InMemoryEventBus::new();
            Ok((Arc::new(bus.clone()), Some(bus)))
        }
    }
}

fn start_metrics(config: &Config) -> anyhow::Result<Option<Arc<MetricsServer>>> {
    if !config.metrics_enabled {
        return Ok(None);
    }
    let mut server = MetricsServer::new(config.bind_addr()?);
    server.start().context("failed to install metrics recorder")?;
    Ok(Some(Arc::new(server)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "gavel=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    config.validate()?;
    info!(
        broker = ?config.broker.kind,
        durable = config.database.authority_url.is_some(),
        relay_interval_secs = config.relay.interval_secs,
        max_attempts = config.consumer.max_attempts,
        "Configuration loaded"
    );

    let metrics = start_metrics(&config)?;
    let backends = backends(&config).await?;
    let (event_bus, memory_bus) = event_bus(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bring the projection up to date before consuming, so a fresh search
    // database does not wait for events that were relayed long ago.
    match CatchUp::new(backends.search.clone(), backends.authority.clone()).run().await {
        Ok(applied) => info!(applied, "Search projection caught up"),
        Err(e) => warn!(error = %e, "Search catch-up failed; continuing from the event stream"),
    }

    let fanout = NotificationFanout::default();
    let rules = config.item_rules();

    let consumers = ConsumerSet {
        projection: Arc::new(SearchProjection::new(backends.search.clone(), rules.clone())),
        reconciler: Arc::new(AuctionReconciler::new(backends.authority.clone())),
        fanout: fanout.clone(),
        compensator: Arc::new(FaultCompensator::new(
            correction_table(&rules),
            backends.authority_outbox.clone(),
            backends.ledger.clone(),
        )),
    }
    .into_consumers(&event_bus, config.redelivery_policy(), config.consumer.prefetch, &shutdown_rx);

    if let Some(bus) = &memory_bus {
        for consumer in &consumers {
            let topics: Vec<&str> = consumer.topics().iter().map(String::as_str).collect();
            bus.bind(consumer.queue(), &topics);
        }
    }

    let mut tasks: Vec<JoinHandle<()>> = consumers.into_iter().map(EventConsumer::spawn).collect();
    tasks.push(
        OutboxRelay::new(backends.authority_outbox.clone(), event_bus.clone(), config.relay_config())
            .spawn(shutdown_rx.clone()),
    );
    if let Some(bid_outbox) = backends.bid_outbox.clone() {
        tasks.push(OutboxRelay::new(bid_outbox, event_bus.clone(), config.relay_config()).spawn(shutdown_rx.clone()));
    }
    tasks.push(AuctionFinisher::new(backends.authority.clone(), backends.bids.clone()).spawn(shutdown_rx));
    info!(tasks = tasks.len(), "Background tasks started");

    let gateway = BidGateway::new(backends.authority.clone()).with_timeout(config.gateway_timeout());
    let mut state = AppState::new(
        AuctionService::new(backends.authority.clone()),
        gateway.clone(),
        BidService::new(gateway, backends.bids.clone()),
        backends.search.clone(),
        fanout,
    );
    if let Some(metrics) = metrics {
        state = state.with_metrics(metrics);
    }
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    info!("HTTP server stopped, draining background tasks");

    shutdown_tx.send_replace(true);
    let drain = futures::future::join_all(tasks);
    match tokio::time::timeout(Duration::from_secs(config.server.shutdown_timeout), drain).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!(error = %e, "Background task failed");
                }
            }
        }
        Err(_) => warn!(
            timeout_secs = config.server.shutdown_timeout,
            "Background tasks did not stop in time"
        ),
    }

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        () = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
