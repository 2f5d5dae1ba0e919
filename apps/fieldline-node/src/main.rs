use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

mod config;
mod metrics;
mod server;
mod telemetry_db;

use fieldline_bus::{DurableBus, MemoryLedger, MessageLedger, SqliteLedger};
use fieldline_hub::{Hub, LatestValues, RouteKind, StreamBridge, SubscriptionIndex};
use fieldline_ingest::{
    BatchWriter, BatchWriterConfig, IngestAdapter, IngestConfig, MemoryStore, TelemetryStore,
};
use fieldline_token::{spawn_sweeper, TokenIssuer};
use fieldline_transport::{InMemoryBroker, PubSubTransport};
use fieldline_transport_ws::{WsTransport, WsTransportConfig};

use crate::config::NodeConfig;
use crate::metrics::MetricsState;
use crate::telemetry_db::SqliteTelemetryStore;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("FIELDLINE_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match NodeConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(MetricsState::default());

    let ledger: Arc<dyn MessageLedger> = match &config.ledger_db_path {
        Some(path) => {
            info!("message ledger at {}", path.display());
            match SqliteLedger::open(path) {
                Ok(ledger) => Arc::new(ledger),
                Err(err) => {
                    error!("fatal: {err}");
                    std::process::exit(1);
                }
            }
        }
        None => Arc::new(MemoryLedger::new()),
    };
    let bus = Arc::new(DurableBus::with_ledger(InMemoryBroker::shared(), ledger));
    if let Err(err) = bus.connect() {
        error!("fatal: bus connect failed: {err}");
        std::process::exit(1);
    }

    let device_transport: Arc<dyn PubSubTransport> = match &config.device_ws_url {
        Some(url) => {
            info!("device broker at {url}");
            Arc::new(WsTransport::new(WsTransportConfig::new(url.clone())))
        }
        None => {
            info!("no device broker configured, using in-process broker");
            InMemoryBroker::shared()
        }
    };

    let store: Arc<dyn TelemetryStore> = match &config.telemetry_db_path {
        Some(path) => {
            info!("telemetry store at {}", path.display());
            match SqliteTelemetryStore::open(path) {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    error!("fatal: {err}");
                    std::process::exit(1);
                }
            }
        }
        None => Arc::new(MemoryStore::new()),
    };

    let writer = BatchWriter::new(
        Arc::clone(&bus),
        store,
        BatchWriterConfig {
            ingest_topic: config.ingest_topic.clone(),
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
        },
    );
    if let Err(err) = writer.start() {
        error!("fatal: batch writer failed to start: {err}");
        std::process::exit(1);
    }

    let hub = Arc::new(Hub::new());
    let subscriptions = Arc::new(SubscriptionIndex::new());
    let latest = Arc::new(LatestValues::new());
    let bridge = StreamBridge::new(
        Arc::clone(&bus),
        Arc::clone(&hub),
        Arc::clone(&subscriptions),
        Arc::clone(&latest),
    );
    bridge.register_route(&config.measure_topic, RouteKind::Subscribers);
    bridge.register_route(&config.direct_topic, RouteKind::Direct);
    bridge.register_route(&config.broadcast_topic, RouteKind::TenantBroadcast);
    for filter in &config.live_fanout_filters {
        bridge.register_route(filter, RouteKind::Subscribers);
    }
    if let Err(err) = bridge.start() {
        error!("fatal: stream bridge failed to start: {err}");
        std::process::exit(1);
    }

    let ingest = IngestAdapter::with_handler(
        Arc::clone(&device_transport),
        IngestConfig {
            device_topic_filters: config.device_topic_filters.clone(),
            ingest_topic: config.ingest_topic.clone(),
        },
        {
            let bus = Arc::clone(&bus);
            let metrics = Arc::clone(&metrics);
            Arc::new(move |message| {
                metrics.frames_accepted.fetch_add(1, Ordering::Relaxed);
                match bus.publish(&message) {
                    Ok(_) => {
                        metrics.published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(id = %message.id, error = %err, "ingest republish failed");
                    }
                }
            })
        },
    );
    if let Err(err) = ingest.start() {
        error!("fatal: ingest adapter failed to start: {err}");
        std::process::exit(1);
    }

    let tokens = Arc::new(TokenIssuer::new(config.token_lifetime));
    let sweeper = spawn_sweeper(Arc::clone(&tokens), config.token_sweep_interval);

    let app_state = server::AppState {
        metrics: Arc::clone(&metrics),
        hub: Arc::clone(&hub),
        subscriptions: Arc::clone(&subscriptions),
        latest: Arc::clone(&latest),
        tokens: Arc::clone(&tokens),
        connection_queue_capacity: config.connection_queue_capacity,
        heartbeat_interval: config.heartbeat_interval,
    };
    let router = server::build_router(app_state);
    let bind_addr = format!("{}:{}", config.http_bind, config.http_port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("http server bind failed on {bind_addr}: {err}");
            std::process::exit(1);
        }
    };
    info!("fieldline node listening on {bind_addr}");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };
    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("http server error: {err}");
    }

    if let Err(err) = bridge.stop() {
        warn!("bridge stop failed: {err}");
    }
    if let Err(err) = writer.stop().await {
        warn!("batch writer stop failed: {err}");
    }
    if let Err(err) = ingest.stop() {
        warn!("ingest stop failed: {err}");
    }
    sweeper.stop().await;
    if let Err(err) = bus.close() {
        warn!("bus close failed: {err}");
    }
    info!("fieldline node stopped");
}
