use std::sync::Arc;
use tracing::{error, info, warn};

use fleetgate::adapters::{PgStorage, RedisPubSub, WebhookNotifier};
use fleetgate::config::AppConfig;
use fleetgate::gateway::session::SessionRegistry;
use fleetgate::gateway::Gateway;
use fleetgate::ports::{AlertDispatcher, MessageBroker, StorageRepository};
use fleetgate::protocol::Transport;
use fleetgate::service::alert_engine::AlertEngine;
use fleetgate::service::broadcast_hub::BroadcastHub;
use fleetgate::service::command_dispatcher::CommandDispatcher;
use fleetgate::service::offline_sweep::run_offline_sweep;
use fleetgate::service::pipeline::PositionPipeline;
use fleetgate::state::live_state::LiveStateStore;
use fleetgate::state::rule_cache::RuleCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Environment and structured logging.
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting fleetgate telemetry core");

    // 2. Configuration.
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {err:#}");
            std::process::exit(1);
        }
    };

    // 3. Metrics endpoint.
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .idle_timeout(
            metrics_util::MetricKindMask::ALL,
            Some(std::time::Duration::from_secs(300)),
        )
        .install()
        .expect("failed to install Prometheus recorder");
    info!("prometheus metrics listening on 0.0.0.0:{}", config.metrics_port);

    // 4. Database pool and schema.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(50)
        .connect(&config.database_url)
        .await
        .map_err(|err| anyhow::anyhow!("failed to connect to database: {err}"))?;
    let storage = Arc::new(PgStorage::new(pool));
    storage.init_schema().await?;
    let storage: Arc<dyn StorageRepository> = storage;

    // 5. In-memory caches.
    let live = Arc::new(LiveStateStore::new());
    live.load_all(storage.as_ref()).await?;
    let rules = Arc::new(RuleCache::new(storage.clone()));
    rules.load_all().await?;

    // 6. Pub/sub seam (optional) and broadcast hub.
    let broker: Option<Arc<dyn MessageBroker>> = match &config.redis_url {
        Some(url) => Some(Arc::new(RedisPubSub::connect(url).await?)),
        None => {
            info!("REDIS_URL unset, running without cross-process fan-out");
            None
        }
    };
    let hub = Arc::new(BroadcastHub::new(broker));

    // 7. Alert engine and notification seam.
    let notifier: Arc<dyn AlertDispatcher> =
        Arc::new(WebhookNotifier::new(config.dispatcher_url.clone()));
    let engine = Arc::new(AlertEngine::new(
        storage.clone(),
        rules.clone(),
        notifier,
        hub.clone(),
    ));

    // 8. Session registry, command dispatcher, pipeline.
    let (sessions, connect_rx) = SessionRegistry::new();
    let dispatcher = Arc::new(CommandDispatcher::new(storage.clone(), sessions.clone()));
    let pipeline = Arc::new(PositionPipeline::new(
        storage.clone(),
        live.clone(),
        engine.clone(),
        hub.clone(),
    ));

    let gateway = Arc::new(Gateway {
        storage: storage.clone(),
        pipeline: pipeline.clone(),
        dispatcher: dispatcher.clone(),
        sessions: sessions.clone(),
        live: live.clone(),
    });

    // 9. Background tasks.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let dispatcher_handle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown_rx.clone();
        async move { dispatcher.run(connect_rx, shutdown).await }
    });

    let sweep_handle = tokio::spawn(run_offline_sweep(
        storage.clone(),
        live.clone(),
        engine.clone(),
        pipeline.clone(),
        shutdown_rx.clone(),
    ));

    // 10. Protocol listeners.
    let mut listener_handles = Vec::new();
    for (kind, port) in &config.listeners {
        let addr: std::net::SocketAddr =
            format!("{}:{}", config.bind_address, port).parse()?;
        let gateway = gateway.clone();
        let shutdown = shutdown_rx.clone();
        let kind = *kind;
        listener_handles.push(tokio::spawn(async move {
            let result = match kind.transport() {
                Transport::Tcp => gateway.run_tcp_listener(kind, addr, shutdown).await,
                Transport::Udp => gateway.run_udp_listener(kind, addr, shutdown).await,
            };
            if let Err(err) = result {
                error!(protocol = kind.name(), "listener failed: {err:#}");
            }
        }));
    }

    info!(
        listeners = config.listeners.len(),
        "fleetgate running, press Ctrl+C to stop"
    );

    // 11. Shutdown: stop accepting, close sessions, drain tasks, flush state.
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }
    let _ = shutdown_tx.send(true);
    sessions.close_all();

    let drain = std::time::Duration::from_secs(10);
    for handle in listener_handles {
        if tokio::time::timeout(drain, handle).await.is_err() {
            warn!("listener did not stop in time");
        }
    }
    let _ = tokio::time::timeout(drain, dispatcher_handle).await;
    let _ = tokio::time::timeout(drain, sweep_handle).await;

    for state in live.all() {
        if let Err(err) = storage.persist_state(&state).await {
            warn!(device_id = state.device_id, "final state flush failed: {err:#}");
        }
    }

    info!("shutdown complete");
    Ok(())
}
