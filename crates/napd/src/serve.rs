//! `napd serve` — wires the store, control loops, and HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use napgrid_autoscale::Autoscaler;
use napgrid_cluster::{ActivitySync, LeadershipSelector, Orchestrator, StaticOrchestrator, TopologySync};
use napgrid_core::NapConfig;
use napgrid_dispatch::AsyncDispatcher;
use napgrid_proxy::{BackendTransport, FunctionProxy, HttpTransport, ProxySettings, RetryPolicy};
use napgrid_state::{ActivityTracker, FunctionQueue, KeyValueStore, StateStore, TopologyCache};

pub async fn run(config: NapConfig, port: u16) -> anyhow::Result<()> {
    info!(namespace = %config.namespace, "napgrid daemon starting");

    // ── State ──────────────────────────────────────────────────────

    let store = match &config.store.path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            StateStore::open(path)?
        }
        None => StateStore::open_in_memory()?,
    };
    info!(path = ?config.store.path, "state store opened");

    let kv: Arc<dyn KeyValueStore> = Arc::new(store.clone());
    let queue: Arc<dyn FunctionQueue> = Arc::new(store);
    let topology = TopologyCache::new();
    let activity = ActivityTracker::new();

    // ── Collaborators ──────────────────────────────────────────────

    let orchestrator: Arc<dyn Orchestrator> =
        Arc::new(StaticOrchestrator::new(&config.namespace, &config.functions));
    info!(functions = config.functions.len(), "static orchestrator initialized");

    // Sync calls stream their body and are never retried.
    let sync_transport: Arc<dyn BackendTransport> = Arc::new(HttpTransport::new(
        config.proxy.base_function_url.clone(),
        config.namespace.clone(),
        config.proxy.request_timeout,
        RetryPolicy::none(),
    ));
    let async_transport: Arc<dyn BackendTransport> = Arc::new(HttpTransport::new(
        config.proxy.base_function_url.clone(),
        config.namespace.clone(),
        config.proxy.request_timeout,
        RetryPolicy {
            attempts: config.dispatcher.retry_attempts,
            base_delay: config.dispatcher.retry_base_delay,
        },
    ));

    // ── Control loops ──────────────────────────────────────────────

    let selector = LeadershipSelector::new(kv.clone(), config.cluster.lease);
    info!(id = %selector.id(), "leadership selector initialized");
    match selector.bootstrap().await {
        Ok(leader) => info!(leader, "initial leadership settled"),
        Err(e) => error!(error = %e, "initial leadership check failed"),
    }
    let leadership = selector.handle();

    let topology_sync = TopologySync::new(
        config.namespace.clone(),
        orchestrator.clone(),
        kv.clone(),
        topology.clone(),
        leadership.clone(),
    );
    let activity_sync = ActivitySync::new(kv, activity.clone(), topology.clone());
    let autoscaler = Autoscaler::new(topology.clone(), activity.clone(), orchestrator);
    let mut dispatcher = AsyncDispatcher::new(
        topology.clone(),
        activity.clone(),
        queue.clone(),
        async_transport,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cluster = config.cluster.clone();
    let autoscale_interval = config.autoscale.interval;
    let dispatch_tick = config.dispatcher.tick;

    let leader_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { selector.run(cluster.check_interval, shutdown).await })
    };
    let topology_handle = {
        let shutdown = shutdown_rx.clone();
        let interval = config.cluster.topology_interval;
        tokio::spawn(async move { topology_sync.run(interval, shutdown).await })
    };
    let activity_handle = {
        let shutdown = shutdown_rx.clone();
        let interval = config.cluster.activity_sync_interval;
        tokio::spawn(async move { activity_sync.run(interval, shutdown).await })
    };
    let autoscale_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            autoscaler
                .run(autoscale_interval, leadership, shutdown)
                .await
        })
    };
    let dispatch_handle = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { dispatcher.run(dispatch_tick, shutdown).await })
    };

    // ── HTTP server ────────────────────────────────────────────────

    let proxy = FunctionProxy::new(
        topology,
        activity,
        queue,
        sync_transport,
        ProxySettings::from(&config),
    );
    let router = napgrid_proxy::build_router(proxy);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "function proxy listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for handle in [
        leader_handle,
        topology_handle,
        activity_handle,
        autoscale_handle,
        dispatch_handle,
    ] {
        let _ = handle.await;
    }

    info!("napgrid daemon stopped");
    Ok(())
}
