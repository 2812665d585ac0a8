use edgegate::admin_listener::AdminListener;
use edgegate::config::{BootstrapConfig, GatewayConfig};
use edgegate::listener::Listener;
use edgegate::pipeline::GatewayState;
use edgegate::repository::Repositories;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// How long to wait for listener tasks to drain after the stop signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Edgegate API Gateway");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_env()?;
    info!(
        "config: gateway={}, admin={}, lb={:?}, cache_enabled={}, rate_limit_enabled={}",
        config.listen_addr,
        config.admin_addr,
        config.lb_strategy,
        config.cache_enabled,
        config.rate_limit_enabled
    );

    let repos = Repositories::in_memory();
    if let Some(path) = &config.bootstrap_file {
        seed(&repos, path).await?;
    } else {
        warn!("no BOOTSTRAP_FILE set, starting with an empty configuration store");
    }

    let state = GatewayState::new(config.clone(), repos);
    state.start_background().await?;

    let gateway_listener = Listener::bind(&config.listen_addr, state.clone()).await?;
    let admin_listener = AdminListener::bind(&config.admin_addr, state.metrics.clone()).await?;
    info!(
        gateway = %gateway_listener.local_addr(),
        admin = %admin_listener.local_addr(),
        "edgegate up (/health, /metrics, /stats on admin)"
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut listeners = JoinSet::new();
    listeners.spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = gateway_listener.serve(shutdown_rx).await {
                error!("data plane listener failed: {}", e);
            }
            "data plane"
        }
    });
    listeners.spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener failed: {}", e);
            }
            "admin"
        }
    });

    // Run until ctrl-c, or until a listener dies underneath us.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c, draining");
        }
        finished = listeners.join_next() => match finished {
            Some(Ok(name)) => warn!(listener = name, "listener exited unexpectedly, shutting down"),
            Some(Err(e)) => error!("listener task panicked: {}", e),
            None => {}
        },
    }

    // Stop order: listeners first so no new requests arrive, then the
    // background actors, each joined under its own deadline.
    let _ = shutdown_tx.send(());
    let drain = async {
        while let Some(finished) = listeners.join_next().await {
            if let Err(e) = finished {
                error!("listener task panicked during drain: {}", e);
            }
        }
    };
    if timeout(DRAIN_DEADLINE, drain).await.is_err() {
        warn!("listeners still busy after {:?}, abandoning them", DRAIN_DEADLINE);
    }
    state.shutdown().await;

    info!("edgegate stopped");
    Ok(())
}

/// Seeds the in-memory store from the bootstrap file.
async fn seed(repos: &Repositories, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bootstrap = BootstrapConfig::from_file(path)?;
    info!(
        "seeding {} tenant(s), {} origin(s), {} route(s) from {}",
        bootstrap.tenants.len(),
        bootstrap.origins.len(),
        bootstrap.routes.len(),
        path
    );

    for tenant in bootstrap.tenants {
        repos.tenants.create(tenant).await?;
    }
    for origin in bootstrap.origins {
        repos.origins.create(origin).await?;
    }
    for route in bootstrap.routes {
        repos.routes.create(route).await?;
    }
    Ok(())
}
