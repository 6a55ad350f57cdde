//! berth node agent
//!
//! Serves the agent RPC surface and runs the reconciliation loop until
//! Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use berth_agent::api::{self, AppState};
use berth_agent::config::Config;
use berth_agent::{
    DesiredStateStore, MemoryRegistry, MemoryRuntime, Reconciler, ReconcilerConfig, Supervisor,
    SupervisorConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_name = %config.node_name,
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        "Starting berth agent"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let desired = Arc::new(DesiredStateStore::open(config.state_db_path())?);

    // In-memory runtime until a real runtime client is wired.
    let runtime = Arc::new(MemoryRuntime::new(MemoryRegistry::new()));
    warn!("Using in-memory runtime, containers do not survive restarts");

    let supervisor = Arc::new(Supervisor::new(
        runtime,
        desired,
        SupervisorConfig::from_config(&config),
        config.network_plugin_dir.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        Arc::clone(&supervisor),
        ReconcilerConfig::from_config(&config),
    );
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(supervisor));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, reconciler_handle)
        .await
        .is_err()
    {
        warn!("Reconciler did not shut down in time");
    }

    info!("Agent shutdown complete");
    Ok(())
}
