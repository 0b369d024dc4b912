#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use sigrelay::config::{Args, ServerConfig};
use sigrelay::error::RelayError;
use sigrelay::metrics::start_metrics_server;
use sigrelay::run_with_shutdown;
use sigrelay::server::ServerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let state = Arc::new(ServerState::new(config.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}, upgrades on {}", config.listen, config.ws_path);

    tokio::spawn({
        let health = state.health.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::select! {
        result = &mut server => {
            report(result);
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    report(server.await);

    Ok(())
}

fn report(result: Result<Result<(), RelayError>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("server error: {}", e),
        Err(e) => error!("server task failed: {}", e),
    }
}
