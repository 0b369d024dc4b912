use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::metrics::{counters, HealthState};
use crate::registry::Registry;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the relay server.
pub struct ServerState {
    /// Identity → connection table shared by every session.
    pub registry: Registry,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Number of accepted connections still being served.
    pub active_connections: AtomicUsize,
    /// Readiness reported on the metrics endpoint.
    pub health: HealthState,
}

impl ServerState {
    /// Create fresh server state for `config`.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
            health: HealthState::new(),
        }
    }
}

/// Holds one slot of `max_conns` for the lifetime of a connection task.
struct ConnectionSlot(Arc<ServerState>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Run the accept loop until the process exits.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop until `shutdown` flips to `true` or its sender is dropped.
///
/// On shutdown the loop stops accepting, every session is told to close,
/// and in-flight sessions get up to 30 seconds to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr()?;
    info!("server listening on {}", local_addr);
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let active = state.active_connections.fetch_add(1, Ordering::Relaxed);
                        let slot = ConnectionSlot(Arc::clone(&state));
                        if active >= state.config.max_conns {
                            counters::connections_rejected_total("max_conns");
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            drop(slot);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        let shutdown = shutdown.clone();
                        sessions.spawn(async move {
                            let _slot = slot;
                            if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                                debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
                while sessions.try_join_next().is_some() {}
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutdown signal received, draining {} connections", sessions.len());
                    break;
                }
            }
        }
    }

    state.health.set_ready(false);
    drop(listener);

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            sessions.len()
        );
        sessions.abort_all();
    }

    info!("server shut down");
    Ok(())
}
