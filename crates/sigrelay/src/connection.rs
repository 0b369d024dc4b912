use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use crate::ratelimit::RateLimiter;
use crate::registry::ConnHandle;
use crate::router::{self, Delivery};
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sigrelay_common::types::{MAX_FRAME_SIZE, ROOM_QUERY_PARAM};
use sigrelay_common::{ClientId, Envelope, RoomName};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use url::form_urlencoded;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Connected to a room but not reachable: no envelope with a `from` yet.
    AwaitingIdentity,
    /// Registered under the contained identity.
    Active(ClientId),
}

/// Per-connection relay logic: identity binding, limits, and routing.
///
/// Dropping a session removes its registry entry, so every way out of
/// [`handle_connection`] (including task abort) cleans up exactly once.
pub struct Session {
    state: Arc<ServerState>,
    room: RoomName,
    handle: ConnHandle,
    phase: Phase,
    limiter: RateLimiter,
}

impl Session {
    /// Start a session in `room` that receives through `handle`.
    #[must_use]
    pub fn new(state: Arc<ServerState>, room: RoomName, handle: ConnHandle) -> Self {
        let limiter = RateLimiter::new(state.config.msg_rate, state.config.bw_rate);
        Self {
            state,
            room,
            handle,
            phase: Phase::AwaitingIdentity,
            limiter,
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Bound identity, once the session is active.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        match &self.phase {
            Phase::Active(identity) => Some(identity),
            Phase::AwaitingIdentity => None,
        }
    }

    /// Room fixed at connect time.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// This session's own registry handle.
    #[must_use]
    pub fn handle(&self) -> &ConnHandle {
        &self.handle
    }

    /// Process one inbound data frame.
    ///
    /// Nothing here can end the session: oversized, throttled, malformed or
    /// cross-room messages are dropped and `None` is returned. Otherwise the
    /// per-destination fan-out result is returned.
    pub fn on_message(&mut self, message: &Message) -> Option<Vec<Delivery>> {
        let bytes: &[u8] = match message {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
            _ => return None,
        };
        counters::messages_received_total();
        counters::payload_bytes_total("in", bytes.len() as u64);

        if bytes.len() > self.state.config.max_payload {
            counters::messages_dropped_total("oversize");
            debug!(room = %self.room, size = bytes.len(), "dropping oversized message");
            return None;
        }

        if let Err(throttle) = self.limiter.check(bytes.len()) {
            counters::messages_dropped_total(throttle.as_label());
            debug!(
                room = %self.room,
                reason = throttle.as_label(),
                "dropping rate-limited message"
            );
            return None;
        }

        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                counters::messages_dropped_total("malformed");
                debug!(
                    room = %self.room,
                    identity = ?self.identity(),
                    "dropping undecodable message: {}",
                    e
                );
                return None;
            }
        };

        if self.phase == Phase::AwaitingIdentity {
            if let Some(from) = envelope.sender() {
                self.bind(from.to_string());
            }
        }

        if !envelope.room.is_empty() && envelope.room != self.room {
            counters::messages_dropped_total("room_mismatch");
            debug!(
                room = %self.room,
                claimed = %envelope.room,
                "dropping envelope addressed to another room"
            );
            return None;
        }

        Some(router::route(
            &self.state.registry,
            &self.room,
            self.identity(),
            &envelope,
            message,
        ))
    }

    fn bind(&mut self, identity: ClientId) {
        let registry = &self.state.registry;
        if let Some(previous) =
            registry.register(identity.clone(), self.room.clone(), self.handle.clone())
        {
            counters::identity_superseded_total();
            info!(identity = %identity, "identity reclaimed, closing previous connection");
            previous.close();
        }
        gauges::identities_registered(registry.len());
        info!(
            identity = %identity,
            room = %self.room,
            clients = registry.len(),
            rooms = registry.room_count(),
            "client registered"
        );
        self.phase = Phase::Active(identity);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Phase::Active(identity) = &self.phase {
            let registry = &self.state.registry;
            if registry.unregister(identity, self.handle.id) {
                info!(
                    identity = %identity,
                    room = %self.room,
                    clients = registry.len(),
                    rooms = registry.room_count(),
                    "client disconnected"
                );
            }
            gauges::identities_registered(registry.len());
        }
    }
}

/// Pick the room out of an upgrade request.
///
/// # Errors
///
/// [`RelayError::UnknownPath`] if the path is not `ws_path`,
/// [`RelayError::MissingRoom`] if the `room` query parameter is absent or empty.
pub fn room_from_request(req: &Request, ws_path: &str) -> Result<RoomName, RelayError> {
    let uri = req.uri();
    if uri.path() != ws_path {
        return Err(RelayError::UnknownPath(uri.path().to_string()));
    }
    uri.query()
        .and_then(|query| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| *key == ROOM_QUERY_PARAM)
                .map(|(_, value)| value.into_owned())
        })
        .filter(|room| !room.is_empty())
        .ok_or(RelayError::MissingRoom)
}

fn error_response(error: &RelayError) -> ErrorResponse {
    let status = match error {
        RelayError::UnknownPath(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    let mut resp = ErrorResponse::new(Some(error.to_string()));
    *resp.status_mut() = status;
    resp
}

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl IpGuard {
    /// Take one of the per-IP slots for `ip`, or `None` if they are all in use.
    fn acquire(state: &Arc<ServerState>, ip: IpAddr) -> Option<Self> {
        let mut count = state.ip_connections.entry(ip).or_insert(0);
        if *count >= state.config.max_conns_ip {
            return None;
        }
        *count += 1;
        drop(count);
        Some(Self {
            state: Arc::clone(state),
            ip,
        })
    }
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
        }
        self.state
            .ip_connections
            .remove_if(&self.ip, |_, count| *count == 0);
    }
}

/// Counts one upgraded connection on the active-connections gauge while alive.
struct ActiveGauge;

impl ActiveGauge {
    fn enter() -> Self {
        gauges::inc_connections_active();
        Self
    }
}

impl Drop for ActiveGauge {
    fn drop(&mut self) {
        gauges::dec_connections_active();
    }
}

fn close_frame(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Why the receive loop stopped without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    RemoteClosed,
    Idle,
    Superseded,
    Shutdown,
}

/// Drive the receive loop for one upgraded connection.
async fn run_session(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    outbound_rx: &mut mpsc::Receiver<Message>,
    session: &mut Session,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Exit, RelayError> {
    let config = &session.state.config;
    let mut ping_interval = interval(Duration::from_secs(config.ping_interval));
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle_timeout = Duration::from_secs(config.idle_timeout);
    let mut last_activity = Instant::now();
    let handle = session.handle().clone();

    if *shutdown.borrow_and_update() {
        let _ = ws_tx.send(close_frame(CloseCode::Away, "server shutting down")).await;
        return Ok(Exit::Shutdown);
    }

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        let _ = session.on_message(&msg);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(Exit::RemoteClosed),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    Some(Ok(_)) => {}
                }
            }
            Some(msg) = outbound_rx.recv() => {
                last_activity = Instant::now();
                ws_tx.send(msg).await?;
            }
            () = handle.closed() => {
                let _ = ws_tx
                    .send(close_frame(
                        CloseCode::Policy,
                        "identity claimed by another connection",
                    ))
                    .await;
                return Ok(Exit::Superseded);
            }
            _ = shutdown.changed() => {
                let _ = ws_tx.send(close_frame(CloseCode::Away, "server shutting down")).await;
                return Ok(Exit::Shutdown);
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    return Ok(Exit::Idle);
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}

/// Accept one TCP connection: upgrade it, run its session, and clean up.
///
/// # Errors
///
/// Returns an error if the connection is refused (limits, path, missing
/// room) or the transport fails while the session is running.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let Some(_ip_guard) = IpGuard::acquire(&state, peer_addr.ip()) else {
        counters::connections_rejected_total("max_conns_ip");
        debug!(
            ip = %peer_addr.ip(),
            limit = state.config.max_conns_ip,
            "per-IP connection limit exceeded"
        );
        return Err(RelayError::ConnectionLimit);
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..WebSocketConfig::default()
    };

    let mut selected: Option<Result<RoomName, RelayError>> = None;
    let ws_path = state.config.ws_path.as_str();
    let upgrade = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, resp: Response| {
            let result = room_from_request(req, ws_path);
            let reply = match &result {
                Ok(_) => Ok(resp),
                Err(e) => Err(error_response(e)),
            };
            selected = Some(result);
            reply
        },
        Some(ws_config),
    )
    .await;

    let room = match selected {
        Some(Ok(room)) => room,
        Some(Err(e)) => {
            let reason = match &e {
                RelayError::UnknownPath(_) => "unknown_path",
                _ => "missing_room",
            };
            counters::connections_rejected_total(reason);
            debug!(peer = %peer_addr, "refusing upgrade: {}", e);
            return Err(e);
        }
        None => {
            return Err(upgrade
                .err()
                .map_or(RelayError::ConnectionClosed, RelayError::from))
        }
    };
    let ws_stream = upgrade?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(state.config.outbound_queue);
    let handle = ConnHandle::new(state.registry.next_conn_id(), outbound_tx);
    let conn_id = handle.id;
    let mut session = Session::new(Arc::clone(&state), room, handle);

    let _active = ActiveGauge::enter();
    debug!(peer = %peer_addr, conn_id, room = %session.room(), "connection accepted");

    let result = run_session(
        &mut ws_tx,
        &mut ws_rx,
        &mut outbound_rx,
        &mut session,
        &mut shutdown,
    )
    .await;

    debug!(
        conn_id,
        identity = ?session.identity(),
        outcome = ?result,
        "session ended"
    );
    drop(session);

    result.map(|_| ())
}
