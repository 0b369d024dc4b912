#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use sigrelay::config::ServerConfig;
use sigrelay::server::ServerState;
use sigrelay_common::Envelope;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        ws_path: "/ws".to_string(),
        max_conns: 1000,
        max_conns_ip: 100,
        msg_rate: 600,
        bw_rate: 16_777_216,
        max_payload: 262_144,
        outbound_queue: 256,
        ping_interval: 30,
        idle_timeout: 120,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub shutdown: watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = test_config(addr);
        tweak(&mut config);
        let state = Arc::new(ServerState::new(config));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let state_clone = Arc::clone(&state);
        let task = tokio::spawn(async move {
            if let Err(e) = sigrelay::run_with_shutdown(listener, state_clone, shutdown_rx).await
            {
                eprintln!("server error in test: {e}");
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            state,
            shutdown,
            task,
        }
    }

    pub fn url(&self, room: &str) -> String {
        format!("ws://{}/ws?room={room}", self.addr)
    }

    /// Poll until `identity` is registered (or not) in `room`.
    pub async fn wait_registered(&self, identity: &str, room: &str, present: bool) {
        for _ in 0..100 {
            let found = self
                .state
                .registry
                .members_of(room)
                .iter()
                .any(|m| m.identity == identity);
            if found == present {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{identity} registered={present} in {room} never observed");
    }
}

type Stream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<Stream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<Stream>,
    pub identity: String,
    pub room: String,
}

impl TestClient {
    /// Connect to `room` without sending anything.
    pub async fn connect(server: &TestServer, room: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(server.url(room))
            .await
            .unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self {
            ws_tx,
            ws_rx,
            identity: String::new(),
            room: room.to_string(),
        }
    }

    /// Connect and register `identity` with a `join` broadcast, then wait
    /// until the server has bound it.
    pub async fn join(server: &TestServer, room: &str, identity: &str) -> Self {
        let mut client = Self::connect(server, room).await;
        client.identity = identity.to_string();
        let hello = Envelope::broadcast("join", "", room, identity);
        client.send(&hello).await;
        server.wait_registered(identity, room, true).await;
        client
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws_tx.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Send an envelope as text and return the exact bytes that went out.
    pub async fn send(&mut self, envelope: &Envelope) -> String {
        let text = String::from_utf8(envelope.encode().unwrap()).unwrap();
        self.send_raw(&text).await;
        text
    }

    pub async fn broadcast(&mut self, kind: &str, data: &str) -> String {
        let env = Envelope::broadcast(kind, data, &self.room, &self.identity);
        self.send(&env).await
    }

    pub async fn send_to(&mut self, to: &str, kind: &str, data: &str) -> String {
        let env = Envelope::targeted(kind, data, &self.room, &self.identity, to);
        self.send(&env).await
    }

    /// Next data message, skipping `join` announcements from other peers.
    pub async fn recv_message(&mut self, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws_rx.next())
                .await
                .ok()??
                .ok()?;
            match msg {
                Message::Text(ref text) => {
                    if Envelope::decode(text.as_bytes()).is_ok_and(|e| e.kind == "join") {
                        continue;
                    }
                    return Some(msg);
                }
                Message::Binary(_) | Message::Close(_) => return Some(msg),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    pub async fn recv_text(&mut self) -> String {
        match self.recv_message(Duration::from_secs(5)).await {
            Some(Message::Text(text)) => text,
            other => panic!("expected text message, got {other:?}"),
        }
    }

    /// Assert nothing but `join` chatter arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Some(msg) = self.recv_message(window).await {
            panic!("{} expected silence, got {msg:?}", self.identity);
        }
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self, timeout: Duration) -> bool {
        let result = tokio::time::timeout(timeout, async {
            while let Some(msg) = self.ws_rx.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => return true,
                    _ => {}
                }
            }
            true
        })
        .await;
        result.unwrap_or(false)
    }
}
