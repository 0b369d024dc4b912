use clap::Parser;
use sigrelay_common::types::{DEFAULT_WS_PATH, MAX_FRAME_SIZE};
use std::net::SocketAddr;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "sigrelay")]
#[command(about = "Room-scoped WebSocket signaling relay")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "SIGRELAY_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "SIGRELAY_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Request path accepted for the WebSocket upgrade.
    #[arg(long, default_value = DEFAULT_WS_PATH, env = "SIGRELAY_WS_PATH")]
    pub ws_path: String,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "SIGRELAY_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "50", env = "SIGRELAY_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum messages per minute per connection.
    #[arg(long, default_value = "600", env = "SIGRELAY_MSG_RATE")]
    pub msg_rate: u32,
    /// Maximum bytes per minute per connection.
    #[arg(long, default_value = "16777216", env = "SIGRELAY_BW_RATE")]
    pub bw_rate: u64,
    /// Maximum accepted message size in bytes; larger messages are dropped.
    #[arg(long, default_value = "262144", env = "SIGRELAY_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Capacity of each connection's outbound queue, in messages.
    #[arg(long, default_value = "256", env = "SIGRELAY_OUTBOUND_QUEUE")]
    pub outbound_queue: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "SIGRELAY_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "SIGRELAY_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Request path accepted for the WebSocket upgrade.
    pub ws_path: String,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum messages per minute per connection.
    pub msg_rate: u32,
    /// Maximum bytes per minute per connection.
    pub bw_rate: u64,
    /// Maximum accepted message size in bytes.
    pub max_payload: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if !self.ws_path.starts_with('/') {
            return Err("ws_path must start with '/'".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.msg_rate > 1_000_000 {
            return Err("msg_rate exceeds reasonable limit (1,000,000 msg/min)".to_string());
        }

        if self.bw_rate == 0 {
            return Err("bw_rate must be greater than 0".to_string());
        }
        if self.bw_rate > 100_000_000_000 {
            return Err("bw_rate exceeds reasonable limit (100 GB/min)".to_string());
        }

        // Anything above the frame ceiling is cut off by the WebSocket layer
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_FRAME_SIZE {
            return Err(format!(
                "max_payload exceeds maximum allowed ({MAX_FRAME_SIZE} bytes)"
            ));
        }

        if self.outbound_queue == 0 {
            return Err("outbound_queue must be greater than 0".to_string());
        }
        if self.outbound_queue > 65_536 {
            return Err("outbound_queue exceeds reasonable limit (65536 messages)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            ws_path: args.ws_path,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            msg_rate: args.msg_rate,
            bw_rate: args.bw_rate,
            max_payload: args.max_payload,
            outbound_queue: args.outbound_queue,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
        }
    }
}
