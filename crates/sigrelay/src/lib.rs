//! sigrelay — room-scoped WebSocket signaling relay.
//!
//! Peers join a room with `/ws?room=<name>`, announce themselves with the
//! `from` field of their first envelope, and exchange opaque signaling
//! messages either with one addressed peer or with the whole room.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
/// Connection sessions: upgrade, identity binding, receive loop.
pub mod connection;
/// Error types for relay server operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
mod ratelimit;
/// Identity → connection table partitioned by room.
pub mod registry;
/// Room-scoped fan-out of envelopes.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
