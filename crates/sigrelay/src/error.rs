use thiserror::Error;

/// Errors that end a connection attempt or a running session.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The upgrade request carried no `room` query parameter.
    #[error("missing room parameter")]
    MissingRoom,
    /// The upgrade request targeted a path other than the configured one.
    #[error("unknown upgrade path: {0}")]
    UnknownPath(String),
    /// A global or per-IP connection limit was reached.
    #[error("connection limit reached")]
    ConnectionLimit,
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
}
