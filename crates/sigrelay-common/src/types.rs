//! Core type definitions and protocol constants.

/// Opaque client-chosen identity, taken from the `from` field of the first
/// envelope a connection sends.
pub type ClientId = String;

/// Opaque room name chosen by the client when it connects.
pub type RoomName = String;

/// Query parameter on the upgrade request that selects the room.
pub const ROOM_QUERY_PARAM: &str = "room";

/// Default request path for the WebSocket upgrade.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Hard ceiling on a single WebSocket message (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
