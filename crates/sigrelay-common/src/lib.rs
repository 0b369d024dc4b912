//! Wire types shared by the sigrelay signaling relay and its clients.
//!
//! This crate provides:
//! - The signaling envelope and its JSON codec ([`envelope`])
//! - Identity/room aliases and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod types;

pub use envelope::{Envelope, EnvelopeError};
pub use types::{ClientId, RoomName};
