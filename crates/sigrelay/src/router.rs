use crate::metrics::{counters, histograms};
use crate::registry::{Member, Registry};
use sigrelay_common::{ClientId, Envelope};
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use tungstenite::Message;

/// What happened when a message was handed to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued on the destination's outbound queue.
    Queued,
    /// The destination's queue is full; the message was dropped.
    QueueFull,
    /// The destination's session has ended; the message was dropped.
    Disconnected,
}

/// Per-destination result of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Destination identity.
    pub identity: ClientId,
    /// Outcome for that destination.
    pub outcome: DeliveryOutcome,
}

/// Members of `room` that should receive a message from `sender`.
///
/// With a `target`, at most the one member holding that identity; otherwise
/// every member. The sender is never included.
#[must_use]
pub fn destinations(
    registry: &Registry,
    room: &str,
    sender: Option<&str>,
    target: Option<&str>,
) -> Vec<Member> {
    registry
        .members_of(room)
        .into_iter()
        .filter(|member| Some(member.identity.as_str()) != sender)
        .filter(|member| target.map_or(true, |to| member.identity == to))
        .collect()
}

/// Fan `message` out to the destinations selected by `envelope`.
///
/// `message` is the frame exactly as it was read from the sender and is
/// forwarded unchanged. Each destination is attempted independently and
/// nothing is retried; a dead destination is cleaned up by its own session.
pub fn route(
    registry: &Registry,
    room: &str,
    sender: Option<&str>,
    envelope: &Envelope,
    message: &Message,
) -> Vec<Delivery> {
    let members = destinations(registry, room, sender, envelope.target());
    histograms::fanout_size(members.len());

    if members.is_empty() {
        if let Some(to) = envelope.target() {
            counters::messages_dropped_total("offline");
            debug!(room, to, "target not present in room");
        }
        return Vec::new();
    }

    let size = message.len() as u64;
    members
        .into_iter()
        .map(|member| {
            let outcome = match member.handle.tx.try_send(message.clone()) {
                Ok(()) => {
                    counters::messages_relayed_total();
                    counters::payload_bytes_total("out", size);
                    DeliveryOutcome::Queued
                }
                Err(TrySendError::Full(_)) => {
                    counters::messages_dropped_total("queue_full");
                    debug!(room, to = %member.identity, "outbound queue full, dropping");
                    DeliveryOutcome::QueueFull
                }
                Err(TrySendError::Closed(_)) => {
                    counters::messages_dropped_total("offline");
                    debug!(room, to = %member.identity, "destination gone, dropping");
                    DeliveryOutcome::Disconnected
                }
            };
            Delivery {
                identity: member.identity,
                outcome,
            }
        })
        .collect()
}
