//! Notifications published on the client's broadcast channel.

use std::time::Duration;

use crate::bridge::protocol::{RemoteEvent, RootInfo};

/// Slow subscribers lag (and see `RecvError::Lagged`) past this many
/// undelivered events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Intro received, session ready.
    Connected { root: RootInfo },
    Disconnected { reason: String },
    /// About to wait `delay` before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32, delay: Duration },
    ActorsInvalidated { reason: InvalidationReason },
    KeepaliveFailed { error: String },
    KeepaliveReconnected,
    /// Non-fatal wire problem, e.g. a frame that was not valid JSON.
    TransportError { error: String },
    /// Protocol event, or a reply nobody was waiting for.
    Remote(RemoteEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    /// An invalidating protocol event, by type.
    Event(String),
    NoSuchActor,
    Reconnect,
    Disconnect,
}

impl InvalidationReason {
    pub fn name(&self) -> &str {
        match self {
            Self::Event(kind) => kind,
            Self::NoSuchActor => "noSuchActor",
            Self::Reconnect => "reconnect",
            Self::Disconnect => "disconnect",
        }
    }
}
