//! rdp-client: client for actor-addressed remote debugging servers.
//!
//! Connects to the debugging server embedded in a desktop application, runs
//! script code in its main context and decodes the results.

mod actors;
mod client;
mod config;
mod error;
mod events;
mod retry;
mod status;

pub mod bridge;
pub mod correlator;
pub mod grip;
pub mod logging;

#[cfg(test)]
mod testing;

pub use actors::{ActorGeneration, DiscoveryPath, ResolvedActor, TargetSelector};
pub use bridge::protocol::{ActorId, RemoteEvent, RootInfo, TargetInfo};
pub use bridge::session::{Requester, SessionHandle};
pub use client::{DEFAULT_MESSAGE_TYPES, Evaluation, RdpClient};
pub use config::{
    ClientConfig, DEFAULT_ACTOR_TTL, DEFAULT_HOST, DEFAULT_KEEPALIVE_INTERVAL,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_PORT, DEFAULT_RECONNECT_DELAY,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use error::{ClientError, ConnectionFailure, FramingError, Result};
pub use events::{ClientEvent, InvalidationReason};
pub use grip::{RemoteValue, SpecialNumber, Symbol};
pub use retry::{FailureClass, RetryPolicy};
pub use status::{CLIENT_VERSION, ClientStatus, LinkPhase, LinkStatus};
