//! Error taxonomy for the debugging client.
//!
//! Framing problems are recovered inside the codec and never reach callers.
//! Actor and connection failures are retried by [`crate::RdpClient::with_retry`]
//! and only surface once the retry budget is spent.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::retry::FailureClass;

/// Why a transport-level operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    Refused,
    Reset,
    BrokenPipe,
    TimedOut,
    NotConnected,
    /// The socket was closed, either by the remote side or by a reconnect.
    Closed,
    Other,
}

impl ConnectionFailure {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Self::Reset,
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::NotConnected => Self::NotConnected,
            io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refused => "refused",
            Self::Reset => "reset",
            Self::BrokenPipe => "broken pipe",
            Self::TimedOut => "timed out",
            Self::NotConnected => "not connected",
            Self::Closed => "closed",
            Self::Other => "failed",
        }
    }
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload that had a valid length prefix but was not parseable JSON.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {length}-byte payload: {reason}")]
pub struct FramingError {
    pub length: usize,
    pub reason: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// Well-formed reply carrying an `error` field.
    #[error("{actor} replied with '{error}': {message}")]
    Protocol {
        actor: String,
        error: String,
        message: String,
    },

    #[error("no such actor: {actor}")]
    NoSuchActor { actor: String, message: String },

    #[error("connection {kind}: {detail}")]
    Connection {
        kind: ConnectionFailure,
        detail: String,
    },

    #[error("request '{kind}' to {actor} timed out after {timeout:?}")]
    Timeout {
        actor: String,
        kind: String,
        timeout: Duration,
    },

    #[error("no intro packet received within {0:?}")]
    Handshake(Duration),

    #[error(
        "could not resolve an execution actor (process path: {process_path}; tab path: {tab_path})"
    )]
    Resolution {
        process_path: String,
        tab_path: String,
    },

    #[error("malformed response from {actor}: {detail}")]
    MalformedResponse { actor: String, detail: String },
}

impl ClientError {
    pub fn connection(kind: ConnectionFailure, detail: impl Into<String>) -> Self {
        Self::Connection {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_connected() -> Self {
        Self::connection(ConnectionFailure::NotConnected, "no open session")
    }

    pub fn closed(detail: impl Into<String>) -> Self {
        Self::connection(ConnectionFailure::Closed, detail)
    }

    pub fn from_io(err: &io::Error) -> Self {
        Self::connection(ConnectionFailure::from_io(err), err.to_string())
    }

    pub fn malformed(actor: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::MalformedResponse {
            actor: actor.into(),
            detail: detail.into(),
        }
    }

    /// Build the error for a reply packet that carried `error` and/or `message`.
    ///
    /// "No such actor" replies get their own variant so the retry wrapper can
    /// invalidate the actor cache instead of reconnecting.
    pub fn from_error_packet(actor: &str, error: Option<&str>, message: Option<&str>) -> Self {
        let error = error.unwrap_or("unknownError");
        let message = message.unwrap_or(error);
        let missing_actor = error == "noSuchActor"
            || message.to_ascii_lowercase().contains("no such actor");
        if missing_actor {
            Self::NoSuchActor {
                actor: actor.to_string(),
                message: message.to_string(),
            }
        } else {
            Self::Protocol {
                actor: actor.to_string(),
                error: error.to_string(),
                message: message.to_string(),
            }
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::NoSuchActor { .. } => FailureClass::Actor,
            Self::Connection { .. } | Self::Handshake(_) => FailureClass::Connection,
            _ => FailureClass::Unknown,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                kind: ConnectionFailure::Closed,
                ..
            }
        )
    }

    /// Remediation text for user-facing tool output.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Connection {
                kind: ConnectionFailure::Refused,
                ..
            } => Some(
                "The target application is not running, or its remote debugging server is not listening on the configured port.",
            ),
            Self::Connection {
                kind: ConnectionFailure::TimedOut,
                ..
            } => Some(
                "The debugging port did not answer in time; it may be blocked by a firewall or bound to another interface.",
            ),
            Self::Handshake(_) => Some(
                "Something is listening on the port but did not speak the remote debugging protocol; check that the debugging bridge is installed and enabled.",
            ),
            Self::Resolution { .. } => Some(
                "The debugging server is reachable but exposes no execution context; make sure the application's main window is open.",
            ),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
