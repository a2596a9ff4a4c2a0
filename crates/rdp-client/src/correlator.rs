//! Reply correlation for a single connection.
//!
//! The protocol has no request ids: the oldest outstanding request gets the
//! next packet that is neither an event nor an evaluation ack. A request that
//! times out is dropped from the queue, but the server will still answer it
//! eventually, and that late reply goes to whichever request is oldest by
//! then. The protocol has no way to cancel a request, so this cannot be
//! detected client-side.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::bridge::protocol::{self, ActorId, RemoteEvent};
use crate::error::{ClientError, Result};

pub type ReplySender = oneshot::Sender<Result<Value>>;

#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub to: ActorId,
    pub kind: String,
    pub timeout: Duration,
    pub deadline: Instant,
    reply: ReplySender,
}

impl PendingRequest {
    fn complete(self, result: Result<Value>) {
        if self.reply.send(result).is_err() {
            tracing::debug!(request_id = self.id, kind = %self.kind, "Caller dropped before reply arrived");
        }
    }
}

/// What [`Correlator::dispatch`] did with a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Event {
        event: RemoteEvent,
        invalidates: bool,
    },
    /// Evaluation ack, dropped.
    Ack,
    Resolved {
        id: u64,
        ok: bool,
    },
    /// Reply-shaped packet with no request outstanding.
    Unsolicited(RemoteEvent),
}

#[derive(Debug, Default)]
pub struct Correlator {
    pending: VecDeque<PendingRequest>,
    next_id: u64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request. Must be called before the request is written.
    pub fn register(
        &mut self,
        to: ActorId,
        kind: impl Into<String>,
        timeout: Duration,
        reply: ReplySender,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.push_back(PendingRequest {
            id,
            to,
            kind: kind.into(),
            timeout,
            deadline: Instant::now() + timeout,
            reply,
        });
        id
    }

    pub fn dispatch(&mut self, packet: Value) -> Dispatch {
        let kind = packet.get("type").and_then(Value::as_str);
        if kind.is_some_and(protocol::is_event_type) {
            let event = RemoteEvent::from_packet(packet);
            let invalidates = event.is_invalidating();
            return Dispatch::Event { event, invalidates };
        }

        if protocol::is_evaluation_ack(&packet) {
            tracing::trace!(?packet, "Ignoring evaluation ack");
            return Dispatch::Ack;
        }

        let Some(request) = self.pending.pop_front() else {
            tracing::debug!(?packet, "Reply with no pending request");
            return Dispatch::Unsolicited(RemoteEvent::from_packet(packet));
        };

        let id = request.id;
        match protocol::reply_error(&packet) {
            Some((error, message)) => {
                let actor = packet
                    .get("from")
                    .and_then(Value::as_str)
                    .unwrap_or(request.to.as_str());
                let err = ClientError::from_error_packet(actor, error, message);
                tracing::debug!(request_id = id, kind = %request.kind, error = %err, "Request failed");
                request.complete(Err(err));
                Dispatch::Resolved { id, ok: false }
            }
            None => {
                tracing::trace!(request_id = id, kind = %request.kind, "Request resolved");
                request.complete(Ok(packet));
                Dispatch::Resolved { id, ok: true }
            }
        }
    }

    /// Reject every request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        if !self.pending.iter().any(|r| r.deadline <= now) {
            return 0;
        }

        let mut expired = 0;
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for request in self.pending.drain(..) {
            if request.deadline <= now {
                expired += 1;
                tracing::warn!(
                    request_id = request.id,
                    actor = %request.to,
                    kind = %request.kind,
                    "Request timed out"
                );
                let err = ClientError::Timeout {
                    actor: request.to.to_string(),
                    kind: request.kind.clone(),
                    timeout: request.timeout,
                };
                request.complete(Err(err));
            } else {
                kept.push_back(request);
            }
        }
        self.pending = kept;
        expired
    }

    /// Reject everything outstanding, e.g. on teardown.
    pub fn reject_all(&mut self, err: &ClientError) -> usize {
        let count = self.pending.len();
        for request in self.pending.drain(..) {
            request.complete(Err(err.clone()));
        }
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|r| r.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
