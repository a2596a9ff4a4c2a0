//! Wire protocol types for the remote debugging server.
//!
//! Three packet shapes travel over the socket:
//! - **Requests** (client to server): `{"to": actor, "type": op, ...fields}`
//! - **Replies** (server to client): `{"from": actor, ...fields}`, or an error
//!   payload carrying `error` and optionally `message`
//! - **Events** (server to client, unsolicited): `{"type": name, ...}` where
//!   `name` is in [`EVENT_TYPES`]
//!
//! Replies carry no request id. They are matched to requests by arrival order
//! (see [`crate::correlator`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClientError, Result};

/// Well-known entry point actor.
pub const ROOT_ACTOR: &str = "root";

/// Packet types that are unsolicited notifications, never replies.
pub const EVENT_TYPES: &[&str] = &[
    "tabNavigated",
    "tabDetached",
    "newSource",
    "consoleAPICall",
    "pageError",
    "logMessage",
    "frameUpdate",
    "workerListChanged",
    "tabListChanged",
    "processListChanged",
    "forwardingCancelled",
];

/// Events after which a cached execution actor can no longer be trusted.
pub const INVALIDATING_EVENT_TYPES: &[&str] = &[
    "tabNavigated",
    "tabDetached",
    "frameUpdate",
    "workerListChanged",
];

pub fn is_event_type(kind: &str) -> bool {
    EVENT_TYPES.contains(&kind)
}

pub fn is_invalidating(kind: &str) -> bool {
    INVALIDATING_EVENT_TYPES.contains(&kind)
}

/// Identifier of a remote actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ActorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl PartialEq<&str> for ActorId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound request packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub to: ActorId,
    pub kind: String,
    pub fields: Map<String, Value>,
}

impl Request {
    pub fn new(to: impl Into<ActorId>, kind: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Merge operation-specific fields. Only JSON objects contribute;
    /// `to` and `type` cannot be overridden.
    pub fn with_fields(mut self, fields: Value) -> Self {
        if let Value::Object(map) = fields {
            for (key, value) in map {
                if key != "to" && key != "type" {
                    self.fields.insert(key, value);
                }
            }
        }
        self
    }

    pub fn into_value(self) -> Value {
        let mut packet = self.fields;
        packet.insert("to".to_string(), Value::String(self.to.0));
        packet.insert("type".to_string(), Value::String(self.kind));
        Value::Object(packet)
    }
}

/// Application identity from the intro packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootInfo {
    pub application_type: String,
    #[serde(default)]
    pub traits: Map<String, Value>,
}

impl RootInfo {
    pub fn from_intro(packet: &Value) -> Result<Self> {
        Self::deserialize(packet)
            .map_err(|e| ClientError::malformed(ROOT_ACTOR, format!("invalid intro packet: {e}")))
    }

    pub fn has_trait(&self, name: &str) -> bool {
        self.traits.get(name).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// The intro packet is the only one carrying `applicationType`.
pub fn is_intro(packet: &Value) -> bool {
    packet.get("applicationType").is_some()
}

/// Window or process the execution actor belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_id: Option<u64>,
}

impl TargetInfo {
    /// Read title, url and window id from a tab or target descriptor.
    pub fn from_descriptor(descriptor: &Value) -> Self {
        let text = |key: &str| {
            descriptor
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let window_id = ["outerWindowID", "browserId"]
            .iter()
            .find_map(|key| descriptor.get(*key).and_then(Value::as_u64));
        Self {
            title: text("title"),
            url: text("url"),
            window_id,
        }
    }
}

/// Unsolicited packet from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    /// The packet's `type`, if it had one.
    pub kind: Option<String>,
    pub from: Option<String>,
    pub packet: Value,
}

impl RemoteEvent {
    pub fn from_packet(packet: Value) -> Self {
        let field = |key: &str| packet.get(key).and_then(Value::as_str).map(str::to_owned);
        Self {
            kind: field("type"),
            from: field("from"),
            packet,
        }
    }

    pub fn is_invalidating(&self) -> bool {
        self.kind.as_deref().is_some_and(is_invalidating)
    }
}

/// Interim reply to `evaluateJSAsync`: only `from` and `resultID`.
/// The actual result follows in a separate packet.
pub fn is_evaluation_ack(packet: &Value) -> bool {
    let Some(obj) = packet.as_object() else {
        return false;
    };
    obj.contains_key("resultID")
        && !obj.contains_key("type")
        && !obj.contains_key("result")
        && obj.keys().all(|k| k == "from" || k == "resultID")
}

/// Error details if the reply is an error payload.
///
/// A reply is an error if it has an `error` field, or if its only content
/// besides `from` is a string `message`.
pub fn reply_error(packet: &Value) -> Option<(Option<&str>, Option<&str>)> {
    let obj = packet.as_object()?;
    let message = obj.get("message").and_then(Value::as_str);
    if let Some(error) = obj.get("error") {
        return Some((error.as_str(), message));
    }
    if message.is_some() && obj.keys().all(|k| k == "from" || k == "message") {
        return Some((None, message));
    }
    None
}

/// Raw `evaluationResult` packet, before grip decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReply {
    pub result: Value,
    pub exception: Option<Value>,
    /// Usually a string, but may be a long string grip.
    pub exception_message: Option<Value>,
    pub result_id: Option<String>,
}

impl EvaluationReply {
    pub fn from_packet(actor: &str, packet: &Value) -> Result<Self> {
        let obj = packet
            .as_object()
            .ok_or_else(|| ClientError::malformed(actor, "evaluation reply is not an object"))?;
        let present = |key: &str| obj.get(key).filter(|v| !v.is_null()).cloned();

        let exception = present("exception");
        let result = match (obj.get("result"), &exception) {
            (Some(result), _) => result.clone(),
            (None, Some(_)) => Value::Null,
            (None, None) => {
                return Err(ClientError::malformed(
                    actor,
                    "evaluation reply has neither result nor exception",
                ));
            }
        };

        Ok(Self {
            result,
            exception,
            exception_message: present("exceptionMessage"),
            result_id: obj
                .get("resultID")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }
}
