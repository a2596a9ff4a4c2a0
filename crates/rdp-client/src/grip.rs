//! Decoding of remote value grips.
//!
//! A grip is the server's serialized form of a value produced by evaluation.
//! [`decode`] converts one into a [`RemoteValue`] without network access;
//! [`resolve`] does the same but also fetches the full text of long strings
//! whose initial chunk is truncated.
//!
//! Objects are decoded from their preview only. An object without a usable
//! preview becomes [`RemoteValue::Placeholder`]; callers that need the full
//! value have to ask the remote side to serialize it (e.g. `JSON.stringify`).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::bridge::session::Requester;
use crate::error::{ClientError, Result};

static NULL: Value = Value::Null;

/// Numbers JSON cannot carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialNumber {
    NaN,
    Infinity,
    NegativeInfinity,
    NegativeZero,
}

impl SpecialNumber {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::NaN => f64::NAN,
            Self::Infinity => f64::INFINITY,
            Self::NegativeInfinity => f64::NEG_INFINITY,
            Self::NegativeZero => -0.0,
        }
    }

    fn to_json(self) -> Value {
        match self {
            Self::NaN => json!("NaN"),
            Self::Infinity => json!("Infinity"),
            Self::NegativeInfinity => json!("-Infinity"),
            Self::NegativeZero => json!(-0.0),
        }
    }
}

/// Interned remote symbol. Two symbols with the same name are the same symbol.
#[derive(Clone)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn for_name(name: &str) -> Self {
        static TABLE: OnceLock<Mutex<HashMap<String, Arc<str>>>> = OnceLock::new();
        let table = TABLE.get_or_init(Default::default);
        let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
        let interned = table
            .entry(name.to_string())
            .or_insert_with(|| Arc::from(name));
        Self(Arc::clone(interned))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Symbol {}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

/// Borrowed view of a grip, one variant per wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Grip<'a> {
    /// Plain JSON value, passed through as-is.
    Primitive(&'a Value),
    Undefined,
    Special(SpecialNumber),
    BigInt(&'a str),
    LongString {
        actor: &'a str,
        length: usize,
        initial: &'a str,
    },
    Array {
        class: &'a str,
        items: &'a [Value],
    },
    Object {
        class: &'a str,
        /// Property name to descriptor.
        properties: &'a Map<String, Value>,
    },
    Symbol {
        name: &'a str,
    },
    Opaque {
        class: &'a str,
    },
}

impl<'a> Grip<'a> {
    pub fn parse(value: &'a Value) -> Self {
        let Value::Object(obj) = value else {
            return Self::Primitive(value);
        };
        let text = |key: &str| obj.get(key).and_then(Value::as_str);

        match text("type") {
            Some("undefined") => Self::Undefined,
            Some("null") => Self::Primitive(&NULL),
            Some("NaN") => Self::Special(SpecialNumber::NaN),
            Some("Infinity") => Self::Special(SpecialNumber::Infinity),
            Some("-Infinity") => Self::Special(SpecialNumber::NegativeInfinity),
            Some("-0") => Self::Special(SpecialNumber::NegativeZero),
            Some("BigInt") => Self::BigInt(text("text").unwrap_or("0")),
            Some("symbol") => Self::Symbol {
                name: text("name").or_else(|| text("description")).unwrap_or(""),
            },
            Some("longString") => {
                let length = obj.get("length").and_then(Value::as_u64);
                match (text("actor"), length) {
                    (Some(actor), Some(length)) => Self::LongString {
                        actor,
                        length: usize::try_from(length).unwrap_or(usize::MAX),
                        initial: text("initial").unwrap_or(""),
                    },
                    _ => Self::Opaque {
                        class: "LongString",
                    },
                }
            }
            Some("object") => {
                let class = text("class").unwrap_or("Object");
                let preview = obj.get("preview");
                let items = preview
                    .and_then(|p| p.get("items"))
                    .and_then(Value::as_array);
                let properties = preview
                    .and_then(|p| p.get("ownProperties"))
                    .and_then(Value::as_object);
                match (class, items, properties) {
                    ("Array", Some(items), _) => Self::Array { class, items },
                    (_, _, Some(properties)) => Self::Object { class, properties },
                    _ => Self::Opaque { class },
                }
            }
            _ => Self::Primitive(value),
        }
    }
}

/// A decoded remote value.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue {
    Undefined,
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Special(SpecialNumber),
    BigInt(String),
    String(String),
    Array(Vec<RemoteValue>),
    Object(BTreeMap<String, RemoteValue>),
    Symbol(Symbol),
    /// Object whose contents were not previewed.
    Placeholder { class: String },
    /// Long string grip whose full text was not fetched. Use [`resolve`].
    Unresolved(Value),
}

impl RemoteValue {
    /// Convert a plain JSON value (no grip interpretation).
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Undefined | Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Special(s) => s.to_json(),
            Self::BigInt(text) | Self::String(text) => Value::String(text.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Symbol(symbol) => Value::String(format!("Symbol({})", symbol.name())),
            Self::Placeholder { class } => Value::String(placeholder_marker(class)),
            Self::Unresolved(grip) => grip.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder { .. })
    }

    /// True if this value or anything nested in it is a placeholder or an
    /// unresolved long string.
    pub fn is_lossy(&self) -> bool {
        match self {
            Self::Placeholder { .. } | Self::Unresolved(_) => true,
            Self::Array(items) => items.iter().any(Self::is_lossy),
            Self::Object(map) => map.values().any(Self::is_lossy),
            _ => false,
        }
    }
}

impl Serialize for RemoteValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

pub fn placeholder_marker(class: &str) -> String {
    format!("[object {class}]")
}

/// JS string lengths count UTF-16 code units.
fn covers(initial: &str, length: usize) -> bool {
    initial.encode_utf16().count() >= length
}

/// Property descriptors carry the value under `value`; accessors have
/// `get`/`set` instead.
enum Descriptor<'a> {
    Value(&'a Value),
    Accessor,
}

fn descriptor(desc: &Value) -> Descriptor<'_> {
    match desc {
        Value::Object(obj) if obj.contains_key("value") => {
            Descriptor::Value(obj.get("value").unwrap_or(&NULL))
        }
        Value::Object(obj) if obj.contains_key("get") || obj.contains_key("set") => {
            Descriptor::Accessor
        }
        other => Descriptor::Value(other),
    }
}

fn accessor_placeholder() -> RemoteValue {
    RemoteValue::Placeholder {
        class: "Accessor".to_string(),
    }
}

/// Decode without network access. Truncated long strings come back as
/// [`RemoteValue::Unresolved`].
pub fn decode(value: &Value) -> RemoteValue {
    match Grip::parse(value) {
        Grip::Primitive(v) => RemoteValue::from_json(v),
        Grip::Undefined => RemoteValue::Undefined,
        Grip::Special(s) => RemoteValue::Special(s),
        Grip::BigInt(text) => RemoteValue::BigInt(text.to_string()),
        Grip::LongString {
            length, initial, ..
        } => {
            if covers(initial, length) {
                RemoteValue::String(initial.to_string())
            } else {
                RemoteValue::Unresolved(value.clone())
            }
        }
        Grip::Array { items, .. } => RemoteValue::Array(items.iter().map(decode).collect()),
        Grip::Object { properties, .. } => RemoteValue::Object(
            properties
                .iter()
                .map(|(key, desc)| {
                    let value = match descriptor(desc) {
                        Descriptor::Value(v) => decode(v),
                        Descriptor::Accessor => accessor_placeholder(),
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Grip::Symbol { name } => RemoteValue::Symbol(Symbol::for_name(name)),
        Grip::Opaque { class } => RemoteValue::Placeholder {
            class: class.to_string(),
        },
    }
}

/// Decode, fetching the full text of any truncated long string.
pub fn resolve<'a>(
    value: &'a Value,
    requester: &'a dyn Requester,
) -> BoxFuture<'a, Result<RemoteValue>> {
    async move {
        match Grip::parse(value) {
            Grip::LongString {
                actor,
                length,
                initial,
            } => {
                if covers(initial, length) {
                    return Ok(RemoteValue::String(initial.to_string()));
                }
                let text = fetch_long_string(requester, actor, length).await?;
                Ok(RemoteValue::String(text))
            }
            Grip::Array { items, .. } => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve(item, requester).await?);
                }
                Ok(RemoteValue::Array(out))
            }
            Grip::Object { properties, .. } => {
                let mut out = BTreeMap::new();
                for (key, desc) in properties {
                    let value = match descriptor(desc) {
                        Descriptor::Value(v) => resolve(v, requester).await?,
                        Descriptor::Accessor => accessor_placeholder(),
                    };
                    out.insert(key.clone(), value);
                }
                Ok(RemoteValue::Object(out))
            }
            _ => Ok(decode(value)),
        }
    }
    .boxed()
}

/// Read the full text of a long string from its actor.
pub async fn fetch_long_string(
    requester: &dyn Requester,
    actor: &str,
    length: usize,
) -> Result<String> {
    tracing::debug!(%actor, length, "Fetching long string");
    let reply = requester
        .request(actor, "substring", json!({"start": 0, "end": length}))
        .await?;
    reply
        .get("substring")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ClientError::malformed(actor, "substring reply has no 'substring' field"))
}
