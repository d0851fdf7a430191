use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// A single upstream record. `eid` is assigned by the source and increases monotonically in
/// upstream order, so it doubles as the checkpoint position for the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub eid: u64,
    pub payload: Value,
}

impl Event {
    pub fn new(eid: u64, payload: Value) -> Self {
        Self { eid, payload }
    }
}

/// A scalar lookup key. Equality is exact: `Int(1)`, `Str("1")` and `Number("1.0")` are
/// different keys, and so are `Bool(true)` and `Str("true")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Int(i64),
    /// A JSON number that does not fit `i64`, in its canonical text form.
    Number(String),
    Bool(bool),
    Str(String),
}

impl KeyValue {
    /// Convert a JSON scalar into a key. Nulls, objects and arrays are not keys.
    pub fn from_json(value: &Value) -> Option<KeyValue> {
        match value {
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => KeyValue::Int(i),
                None => KeyValue::Number(n.to_string()),
            }),
            Value::String(s) => Some(KeyValue::Str(s.clone())),
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Number(n) => n
                .parse::<Number>()
                .map(Value::Number)
                .unwrap_or_else(|_| Value::from(n.as_str())),
            KeyValue::Bool(b) => Value::from(*b),
            KeyValue::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(i) => write!(f, "{i}"),
            KeyValue::Number(n) => write!(f, "{n}"),
            KeyValue::Bool(b) => write!(f, "{b}"),
            KeyValue::Str(s) => write!(f, "{s}"),
        }
    }
}

/// The column type entity ids and lookup keys are stored as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    #[default]
    Bigint,
    Text,
}

impl IdType {
    /// Convert a key to this type. Keys with no value of this type, such as `"abc"` or `1.5`
    /// for `Bigint`, yield `None`.
    pub fn coerce(self, key: &KeyValue) -> Option<KeyValue> {
        match (self, key) {
            (IdType::Bigint, KeyValue::Int(i)) => Some(KeyValue::Int(*i)),
            (IdType::Bigint, KeyValue::Str(s)) => s.parse().ok().map(KeyValue::Int),
            (IdType::Bigint, KeyValue::Number(_) | KeyValue::Bool(_)) => None,
            (IdType::Text, KeyValue::Str(s)) => Some(KeyValue::Str(s.clone())),
            (IdType::Text, key) => Some(KeyValue::Str(key.to_string())),
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdType::Bigint => f.write_str("bigint"),
            IdType::Text => f.write_str("text"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Str(value.to_owned())
    }
}

/// An ordered run of events released together by the accumulator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    events: Vec<Event>,
}

impl Batch {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// The checkpoint position reached once every event of this batch has been flushed.
    pub fn last_eid(&self) -> Option<u64> {
        self.events.last().map(|e| e.eid)
    }

    pub fn first_eid(&self) -> Option<u64> {
        self.events.first().map(|e| e.eid)
    }
}

/// What the pipeline writes downstream: the original event plus whatever was fetched for it.
/// Events with no fetched data pass through with `enrichment` unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledOutput {
    #[serde(flatten)]
    pub event: Event,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Value>,
}

impl AssembledOutput {
    pub fn enriched(event: Event, enrichment: Value) -> Self {
        Self {
            event,
            enrichment: Some(enrichment),
        }
    }

    pub fn pass_through(event: Event) -> Self {
        Self {
            event,
            enrichment: None,
        }
    }

    pub fn eid(&self) -> u64 {
        self.event.eid
    }
}
