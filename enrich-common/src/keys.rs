//! # Keys
//!
//! Extracts lookup keys from event payloads and deduplicates them per key class.
use std::fmt;
use std::sync::Arc;

use ahash::AHashSet;
use serde_json::Value;
use tracing::debug;

use crate::event::{Batch, IdType, KeyValue};
use crate::metrics_consts::{KEYS_COLLECTED, KEYS_DEDUPLICATED, KEYS_REJECTED};

type ExtractFn = dyn Fn(&Value) -> Vec<KeyValue> + Send + Sync;

/// Turns a payload into zero or more key values.
#[derive(Clone)]
pub enum KeyExtractor {
    /// A JSON pointer into the payload. An array at the pointer yields one key per scalar element.
    Pointer(String),
    Custom(Arc<ExtractFn>),
}

impl KeyExtractor {
    pub fn pointer(pointer: impl Into<String>) -> Self {
        KeyExtractor::Pointer(pointer.into())
    }

    pub fn custom<F>(extract: F) -> Self
    where
        F: Fn(&Value) -> Vec<KeyValue> + Send + Sync + 'static,
    {
        KeyExtractor::Custom(Arc::new(extract))
    }

    pub fn extract(&self, payload: &Value) -> Vec<KeyValue> {
        match self {
            KeyExtractor::Pointer(pointer) => match payload.pointer(pointer) {
                Some(Value::Array(items)) => items.iter().filter_map(KeyValue::from_json).collect(),
                Some(value) => KeyValue::from_json(value).into_iter().collect(),
                None => Vec::new(),
            },
            KeyExtractor::Custom(extract) => extract(payload),
        }
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyExtractor::Pointer(pointer) => f.debug_tuple("Pointer").field(pointer).finish(),
            KeyExtractor::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A key class and the extractor producing its values.
#[derive(Debug, Clone)]
pub struct NamedExtractor {
    pub name: String,
    pub extractor: KeyExtractor,
    /// When set, extracted keys are converted to this type and the ones that do not convert
    /// are dropped.
    pub key_type: Option<IdType>,
}

impl NamedExtractor {
    pub fn new(name: impl Into<String>, extractor: KeyExtractor) -> Self {
        Self {
            name: name.into(),
            extractor,
            key_type: None,
        }
    }

    pub fn coerced(mut self, key_type: IdType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    pub fn extract(&self, payload: &Value) -> Vec<KeyValue> {
        let keys = self.extractor.extract(payload);
        let Some(key_type) = self.key_type else {
            return keys;
        };

        keys.iter()
            .filter_map(|key| {
                let coerced = key_type.coerce(key);
                if coerced.is_none() {
                    metrics::counter!(KEYS_REJECTED).increment(1);
                    debug!(key_class = %self.name, %key, "dropping key that is not a {}", key_type);
                }
                coerced
            })
            .collect()
    }
}

/// Distinct key values per key class, in first-seen order. Classes keep their declaration order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LookupKeySet {
    classes: Vec<(String, Vec<KeyValue>)>,
}

impl LookupKeySet {
    pub fn get(&self, key_class: &str) -> Option<&[KeyValue]> {
        self.classes
            .iter()
            .find(|(name, _)| name == key_class)
            .map(|(_, values)| values.as_slice())
    }

    /// Values of the class at `index` in declaration order.
    pub fn values(&self, index: usize) -> &[KeyValue] {
        self.classes
            .get(index)
            .map(|(_, values)| values.as_slice())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[KeyValue])> {
        self.classes
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn total(&self) -> usize {
        self.classes.iter().map(|(_, values)| values.len()).sum()
    }
}

/// The deduplicated key set for a batch, plus the keys each event referenced.
#[derive(Debug, Default, Clone)]
pub struct KeyCollection {
    pub keys: LookupKeySet,
    /// Indexed by the event's position in its batch: `(key class index, value)` pairs.
    pub per_event: Vec<Vec<(usize, KeyValue)>>,
}

pub fn collect_keys(batch: &Batch, extractors: &[NamedExtractor]) -> KeyCollection {
    let mut seen: Vec<AHashSet<KeyValue>> = vec![AHashSet::new(); extractors.len()];
    let mut classes: Vec<(String, Vec<KeyValue>)> = extractors
        .iter()
        .map(|e| (e.name.clone(), Vec::new()))
        .collect();
    let mut per_event = Vec::with_capacity(batch.len());
    let mut referenced = 0usize;

    for event in batch.events() {
        let mut refs: Vec<(usize, KeyValue)> = Vec::new();
        for (class, named) in extractors.iter().enumerate() {
            for value in named.extract(&event.payload) {
                referenced += 1;
                if seen[class].insert(value.clone()) {
                    classes[class].1.push(value.clone());
                }
                let pair = (class, value);
                if !refs.contains(&pair) {
                    refs.push(pair);
                }
            }
        }
        per_event.push(refs);
    }

    let keys = LookupKeySet { classes };
    metrics::counter!(KEYS_COLLECTED).increment(keys.total() as u64);
    metrics::counter!(KEYS_DEDUPLICATED).increment((referenced - keys.total()) as u64);

    KeyCollection { keys, per_event }
}
