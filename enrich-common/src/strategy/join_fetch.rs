//! # Join-fetch
//!
//! Relational enrichment. Keys referenced by a batch are deduplicated per key class, resolved
//! to entity ids (directly, or through an indirect lookup query), and every declared sub-query
//! runs once per chunk of distinct ids. Rows are merged into one composite per entity by their
//! join field, and each event receives the composites of the entities it references.
//!
//! Keys and ids are converted to the column types the definition declares before they are
//! bound or compared, so `1` and `"1"` in payloads reach the same entity.
//!
//! Any failing query fails the whole batch: a composite with a missing sub-query is not
//! emitted.
use std::sync::Arc;
use std::time;

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::emitter::OrderedEmitter;
use crate::error::{EngineError, RowSourceError};
use crate::event::{AssembledOutput, Batch, IdType, KeyValue};
use crate::executor::BoundedExecutor;
use crate::keys::{collect_keys, KeyCollection, KeyExtractor, NamedExtractor};
use crate::metrics_consts::OPERATION_DURATION;
use crate::strategy::Enricher;

/// A result row with its columns in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn first(&self) -> Option<&Value> {
        self.columns.first().map(|(_, value)| value)
    }

    pub fn columns(&self) -> &[(String, Value)] {
        &self.columns
    }

    pub fn into_object(self) -> Value {
        Value::Object(self.columns.into_iter().collect::<Map<String, Value>>())
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Row::new(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Parameterized query execution against the relational store.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Run `sql` with `ids` bound as its single array parameter (`$1`), an array of `id_type`.
    /// Every id has already been converted to `id_type`.
    async fn fetch_rows(
        &self,
        sql: &str,
        id_type: IdType,
        ids: &[KeyValue],
    ) -> Result<Vec<Row>, RowSourceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Each row overwrites the field with a single object.
    #[default]
    Scalar,
    /// Each row is appended to the field's sequence.
    Collection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuery {
    /// Field of the composite the rows are merged into.
    pub field: String,
    pub sql: String,
    /// Column holding the entity id. Defaults to the first column.
    #[serde(default)]
    pub join_field: Option<String>,
    #[serde(default)]
    pub merge: MergeStrategy,
    /// Type the ids are bound as, when the queried column differs from the entity id type.
    #[serde(default)]
    pub id_type: Option<IdType>,
}

/// Resolves a secondary key to entity ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndirectLookup {
    pub sql: String,
    /// Column holding the looked up key. Defaults to the first column.
    #[serde(default)]
    pub key_column: Option<String>,
    pub id_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyClassConfig {
    pub name: String,
    /// JSON pointer into the event payload.
    pub pointer: String,
    /// Unset when the key values are entity ids themselves.
    #[serde(default)]
    pub lookup: Option<IndirectLookup>,
    /// Defaults to the entity id type. Only lookup classes may declare another type.
    #[serde(default)]
    pub key_type: Option<IdType>,
}

impl KeyClassConfig {
    pub fn key_type(&self, id_type: IdType) -> IdType {
        self.key_type.unwrap_or(id_type)
    }
}

/// The registry for one pipeline instance: which entity is loaded, from which keys, and how
/// its composite is assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Name the composites are attached under in each event's enrichment.
    pub entity: String,
    /// Column type of the entity id.
    #[serde(default)]
    pub id_type: IdType,
    pub key_classes: Vec<KeyClassConfig>,
    pub sub_queries: Vec<SubQuery>,
    /// Split id lists longer than this into several queries.
    #[serde(default)]
    pub max_ids_per_query: Option<usize>,
}

impl EntityDefinition {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.key_classes.is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "entity {} declares no key classes",
                self.entity
            )));
        }
        if self.sub_queries.is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "entity {} declares no sub-queries",
                self.entity
            )));
        }
        if self.max_ids_per_query == Some(0) {
            return Err(EngineError::InvalidConfig(
                "max_ids_per_query must be at least 1".to_owned(),
            ));
        }
        for class in &self.key_classes {
            if class.lookup.is_none() && class.key_type(self.id_type) != self.id_type {
                return Err(EngineError::InvalidConfig(format!(
                    "key class {} holds entity ids, so its key type must be {}",
                    class.name, self.id_type
                )));
            }
        }
        let mut fields = AHashSet::new();
        for sub_query in &self.sub_queries {
            if !fields.insert(sub_query.field.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "field {} is declared by more than one sub-query",
                    sub_query.field
                )));
            }
        }
        Ok(())
    }

    /// An empty composite with every declared field present.
    fn seed(&self, id: &KeyValue) -> Map<String, Value> {
        let mut composite = Map::new();
        composite.insert("id".to_owned(), id.to_json());
        for sub_query in &self.sub_queries {
            let empty = match sub_query.merge {
                MergeStrategy::Scalar => Value::Object(Map::new()),
                MergeStrategy::Collection => Value::Array(Vec::new()),
            };
            composite.insert(sub_query.field.clone(), empty);
        }
        composite
    }
}

/// Entity ids for a batch, and how each referenced key maps onto them.
struct ResolvedIds {
    ids: Vec<KeyValue>,
    /// One map per key class. Direct classes map every value to itself.
    by_class: Vec<AHashMap<KeyValue, Vec<KeyValue>>>,
}

pub struct JoinFetch {
    definition: EntityDefinition,
    extractors: Vec<NamedExtractor>,
    rows: Arc<dyn RowSource>,
    executor: BoundedExecutor,
}

impl JoinFetch {
    pub fn new(
        definition: EntityDefinition,
        rows: Arc<dyn RowSource>,
        concurrency_limit: usize,
    ) -> Self {
        let extractors = definition
            .key_classes
            .iter()
            .map(|class| {
                NamedExtractor::new(&class.name, KeyExtractor::pointer(&class.pointer))
                    .coerced(class.key_type(definition.id_type))
            })
            .collect();

        Self {
            definition,
            extractors,
            rows,
            executor: BoundedExecutor::new(concurrency_limit),
        }
    }

    /// Replace the payload pointer of `key_class` with another extractor.
    pub fn with_extractor(mut self, key_class: &str, extractor: KeyExtractor) -> Self {
        if let Some(named) = self.extractors.iter_mut().find(|e| e.name == key_class) {
            named.extractor = extractor;
        }
        self
    }

    pub fn definition(&self) -> &EntityDefinition {
        &self.definition
    }

    fn chunk_size(&self) -> usize {
        self.definition.max_ids_per_query.unwrap_or(usize::MAX).max(1)
    }

    async fn fetch_timed(
        &self,
        sql: &str,
        id_type: IdType,
        ids: &[KeyValue],
    ) -> Result<Vec<Row>, RowSourceError> {
        let start = time::Instant::now();
        let result = self.rows.fetch_rows(sql, id_type, ids).await;
        metrics::histogram!(OPERATION_DURATION).record(start.elapsed().as_secs_f64());
        result
    }

    async fn resolve_ids(&self, collection: &KeyCollection) -> Result<ResolvedIds, EngineError> {
        let chunk_size = self.chunk_size();
        let id_type = self.definition.id_type;
        let classes = &self.definition.key_classes;

        let lookups: Vec<_> = classes
            .iter()
            .enumerate()
            .filter_map(|(class, config)| config.lookup.as_ref().map(|lookup| (class, config, lookup)))
            .flat_map(|(class, config, lookup)| {
                collection
                    .keys
                    .values(class)
                    .chunks(chunk_size)
                    .map(move |chunk| (class, config, lookup, chunk.to_vec()))
            })
            .map(|(class, config, lookup, chunk)| async move {
                let rows = self
                    .fetch_timed(&lookup.sql, config.key_type(id_type), &chunk)
                    .await
                    .map_err(|source| EngineError::IndirectLookup {
                        key_class: config.name.clone(),
                        source,
                    })?;
                Ok::<_, EngineError>((class, lookup, rows))
            })
            .collect();
        let mut lookup_results = self.executor.try_execute(lookups).await?;
        lookup_results.sort_by_key(|(class, _, _)| *class);

        let mut by_class: Vec<AHashMap<KeyValue, Vec<KeyValue>>> =
            vec![AHashMap::new(); classes.len()];
        for (class, config) in classes.iter().enumerate() {
            if config.lookup.is_none() {
                for value in collection.keys.values(class) {
                    by_class[class].insert(value.clone(), vec![value.clone()]);
                }
            }
        }
        for (class, lookup, rows) in lookup_results {
            let key_type = classes[class].key_type(id_type);
            for row in rows {
                let indirect_error = |column: &str| EngineError::IndirectLookup {
                    key_class: classes[class].name.clone(),
                    source: RowSourceError::MissingColumn(column.to_owned()),
                };
                let key = match &lookup.key_column {
                    Some(column) => row
                        .get(column)
                        .ok_or_else(|| indirect_error(column.as_str()))?,
                    None => row.first().ok_or_else(|| indirect_error("<first>"))?,
                };
                let id = row
                    .get(&lookup.id_column)
                    .ok_or_else(|| indirect_error(lookup.id_column.as_str()))?;

                let key = KeyValue::from_json(key).and_then(|key| key_type.coerce(&key));
                let id = KeyValue::from_json(id).and_then(|id| id_type.coerce(&id));
                if let (Some(key), Some(id)) = (key, id) {
                    let ids = by_class[class].entry(key).or_default();
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }

        let mut seen = AHashSet::new();
        let mut ids = Vec::new();
        for refs in &collection.per_event {
            for (class, value) in refs {
                for id in by_class[*class].get(value).into_iter().flatten() {
                    if seen.insert(id.clone()) {
                        ids.push(id.clone());
                    }
                }
            }
        }

        Ok(ResolvedIds { ids, by_class })
    }

    /// Run every sub-query over `ids` and merge the rows into composites keyed by entity id.
    async fn fetch_composites(
        &self,
        ids: &[KeyValue],
    ) -> Result<AHashMap<KeyValue, Map<String, Value>>, EngineError> {
        let chunk_size = self.chunk_size();
        let id_type = self.definition.id_type;

        let operations: Vec<_> = self
            .definition
            .sub_queries
            .iter()
            .enumerate()
            .flat_map(|(index, sub_query)| {
                let bind_type = sub_query.id_type.unwrap_or(id_type);
                ids.chunks(chunk_size).enumerate().map(move |(chunk, chunk_ids)| {
                    let bound: Vec<KeyValue> =
                        chunk_ids.iter().filter_map(|id| bind_type.coerce(id)).collect();
                    (index, sub_query, bind_type, chunk, bound)
                })
            })
            .filter(|(.., bound)| !bound.is_empty())
            .map(|(index, sub_query, bind_type, chunk, bound)| async move {
                let rows = self
                    .fetch_timed(&sub_query.sql, bind_type, &bound)
                    .await
                    .map_err(|source| EngineError::SubQuery {
                        field: sub_query.field.clone(),
                        source,
                    })?;
                Ok::<_, EngineError>((index, chunk, rows))
            })
            .collect();
        let mut results = self.executor.try_execute(operations).await?;
        // Completion order is arbitrary; merge in declaration order so collections are stable.
        results.sort_by_key(|(index, chunk, _)| (*index, *chunk));

        let requested: AHashSet<&KeyValue> = ids.iter().collect();
        let mut composites: AHashMap<KeyValue, Map<String, Value>> = AHashMap::new();

        for (index, _, rows) in results {
            let sub_query = &self.definition.sub_queries[index];
            for row in rows {
                let join_value = match &sub_query.join_field {
                    Some(column) => row.get(column),
                    None => row.first(),
                };
                let join_value = join_value.ok_or_else(|| EngineError::SubQuery {
                    field: sub_query.field.clone(),
                    source: RowSourceError::MissingColumn(
                        sub_query.join_field.clone().unwrap_or_else(|| "<first>".to_owned()),
                    ),
                })?;
                let Some(id) = KeyValue::from_json(join_value).and_then(|id| id_type.coerce(&id))
                else {
                    continue;
                };
                if !requested.contains(&id) {
                    debug!(field = %sub_query.field, %id, "ignoring row for unrequested id");
                    continue;
                }

                let composite = composites
                    .entry(id)
                    .or_insert_with_key(|id| self.definition.seed(id));
                let fetched = row.into_object();
                match sub_query.merge {
                    MergeStrategy::Scalar => {
                        composite.insert(sub_query.field.clone(), fetched);
                    }
                    MergeStrategy::Collection => {
                        if let Some(Value::Array(items)) = composite.get_mut(&sub_query.field) {
                            items.push(fetched);
                        }
                    }
                }
            }
        }

        Ok(composites)
    }
}

#[async_trait]
impl Enricher for JoinFetch {
    fn name(&self) -> &'static str {
        "join_fetch"
    }

    #[instrument(skip_all, fields(entity = %self.definition.entity, size = batch.len()))]
    async fn enrich(
        &self,
        batch: Batch,
        emitter: &mut OrderedEmitter<'_>,
    ) -> Result<(), EngineError> {
        let collection = collect_keys(&batch, &self.extractors);
        let resolved = self.resolve_ids(&collection).await?;
        let composites = if resolved.ids.is_empty() {
            AHashMap::new()
        } else {
            self.fetch_composites(&resolved.ids).await?
        };
        debug!(
            ids = resolved.ids.len(),
            found = composites.len(),
            "fetched composites"
        );

        for (index, (event, refs)) in batch
            .into_events()
            .into_iter()
            .zip(collection.per_event)
            .enumerate()
        {
            let mut seen = AHashSet::new();
            let mut found = Vec::new();
            for (class, value) in &refs {
                for id in resolved.by_class[*class].get(value).into_iter().flatten() {
                    if !seen.insert(id) {
                        continue;
                    }
                    if let Some(composite) = composites.get(id) {
                        found.push(Value::Object(composite.clone()));
                    }
                }
            }

            let output = if found.is_empty() {
                AssembledOutput::pass_through(event)
            } else {
                let mut enrichment = Map::new();
                enrichment.insert(self.definition.entity.clone(), Value::Array(found));
                AssembledOutput::enriched(event, Value::Object(enrichment))
            };
            emitter.emit(index, output).await?;
        }

        Ok(())
    }
}
