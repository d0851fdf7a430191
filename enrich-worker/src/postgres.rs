use async_trait::async_trait;
use enrich_common::error::RowSourceError;
use enrich_common::event::{IdType, KeyValue};
use enrich_common::strategy::{Row, RowSource};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row as _, TypeInfo};
use tracing::debug;

/// Runs entity definition queries against Postgres, binding the requested ids as `$1`, a
/// `bigint[]` or `text[]` as the entity definition declares.
pub struct PgRowSource {
    pool: PgPool,
}

impl PgRowSource {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RowSource for PgRowSource {
    async fn fetch_rows(
        &self,
        sql: &str,
        id_type: IdType,
        ids: &[KeyValue],
    ) -> Result<Vec<Row>, RowSourceError> {
        let query = sqlx::query(sql);
        let query = match id_param(id_type, ids) {
            IdParam::Ints(ids) => query.bind(ids),
            IdParam::Texts(ids) => query.bind(ids),
        };

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RowSourceError::Query(e.to_string()))?;
        debug!(ids = ids.len(), rows = rows.len(), "query returned");

        rows.iter().map(decode_row).collect()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum IdParam {
    Ints(Vec<i64>),
    Texts(Vec<String>),
}

/// Ids that do not convert to `id_type` are left out.
fn id_param(id_type: IdType, ids: &[KeyValue]) -> IdParam {
    let coerced = ids.iter().filter_map(|id| id_type.coerce(id));
    match id_type {
        IdType::Bigint => IdParam::Ints(
            coerced
                .filter_map(|id| match id {
                    KeyValue::Int(i) => Some(i),
                    _ => None,
                })
                .collect(),
        ),
        IdType::Text => IdParam::Texts(coerced.map(|id| id.to_string()).collect()),
    }
}

/// Column types a row can be decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Json,
    Uuid,
    Timestamptz,
    Timestamp,
    Date,
}

impl ColumnKind {
    fn from_type_name(name: &str) -> Option<Self> {
        let kind = match name {
            "BOOL" => ColumnKind::Bool,
            "INT2" => ColumnKind::Int2,
            "INT4" => ColumnKind::Int4,
            "INT8" => ColumnKind::Int8,
            "FLOAT4" => ColumnKind::Float4,
            "FLOAT8" => ColumnKind::Float8,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => ColumnKind::Text,
            "JSON" | "JSONB" => ColumnKind::Json,
            "UUID" => ColumnKind::Uuid,
            "TIMESTAMPTZ" => ColumnKind::Timestamptz,
            "TIMESTAMP" => ColumnKind::Timestamp,
            "DATE" => ColumnKind::Date,
            _ => return None,
        };
        Some(kind)
    }
}

fn decode_row(row: &PgRow) -> Result<Row, RowSourceError> {
    row.columns()
        .iter()
        .map(|column| {
            let type_name = column.type_info().name();
            let kind = ColumnKind::from_type_name(type_name).ok_or_else(|| {
                RowSourceError::UnsupportedColumn {
                    column: column.name().to_owned(),
                    type_name: type_name.to_owned(),
                }
            })?;
            let value = decode_value(row, column.ordinal(), kind)
                .map_err(|e| RowSourceError::Query(e.to_string()))?;
            Ok::<_, RowSourceError>((column.name().to_owned(), value))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Row::new)
}

/// NULLs decode to JSON null.
fn decode_value(row: &PgRow, index: usize, kind: ColumnKind) -> Result<Value, sqlx::Error> {
    let value = match kind {
        ColumnKind::Bool => row.try_get::<Option<bool>, _>(index)?.map(Value::from),
        ColumnKind::Int2 => row
            .try_get::<Option<i16>, _>(index)?
            .map(|v| Value::from(i64::from(v))),
        ColumnKind::Int4 => row
            .try_get::<Option<i32>, _>(index)?
            .map(|v| Value::from(i64::from(v))),
        ColumnKind::Int8 => row.try_get::<Option<i64>, _>(index)?.map(Value::from),
        ColumnKind::Float4 => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| Value::from(f64::from(v))),
        ColumnKind::Float8 => row.try_get::<Option<f64>, _>(index)?.map(Value::from),
        ColumnKind::Text => row.try_get::<Option<String>, _>(index)?.map(Value::from),
        ColumnKind::Json => row.try_get::<Option<Value>, _>(index)?,
        ColumnKind::Uuid => row
            .try_get::<Option<uuid::Uuid>, _>(index)?
            .map(|v| Value::from(v.to_string())),
        ColumnKind::Timestamptz => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)?
            .map(|v| Value::from(v.to_rfc3339())),
        ColumnKind::Timestamp => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)?
            .map(|v| Value::from(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        ColumnKind::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)?
            .map(|v| Value::from(v.to_string())),
    };
    Ok(value.unwrap_or(Value::Null))
}
