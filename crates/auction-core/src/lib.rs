//! Core data model for the auction ingest pipeline: fetched pages, table schemas,
//! flat records and the reconciliation policy.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "auction-core";

/// One API response for one page of one auction listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFetchResult {
    pub source_id: String,
    pub page_number: u32,
    pub reported_total: u64,
    pub items: Vec<JsonValue>,
    /// Verbatim decoded response document; this is what gets persisted.
    pub body: JsonValue,
}

impl PageFetchResult {
    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Timestamp,
    Json,
}

impl ColumnType {
    /// Maps a declaration tag such as `VARCHAR(255)` or `DECIMAL(10,2)` onto a column type.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let upper = tag.trim().to_ascii_uppercase();
        let base = upper
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        let ty = match base {
            "VARCHAR" | "CHAR" | "TEXT" | "MEDIUMTEXT" | "LONGTEXT" | "STRING" => Self::Text,
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" | "MEDIUMINT" => Self::Integer,
            "DECIMAL" | "NUMERIC" | "FLOAT" | "DOUBLE" | "REAL" => Self::Decimal,
            "BOOLEAN" | "BOOL" => Self::Boolean,
            "DATETIME" | "TIMESTAMP" | "TIMESTAMPTZ" | "DATE" => Self::Timestamp,
            "JSON" | "JSONB" => Self::Json,
            _ => return None,
        };
        Some(ty)
    }

    pub fn postgres_type(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "BIGINT",
            Self::Decimal => "DOUBLE PRECISION",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMPTZ",
            Self::Json => "JSONB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub type_tag: String,
}

/// Ordered column list for one destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<ColumnSpec>,
    index: HashMap<String, usize>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> anyhow::Result<Self> {
        if columns.is_empty() {
            bail!("schema declares no columns");
        }
        let mut index = HashMap::with_capacity(columns.len());
        for (pos, column) in columns.iter().enumerate() {
            if index.insert(column.name.clone(), pos).is_some() {
                bail!("schema declares column {} twice", column.name);
            }
        }
        Ok(Self { columns, index })
    }

    /// Builds a schema from `(name, tag)` pairs; handy for tests and tooling.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> anyhow::Result<Self> {
        let columns = pairs
            .into_iter()
            .map(|(name, tag)| column_spec(name, tag))
            .collect();
        Self::new(columns)
    }

    /// Parses a schema declaration document: a JSON object of column name -> type tag,
    /// in declared column order.
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let value: JsonValue = serde_json::from_str(text).context("parsing schema declaration")?;
        let Some(object) = value.as_object() else {
            bail!("schema declaration must be a JSON object of column -> type tag");
        };
        let mut columns = Vec::with_capacity(object.len());
        for (name, tag) in object {
            let Some(tag) = tag.as_str() else {
                bail!("type tag for column {name} is not a string");
            };
            columns.push(column_spec(name, tag));
        }
        Self::new(columns)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema file {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("loading schema file {}", path.display()))
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }
}

fn column_spec(name: &str, tag: &str) -> ColumnSpec {
    let column_type = ColumnType::from_tag(tag).unwrap_or_else(|| {
        tracing::warn!(column = name, tag, "unknown column type tag; treating as text");
        ColumnType::Text
    });
    ColumnSpec {
        name: name.to_string(),
        column_type,
        type_tag: tag.to_string(),
    }
}

/// A single typed cell of a flat record.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::Integer(i) => JsonValue::from(*i),
            Self::Decimal(d) => serde_json::Number::from_f64(*d)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Boolean(b) => JsonValue::Bool(*b),
            Self::Timestamp(ts) => JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::Json(v) => v.clone(),
        }
    }

    /// Stable textual key used to group rows by partition. Nulls group together.
    pub fn partition_token(&self) -> String {
        match self {
            Self::Null => "\u{0}null".to_string(),
            other => other.to_json().to_string(),
        }
    }

    /// Ordering used to pick the newest row in a partition. Null sorts below every value.
    pub fn order_cmp(&self, other: &Self) -> Ordering {
        use CellValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Decimal(b)) => (*a as f64).total_cmp(b),
            (Decimal(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Decimal(a), Decimal(b)) => a.total_cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (a, b) => a
                .kind_rank()
                .cmp(&b.kind_rank())
                .then_with(|| a.to_json().to_string().cmp(&b.to_json().to_string())),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Integer(_) | Self::Decimal(_) => 2,
            Self::Timestamp(_) => 3,
            Self::Text(_) => 4,
            Self::Json(_) => 5,
        }
    }
}

/// One tabular row. Values are positional against the schema it was built for, so every
/// record carries exactly the schema's columns in declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRecord {
    values: Vec<CellValue>,
}

impl FlatRecord {
    pub fn null(schema: &TableSchema) -> Self {
        Self {
            values: vec![CellValue::Null; schema.len()],
        }
    }

    pub fn from_values(schema: &TableSchema, values: Vec<CellValue>) -> anyhow::Result<Self> {
        if values.len() != schema.len() {
            bail!(
                "record has {} values but schema declares {} columns",
                values.len(),
                schema.len()
            );
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    pub fn value_at(&self, index: usize) -> &CellValue {
        &self.values[index]
    }

    pub fn set(&mut self, index: usize, value: CellValue) {
        self.values[index] = value;
    }

    pub fn get<'a>(&'a self, schema: &TableSchema, column: &str) -> Option<&'a CellValue> {
        schema.index_of(column).and_then(|i| self.values.get(i))
    }

    pub fn non_null_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_null()).count()
    }

    pub fn to_json_object(&self, schema: &TableSchema) -> Map<String, JsonValue> {
        schema
            .columns()
            .iter()
            .zip(&self.values)
            .map(|(col, value)| (col.name.clone(), value.to_json()))
            .collect()
    }
}

/// Reconciliation policy of a destination table: rows sharing `partition_key` are the same
/// logical entity and only the one with the greatest `order_key` survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupPolicy {
    pub partition_key: Vec<String>,
    pub order_key: String,
}

impl DedupPolicy {
    pub fn new(partition_key: Vec<String>, order_key: impl Into<String>) -> Self {
        Self {
            partition_key,
            order_key: order_key.into(),
        }
    }

    /// Resolves the policy's columns to schema positions.
    pub fn resolve(&self, schema: &TableSchema) -> anyhow::Result<ResolvedPolicy> {
        if self.partition_key.is_empty() {
            bail!("dedup policy needs at least one partition key column");
        }
        let mut partition = Vec::with_capacity(self.partition_key.len());
        for column in &self.partition_key {
            let Some(idx) = schema.index_of(column) else {
                bail!("partition key column {column} is not in the schema");
            };
            partition.push(idx);
        }
        let Some(order) = schema.index_of(&self.order_key) else {
            bail!("order key column {} is not in the schema", self.order_key);
        };
        Ok(ResolvedPolicy { partition, order })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub partition: Vec<usize>,
    pub order: usize,
}

impl ResolvedPolicy {
    pub fn partition_key_of(&self, record: &FlatRecord) -> Vec<String> {
        self.partition
            .iter()
            .map(|&i| record.value_at(i).partition_token())
            .collect()
    }
}
