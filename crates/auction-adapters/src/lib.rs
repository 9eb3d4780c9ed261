//! Response parsing and flattening: turns search-API pages (either layout) into typed flat
//! records for a destination table.

use anyhow::Result;
use auction_core::{CellValue, ColumnType, FlatRecord, PageFetchResult, TableSchema};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "auction-adapters";

/// Nested item objects flattened into `prefix` + capitalised field name by default.
pub const NESTED_PREFIXES: [&str; 3] = ["sale", "productLocation", "productType"];

/// Default `(column, source field)` aliases.
pub const DEFAULT_ALIASES: [(&str, &str); 1] = [("car_keys", "keys")];

/// Default columns stamped with the ingestion time when the source leaves them empty.
pub const DEFAULT_STAMP_COLUMNS: [&str; 2] = ["createdAt", "updatedAt"];

const TOTAL_FIELDS: [&str; 3] = ["@odata.count", "totalCount", "total"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("page {page} of {source_id} has no record count")]
    MissingTotal { source_id: String, page: u32 },
    #[error("page {page} of {source_id} has no recognisable item list")]
    UnrecognizedShape { source_id: String, page: u32 },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// The two response layouts the auction site produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PageShape<'a> {
    /// `{"sale": {...}, "lots": [...]}`
    SaleLots {
        sale: &'a Map<String, JsonValue>,
        lots: &'a [JsonValue],
    },
    /// `{"value": [...]}`, `{"items": [...]}` or a bare array.
    FlatItems(&'a [JsonValue]),
    /// Any other object, taken as one item (e.g. a per-vehicle tracking response).
    SingleItem(&'a JsonValue),
    Unrecognized,
}

impl PageShape<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SaleLots { .. } => "sale_lots",
            Self::FlatItems(_) => "flat_items",
            Self::SingleItem(_) => "single_item",
            Self::Unrecognized => "unrecognized",
        }
    }

    pub fn items(&self) -> &[JsonValue] {
        match self {
            Self::SaleLots { lots, .. } => lots,
            Self::FlatItems(items) => items,
            Self::SingleItem(item) => std::slice::from_ref(*item),
            Self::Unrecognized => &[],
        }
    }
}

pub fn classify_shape(page: &JsonValue) -> PageShape<'_> {
    match page {
        JsonValue::Array(items) => PageShape::FlatItems(items),
        JsonValue::Object(object) => {
            if let (Some(JsonValue::Object(sale)), Some(JsonValue::Array(lots))) =
                (object.get("sale"), object.get("lots"))
            {
                return PageShape::SaleLots { sale, lots };
            }
            match object.get("value").or_else(|| object.get("items")) {
                Some(JsonValue::Array(items)) => PageShape::FlatItems(items),
                Some(_) => PageShape::Unrecognized,
                None => PageShape::SingleItem(page),
            }
        }
        _ => PageShape::Unrecognized,
    }
}

/// Decodes one HTTP response body into a page result. A body without a usable item list or
/// record count is malformed and reported as an error so the paginator stops. A lone object is
/// not a search page here, even though stored files of that form flatten to one record.
pub fn parse_page(source_id: &str, page_number: u32, body: &[u8]) -> Result<PageFetchResult, AdapterError> {
    let document: JsonValue = serde_json::from_slice(body)?;
    let shape = classify_shape(&document);
    let items = match shape {
        PageShape::Unrecognized | PageShape::SingleItem(_) => {
            return Err(AdapterError::UnrecognizedShape {
                source_id: source_id.to_string(),
                page: page_number,
            })
        }
        ref known => known.items().to_vec(),
    };
    let reported_total = match (&document, shape) {
        (JsonValue::Array(items), _) => items.len() as u64,
        (JsonValue::Object(object), shape) => match reported_total(object) {
            Some(total) => total,
            None if matches!(shape, PageShape::SaleLots { .. }) => items.len() as u64,
            None => {
                return Err(AdapterError::MissingTotal {
                    source_id: source_id.to_string(),
                    page: page_number,
                })
            }
        },
        _ => 0,
    };

    Ok(PageFetchResult {
        source_id: source_id.to_string(),
        page_number,
        reported_total,
        items,
        body: document,
    })
}

fn reported_total(object: &Map<String, JsonValue>) -> Option<u64> {
    TOTAL_FIELDS.iter().find_map(|field| match object.get(*field)? {
        JsonValue::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Converts one JSON value to the column's type. `None` means the value was present but could
/// not be converted; JSON null converts to `CellValue::Null`.
pub fn coerce_value(value: &JsonValue, column_type: ColumnType) -> Option<CellValue> {
    if value.is_null() {
        return Some(CellValue::Null);
    }
    match column_type {
        ColumnType::Text => Some(CellValue::Text(match value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ColumnType::Integer => coerce_integer(value).map(CellValue::Integer),
        ColumnType::Decimal => coerce_decimal(value).map(CellValue::Decimal),
        ColumnType::Boolean => coerce_boolean(value).map(CellValue::Boolean),
        ColumnType::Timestamp => coerce_timestamp(value).map(CellValue::Timestamp),
        ColumnType::Json => Some(CellValue::Json(value.clone())),
    }
}

fn coerce_integer(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| integral_f64(n.as_f64()?)),
        JsonValue::String(s) => {
            let cleaned = s.trim().replace(',', "");
            cleaned
                .parse::<i64>()
                .ok()
                .or_else(|| integral_f64(cleaned.parse::<f64>().ok()?))
        }
        JsonValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn integral_f64(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

fn coerce_decimal(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            let unsigned = trimmed.strip_prefix('$').unwrap_or(trimmed);
            unsigned.replace(',', "").trim().parse::<f64>().ok()
        }
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn coerce_boolean(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => match n.as_f64() {
            Some(f) if f == 1.0 => Some(true),
            Some(f) if f == 0.0 => Some(false),
            _ => None,
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => {
            let millis = n.as_i64().or_else(|| integral_f64(n.as_f64()?))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        JsonValue::String(s) => parse_timestamp_text(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(millis) = text.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Builds a record from a row object whose keys are column names, e.g. a backup entry or a
/// row read back from the destination table. Returns the record and the number of cells that
/// failed to convert.
pub fn record_from_object(schema: &TableSchema, object: &Map<String, JsonValue>) -> (FlatRecord, usize) {
    let mut record = FlatRecord::null(schema);
    let mut failures = 0;
    for (idx, column) in schema.columns().iter().enumerate() {
        let Some(value) = object.get(&column.name) else {
            continue;
        };
        match coerce_value(value, column.column_type) {
            Some(cell) => record.set(idx, cell),
            None => failures += 1,
        }
    }
    (record, failures)
}

/// A nested object inside each item whose fields become prefixed columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedPrefix {
    /// Dotted path from the item root, e.g. `sale` or `data.bidding`.
    pub path: String,
    /// An empty prefix or one ending in `_` is joined to keys as-is (`item_` + `itemId`).
    /// Any other prefix capitalises the key (`productLocation` + `City`), and the bare key
    /// is used when the schema has no such prefixed column.
    pub prefix: String,
}

impl NestedPrefix {
    pub fn new(path: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
        }
    }

    fn joins_verbatim(&self) -> bool {
        self.prefix.is_empty() || self.prefix.ends_with('_')
    }
}

pub fn default_nested_prefixes() -> Vec<NestedPrefix> {
    NESTED_PREFIXES.iter().map(|p| NestedPrefix::new(*p, *p)).collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlattenOutcome {
    pub records: Vec<FlatRecord>,
    pub skipped_items: usize,
    pub coercion_failures: usize,
}

/// Maps raw pages onto one table schema.
#[derive(Debug, Clone)]
pub struct Flattener {
    schema: TableSchema,
    nested: Vec<NestedPrefix>,
    aliases: Vec<(String, String)>,
    stamp_columns: Vec<String>,
    ingested_at: DateTime<Utc>,
}

impl Flattener {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            nested: default_nested_prefixes(),
            aliases: DEFAULT_ALIASES
                .iter()
                .map(|(column, field)| (column.to_string(), field.to_string()))
                .collect(),
            stamp_columns: DEFAULT_STAMP_COLUMNS.iter().map(ToString::to_string).collect(),
            ingested_at: Utc::now(),
        }
    }

    /// Replaces the nested objects expanded into columns.
    pub fn with_nested(mut self, nested: Vec<NestedPrefix>) -> Self {
        self.nested = nested;
        self
    }

    pub fn with_alias(mut self, column: impl Into<String>, source_field: impl Into<String>) -> Self {
        self.aliases.push((column.into(), source_field.into()));
        self
    }

    pub fn with_stamp_columns(mut self, columns: Vec<String>) -> Self {
        self.stamp_columns = columns;
        self
    }

    pub fn with_ingested_at(mut self, ingested_at: DateTime<Utc>) -> Self {
        self.ingested_at = ingested_at;
        self
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn flatten(&self, page: &JsonValue) -> Vec<FlatRecord> {
        self.flatten_page(page).records
    }

    pub fn flatten_page(&self, page: &JsonValue) -> FlattenOutcome {
        let shape = classify_shape(page);
        let mut outcome = FlattenOutcome::default();

        let sale = match shape {
            PageShape::Unrecognized => {
                warn!("page layout not recognised; no records produced");
                return outcome;
            }
            PageShape::SaleLots { sale, .. } => Some(sale),
            PageShape::FlatItems(_) | PageShape::SingleItem(_) => None,
        };

        for item in shape.items() {
            let Some(item) = item.as_object() else {
                outcome.skipped_items += 1;
                continue;
            };
            let mut fields = Map::new();
            if let Some(sale) = sale {
                fields.extend(sale.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            self.merge_item_fields(&mut fields, item);
            let (record, failures) = self.map_fields(&fields);
            outcome.coercion_failures += failures;
            outcome.records.push(record);
        }

        if outcome.skipped_items > 0 {
            warn!(skipped = outcome.skipped_items, "skipped non-object entries in item list");
        }
        if outcome.coercion_failures > 0 {
            warn!(
                failures = outcome.coercion_failures,
                "values could not be converted to their column type and were nulled"
            );
        }
        debug!(
            shape = shape.name(),
            records = outcome.records.len(),
            "flattened page"
        );
        outcome
    }

    /// Copies an item's fields into `fields`, then expands the configured nested objects.
    /// Expanded values override existing same-named fields.
    fn merge_item_fields(&self, fields: &mut Map<String, JsonValue>, item: &Map<String, JsonValue>) {
        for (key, value) in item {
            fields.insert(key.clone(), value.clone());
        }
        for nested in &self.nested {
            let Some(JsonValue::Object(object)) = lookup_path(item, &nested.path) else {
                continue;
            };
            // Keys already carrying the prefix go last so they win over `prefix + key`.
            let (renamed, exact): (Vec<_>, Vec<_>) = object
                .iter()
                .filter(|(_, value)| !value.is_null())
                .partition(|(key, _)| nested.joins_verbatim() || !key.starts_with(&nested.prefix));
            for (key, value) in renamed.into_iter().chain(exact) {
                fields.insert(self.nested_column(nested, key), value.clone());
            }
        }
    }

    fn nested_column(&self, nested: &NestedPrefix, key: &str) -> String {
        if nested.joins_verbatim() {
            return format!("{}{key}", nested.prefix);
        }
        if key.starts_with(&nested.prefix) {
            return key.to_string();
        }
        let prefixed = capitalised_join(&nested.prefix, key);
        if !self.schema.contains(&prefixed) && self.schema.contains(key) {
            return key.to_string();
        }
        prefixed
    }

    fn map_fields(&self, fields: &Map<String, JsonValue>) -> (FlatRecord, usize) {
        let mut record = FlatRecord::null(&self.schema);
        let mut failures = 0;
        for (idx, column) in self.schema.columns().iter().enumerate() {
            let source = fields.get(&column.name).filter(|v| !v.is_null()).or_else(|| {
                self.aliases
                    .iter()
                    .filter(|(alias_column, _)| *alias_column == column.name)
                    .find_map(|(_, field)| fields.get(field).filter(|v| !v.is_null()))
            });
            if let Some(value) = source {
                match coerce_value(value, column.column_type) {
                    Some(cell) => record.set(idx, cell),
                    None => {
                        debug!(column = %column.name, value = %value, "coercion failed");
                        failures += 1;
                    }
                }
            }
            if record.value_at(idx).is_null() && self.stamp_columns.contains(&column.name) {
                let stamp = JsonValue::String(self.ingested_at.to_rfc3339_opts(SecondsFormat::Millis, true));
                if let Some(cell) = coerce_value(&stamp, column.column_type) {
                    record.set(idx, cell);
                }
            }
        }
        (record, failures)
    }
}

fn lookup_path<'a>(item: &'a Map<String, JsonValue>, path: &str) -> Option<&'a JsonValue> {
    let mut parts = path.split('.');
    let mut current = item.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn capitalised_join(prefix: &str, key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => format!("{prefix}{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => prefix.to_string(),
    }
}
