//! Destination tables: Postgres via sqlx, plus an in-memory store for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use auction_adapters::record_from_object;
use auction_core::{CellValue, ColumnType, FlatRecord, TableSchema};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};

const MAX_BIND_PARAMS: usize = 65_535;

/// Identity column appended to every Postgres table; rows are read back in its order.
pub const INSERT_SEQ_COLUMN: &str = "_insert_seq";

#[async_trait]
pub trait TableStore: Send + Sync {
    async fn count(&self, table: &str) -> Result<u64>;

    /// Every row of the table, in insertion order.
    async fn read_all(&self, table: &str, schema: &TableSchema) -> Result<Vec<FlatRecord>>;

    /// Appends all records or none of them.
    async fn insert(&self, table: &str, schema: &TableSchema, records: &[FlatRecord]) -> Result<u64>;

    async fn truncate(&self, table: &str) -> Result<()>;

    async fn replace_all(&self, table: &str, schema: &TableSchema, records: &[FlatRecord]) -> Result<u64> {
        self.truncate(table).await?;
        self.insert(table, schema, records).await
    }

    async fn ensure_table(&self, table: &str, schema: &TableSchema) -> Result<()>;
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn create_table_sql(table: &str, schema: &TableSchema) -> String {
    let columns = schema
        .columns()
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.column_type.postgres_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({columns}, {} BIGSERIAL)",
        quote_ident(table),
        quote_ident(INSERT_SEQ_COLUMN)
    )
}

/// Adds the sequence column to a table created before it existed. Existing rows are numbered
/// in their current physical order.
pub fn add_insert_seq_sql(table: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} BIGSERIAL",
        quote_ident(table),
        quote_ident(INSERT_SEQ_COLUMN)
    )
}

#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_chunks(
    conn: &mut PgConnection,
    table: &str,
    schema: &TableSchema,
    records: &[FlatRecord],
) -> Result<u64> {
    let columns = schema
        .column_names()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ");
    let rows_per_chunk = (MAX_BIND_PARAMS / schema.len()).max(1);
    let mut inserted = 0u64;

    for chunk in records.chunks(rows_per_chunk) {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({columns}) ", quote_ident(table)));
        builder.push_values(chunk, |mut row, record| {
            for (column, cell) in schema.columns().iter().zip(record.values()) {
                bind_cell(&mut row, column.column_type, cell);
            }
        });
        let result = builder
            .build()
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting {} rows into {table}", chunk.len()))?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

fn bind_cell(row: &mut Separated<'_, '_, Postgres, &'static str>, column_type: ColumnType, cell: &CellValue) {
    match cell {
        CellValue::Text(s) => row.push_bind(s.clone()),
        CellValue::Integer(i) => row.push_bind(*i),
        CellValue::Decimal(d) => row.push_bind(*d),
        CellValue::Boolean(b) => row.push_bind(*b),
        CellValue::Timestamp(ts) => row.push_bind(*ts),
        CellValue::Json(v) => row.push_bind(sqlx::types::Json(v.clone())),
        CellValue::Null => match column_type {
            ColumnType::Text => row.push_bind(None::<String>),
            ColumnType::Integer => row.push_bind(None::<i64>),
            ColumnType::Decimal => row.push_bind(None::<f64>),
            ColumnType::Boolean => row.push_bind(None::<bool>),
            ColumnType::Timestamp => row.push_bind(None::<DateTime<Utc>>),
            ColumnType::Json => row.push_bind(None::<sqlx::types::Json<JsonValue>>),
        },
    };
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn count(&self, table: &str) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", quote_ident(table)))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("counting rows in {table}"))?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn read_all(&self, table: &str, schema: &TableSchema) -> Result<Vec<FlatRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT row_to_json(t)::text AS row FROM {} t ORDER BY t.{}",
            quote_ident(table),
            quote_ident(INSERT_SEQ_COLUMN)
        ))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("reading {table}"))?;

        let mut records = Vec::with_capacity(rows.len());
        let mut failures = 0usize;
        for row in rows {
            let text: String = row.try_get("row")?;
            let value: JsonValue = serde_json::from_str(&text).with_context(|| format!("decoding row of {table}"))?;
            let object = value
                .as_object()
                .ok_or_else(|| anyhow!("row of {table} is not a JSON object"))?;
            let (record, failed) = record_from_object(schema, object);
            failures += failed;
            records.push(record);
        }
        if failures > 0 {
            warn!(table, failures, "stored values did not match the schema and were read as null");
        }
        debug!(table, rows = records.len(), "table read");
        Ok(records)
    }

    async fn insert(&self, table: &str, schema: &TableSchema, records: &[FlatRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.context("starting insert transaction")?;
        let inserted = insert_chunks(&mut *tx, table, schema, records).await?;
        tx.commit().await.with_context(|| format!("committing insert into {table}"))?;
        info!(table, rows = inserted, "rows inserted");
        Ok(inserted)
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("TRUNCATE TABLE {}", quote_ident(table)))
            .execute(&self.pool)
            .await
            .with_context(|| format!("truncating {table}"))?;
        Ok(())
    }

    /// Truncate and reinsert in one transaction, so a failed rewrite leaves the table as it was.
    async fn replace_all(&self, table: &str, schema: &TableSchema, records: &[FlatRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("starting rewrite transaction")?;
        sqlx::query(&format!("TRUNCATE TABLE {}", quote_ident(table)))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("truncating {table}"))?;
        let inserted = insert_chunks(&mut *tx, table, schema, records).await?;
        tx.commit().await.with_context(|| format!("committing rewrite of {table}"))?;
        info!(table, rows = inserted, "table rewritten");
        Ok(inserted)
    }

    async fn ensure_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        sqlx::query(&create_table_sql(table, schema))
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating table {table}"))?;
        sqlx::query(&add_insert_seq_sql(table))
            .execute(&self.pool)
            .await
            .with_context(|| format!("adding {INSERT_SEQ_COLUMN} to {table}"))?;
        info!(table, columns = schema.len(), "table ensured");
        Ok(())
    }
}

/// Process-local tables. Inserts can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<HashMap<String, Vec<FlatRecord>>>,
    failing_inserts: AtomicUsize,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` insert calls fail without touching the table.
    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Vec<FlatRecord> {
        self.lock()
            .map(|tables| tables.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<FlatRecord>>>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("in-memory table store lock poisoned"))
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn count(&self, table: &str) -> Result<u64> {
        Ok(self.lock()?.get(table).map_or(0, Vec::len) as u64)
    }

    async fn read_all(&self, table: &str, _schema: &TableSchema) -> Result<Vec<FlatRecord>> {
        Ok(self.lock()?.get(table).cloned().unwrap_or_default())
    }

    async fn insert(&self, table: &str, schema: &TableSchema, records: &[FlatRecord]) -> Result<u64> {
        let pending_failures = self.failing_inserts.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_inserts.store(pending_failures - 1, Ordering::SeqCst);
            bail!("simulated insert failure on {table}");
        }
        if let Some(bad) = records.iter().find(|r| r.values().len() != schema.len()) {
            bail!(
                "record with {} values does not fit {table} ({} columns)",
                bad.values().len(),
                schema.len()
            );
        }
        self.lock()?
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        if let Some(rows) = self.lock()?.get_mut(table) {
            rows.clear();
        }
        Ok(())
    }

    async fn ensure_table(&self, table: &str, _schema: &TableSchema) -> Result<()> {
        self.lock()?.entry(table.to_string()).or_default();
        Ok(())
    }
}
