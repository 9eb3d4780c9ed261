//! Bulk loading and "newest row per partition" reconciliation of destination tables.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use auction_adapters::record_from_object;
use auction_core::{DedupPolicy, FlatRecord, ResolvedPolicy, TableSchema};
use auction_storage::BackupStore;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::table_store::TableStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub table: String,
    pub before: u64,
    pub after: u64,
    pub removed: u64,
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DuplicateStats {
    pub total: u64,
    pub unique: u64,
    pub duplicates: u64,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("writing backup for {table} failed; table left untouched: {message}")]
    BackupFailed { table: String, message: String },
    #[error("rewriting {table} failed ({message}); restore from backup: {}", describe_restore(.restored))]
    RewriteFailed {
        table: String,
        message: String,
        restored: Option<u64>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn describe_restore(restored: &Option<u64>) -> String {
    match restored {
        Some(rows) => format!("{rows} rows restored"),
        None => "FAILED, table may be empty".to_string(),
    }
}

/// Keeps, for every partition, the row with the greatest order key. Among equal order keys the
/// row read last wins; a null order key loses to any value. Survivors keep the position of
/// their partition's first row.
pub fn rank_and_filter(records: Vec<FlatRecord>, policy: &ResolvedPolicy) -> Vec<FlatRecord> {
    let mut slots: HashMap<Vec<String>, usize> = HashMap::with_capacity(records.len());
    let mut survivors: Vec<FlatRecord> = Vec::new();
    for record in records {
        let key = policy.partition_key_of(&record);
        match slots.get(&key) {
            Some(&slot) => {
                let current = survivors[slot].value_at(policy.order);
                if record.value_at(policy.order).order_cmp(current).is_ge() {
                    survivors[slot] = record;
                }
            }
            None => {
                slots.insert(key, survivors.len());
                survivors.push(record);
            }
        }
    }
    survivors
}

#[derive(Clone)]
pub struct DeduplicatingLoader {
    store: Arc<dyn TableStore>,
    backups: BackupStore,
}

impl DeduplicatingLoader {
    pub fn new(store: Arc<dyn TableStore>, backups: BackupStore) -> Self {
        Self { store, backups }
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    /// One bulk append; all records land or none do.
    pub async fn insert(&self, records: &[FlatRecord], table: &str, schema: &TableSchema) -> Result<u64> {
        self.store
            .insert(table, schema, records)
            .await
            .with_context(|| format!("bulk insert into {table}"))
    }

    /// Inserts and reconciles; returns the table's row count afterwards.
    pub async fn load(
        &self,
        records: &[FlatRecord],
        table: &str,
        schema: &TableSchema,
        policy: &DedupPolicy,
    ) -> Result<u64, ReconcileError> {
        self.insert(records, table, schema).await?;
        Ok(self.reconcile(table, schema, policy).await?.after)
    }

    pub async fn reconcile(
        &self,
        table: &str,
        schema: &TableSchema,
        policy: &DedupPolicy,
    ) -> Result<ReconcileReport, ReconcileError> {
        let resolved = policy.resolve(schema)?;
        let before = self.store.count(table).await?;
        if before == 0 {
            info!(table, "table empty; nothing to reconcile");
            return Ok(ReconcileReport {
                table: table.to_string(),
                before: 0,
                after: 0,
                removed: 0,
                backup_path: None,
            });
        }

        let rows = self.store.read_all(table, schema).await?;
        let before = rows.len() as u64;
        let survivors = rank_and_filter(rows, &resolved);

        let backup_rows: Vec<JsonValue> = survivors
            .iter()
            .map(|r| JsonValue::Object(r.to_json_object(schema)))
            .collect();
        let backup_path = self
            .backups
            .write(table, &backup_rows)
            .await
            .map_err(|err| ReconcileError::BackupFailed {
                table: table.to_string(),
                message: format!("{err:#}"),
            })?;

        if survivors.len() as u64 == before {
            info!(table, rows = before, "no duplicates found");
            return Ok(ReconcileReport {
                table: table.to_string(),
                before,
                after: before,
                removed: 0,
                backup_path: Some(backup_path),
            });
        }

        if let Err(err) = self.store.replace_all(table, schema, &survivors).await {
            let message = format!("{err:#}");
            error!(table, error = %message, "rewrite failed; restoring from backup");
            let restored = match self.restore(table, schema).await {
                Ok(rows) => Some(rows),
                Err(restore_err) => {
                    error!(table, error = %format!("{restore_err:#}"), "restore from backup failed");
                    None
                }
            };
            return Err(ReconcileError::RewriteFailed {
                table: table.to_string(),
                message,
                restored,
            });
        }

        let after = self.store.count(table).await?;
        let removed = before.saturating_sub(after);
        info!(table, before, after, removed, "reconciliation complete");
        Ok(ReconcileReport {
            table: table.to_string(),
            before,
            after,
            removed,
            backup_path: Some(backup_path),
        })
    }

    /// Replaces the table's contents with its latest backup file.
    pub async fn restore(&self, table: &str, schema: &TableSchema) -> Result<u64> {
        let rows = self.backups.read(table).await?;
        let mut records = Vec::with_capacity(rows.len());
        let mut failures = 0usize;
        for (idx, row) in rows.iter().enumerate() {
            let object = row
                .as_object()
                .ok_or_else(|| anyhow!("backup entry {idx} for {table} is not an object"))?;
            let (record, failed) = record_from_object(schema, object);
            failures += failed;
            records.push(record);
        }
        if failures > 0 {
            warn!(table, failures, "backup values did not fit the schema and were restored as null");
        }
        let restored = self
            .store
            .replace_all(table, schema, &records)
            .await
            .with_context(|| format!("restoring {table} from {}", self.backups.backup_path(table).display()))?;
        info!(table, rows = restored, "table restored from backup");
        Ok(restored)
    }

    pub async fn duplicate_stats(
        &self,
        table: &str,
        schema: &TableSchema,
        partition_key: &[String],
    ) -> Result<DuplicateStats> {
        let indexes = partition_key
            .iter()
            .map(|column| {
                schema
                    .index_of(column)
                    .ok_or_else(|| anyhow!("partition key column {column} is not in the schema"))
            })
            .collect::<Result<Vec<_>>>()?;
        let rows = self.store.read_all(table, schema).await?;
        let unique: HashSet<Vec<String>> = rows
            .iter()
            .map(|r| indexes.iter().map(|&i| r.value_at(i).partition_token()).collect())
            .collect();
        let total = rows.len() as u64;
        let unique = unique.len() as u64;
        Ok(DuplicateStats {
            total,
            unique,
            duplicates: total - unique,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table_store::MemoryTableStore;
    use auction_core::CellValue;
    use tempfile::tempdir;

    const TABLE: &str = "pickles_sale_info";

    fn schema() -> TableSchema {
        TableSchema::from_pairs([("id", "VARCHAR(64)"), ("make", "VARCHAR(100)"), ("updatedAt", "INT")]).unwrap()
    }

    fn policy() -> DedupPolicy {
        DedupPolicy::new(vec!["id".into()], "updatedAt")
    }

    fn row(id: &str, make: &str, order: Option<i64>) -> FlatRecord {
        FlatRecord::from_values(
            &schema(),
            vec![
                CellValue::Text(id.into()),
                CellValue::Text(make.into()),
                order.map_or(CellValue::Null, CellValue::Integer),
            ],
        )
        .unwrap()
    }

    fn loader(dir: &std::path::Path) -> (Arc<MemoryTableStore>, DeduplicatingLoader) {
        let store = Arc::new(MemoryTableStore::new());
        let loader = DeduplicatingLoader::new(store.clone(), BackupStore::new(dir.join("backups")));
        (store, loader)
    }

    #[test]
    fn keeps_greatest_order_key_per_partition() {
        let resolved = policy().resolve(&schema()).unwrap();
        let kept = rank_and_filter(
            vec![row("A", "one", Some(1)), row("B", "b", Some(2)), row("A", "five", Some(5)), row("A", "three", Some(3))],
            &resolved,
        );
        assert_eq!(kept, vec![row("A", "five", Some(5)), row("B", "b", Some(2))]);
    }

    #[test]
    fn ties_go_to_the_later_row_and_nulls_lose() {
        let resolved = policy().resolve(&schema()).unwrap();
        let kept = rank_and_filter(vec![row("A", "first", Some(4)), row("A", "second", Some(4))], &resolved);
        assert_eq!(kept, vec![row("A", "second", Some(4))]);

        let kept = rank_and_filter(vec![row("A", "dated", Some(1)), row("A", "undated", None)], &resolved);
        assert_eq!(kept, vec![row("A", "dated", Some(1))]);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_and_backs_up_first() {
        let dir = tempdir().unwrap();
        let (store, loader) = loader(dir.path());
        let schema = schema();
        let rows = vec![
            row("A", "one", Some(1)),
            row("A", "five", Some(5)),
            row("A", "three", Some(3)),
            row("B", "b", Some(1)),
        ];
        loader.insert(&rows, TABLE, &schema).await.unwrap();

        let first = loader.reconcile(TABLE, &schema, &policy()).await.unwrap();
        assert_eq!((first.before, first.after, first.removed), (4, 2, 2));
        let backup = first.backup_path.clone().unwrap();
        let saved: Vec<JsonValue> = serde_json::from_slice(&std::fs::read(&backup).unwrap()).unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0]["make"], "five");

        let second = loader.reconcile(TABLE, &schema, &policy()).await.unwrap();
        assert_eq!((second.before, second.after, second.removed), (2, 2, 0));
        assert_eq!(store.rows(TABLE), vec![row("A", "five", Some(5)), row("B", "b", Some(1))]);
    }

    #[tokio::test]
    async fn empty_table_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (_store, loader) = loader(dir.path());
        let report = loader.reconcile(TABLE, &schema(), &policy()).await.unwrap();
        assert_eq!(report.after, 0);
        assert!(report.backup_path.is_none());
        assert!(!dir.path().join("backups").join(format!("{TABLE}.json")).exists());
    }

    #[tokio::test]
    async fn failed_rewrite_restores_from_backup() {
        let dir = tempdir().unwrap();
        let (store, loader) = loader(dir.path());
        let schema = schema();
        loader
            .insert(&[row("A", "old", Some(1)), row("A", "new", Some(2))], TABLE, &schema)
            .await
            .unwrap();

        store.fail_next_inserts(1);
        let err = loader.reconcile(TABLE, &schema, &policy()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::RewriteFailed { restored: Some(1), .. }), "{err}");
        assert_eq!(store.rows(TABLE), vec![row("A", "new", Some(2))]);
    }

    #[tokio::test]
    async fn failed_restore_is_reported() {
        let dir = tempdir().unwrap();
        let (store, loader) = loader(dir.path());
        let schema = schema();
        loader
            .insert(&[row("A", "old", Some(1)), row("A", "new", Some(2))], TABLE, &schema)
            .await
            .unwrap();

        store.fail_next_inserts(2);
        let err = loader.reconcile(TABLE, &schema, &policy()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::RewriteFailed { restored: None, .. }));
        assert!(err.to_string().contains("FAILED"));
    }

    #[tokio::test]
    async fn restore_reads_only_the_backup() {
        let dir = tempdir().unwrap();
        let (store, loader) = loader(dir.path());
        let schema = schema();
        assert!(loader.restore(TABLE, &schema).await.is_err(), "no backup yet");

        loader
            .insert(&[row("A", "old", Some(1)), row("A", "new", Some(2))], TABLE, &schema)
            .await
            .unwrap();
        loader.reconcile(TABLE, &schema, &policy()).await.unwrap();
        loader.insert(&[row("Z", "later", Some(9))], TABLE, &schema).await.unwrap();

        let restored = loader.restore(TABLE, &schema).await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(store.rows(TABLE), vec![row("A", "new", Some(2))]);
    }

    #[tokio::test]
    async fn load_inserts_then_reconciles() {
        let dir = tempdir().unwrap();
        let (_store, loader) = loader(dir.path());
        let schema = schema();
        let after = loader
            .load(
                &[row("A", "x", Some(1)), row("A", "y", Some(3)), row("B", "z", None)],
                TABLE,
                &schema,
                &policy(),
            )
            .await
            .unwrap();
        assert_eq!(after, 2);

        let stats = loader.duplicate_stats(TABLE, &schema, &["id".to_string()]).await.unwrap();
        assert_eq!(stats, DuplicateStats { total: 2, unique: 2, duplicates: 0 });
        loader.insert(&[row("A", "dup", Some(0))], TABLE, &schema).await.unwrap();
        let stats = loader.duplicate_stats(TABLE, &schema, &["id".to_string()]).await.unwrap();
        assert_eq!(stats.duplicates, 1);
        assert!(loader.duplicate_stats(TABLE, &schema, &["vin".to_string()]).await.is_err());
    }
}
