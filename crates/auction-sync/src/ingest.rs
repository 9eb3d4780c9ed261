use std::path::PathBuf;

use anyhow::{Context, Result};
use auction_adapters::Flattener;
use auction_core::{FlatRecord, TableSchema};
use auction_storage::RawResponseStore;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::loader::DeduplicatingLoader;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FileState {
    Pending,
    Flattened { records: usize },
    Archived { to: PathBuf },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub state: FileState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub table: String,
    pub success_count: usize,
    pub failure_count: usize,
    pub records_inserted: u64,
    pub archived: Vec<PathBuf>,
    pub files: Vec<FileOutcome>,
}

/// Loads every pending raw page of one table with a single bulk insert.
#[derive(Clone)]
pub struct IngestionOrchestrator {
    loader: DeduplicatingLoader,
}

impl IngestionOrchestrator {
    pub fn new(loader: DeduplicatingLoader) -> Self {
        Self { loader }
    }

    /// Unreadable files stay pending and count as failures. Files are archived only after the
    /// insert carrying their records succeeded; an insert failure leaves every file in place and
    /// is returned as an error.
    pub async fn ingest_all(&self, raw: &RawResponseStore, schema: &TableSchema, table: &str) -> Result<IngestSummary> {
        self.ingest_with(raw, &Flattener::new(schema.clone()), table).await
    }

    /// Same as [`Self::ingest_all`] with a table-specific flattener.
    pub async fn ingest_with(&self, raw: &RawResponseStore, flattener: &Flattener, table: &str) -> Result<IngestSummary> {
        let span = info_span!("ingest", table, raw_dir = %raw.pending_dir().display());
        self.ingest_files(raw, flattener, table).instrument(span).await
    }

    async fn ingest_files(&self, raw: &RawResponseStore, flattener: &Flattener, table: &str) -> Result<IngestSummary> {
        let mut summary = IngestSummary {
            table: table.to_string(),
            ..IngestSummary::default()
        };
        let mut combined: Vec<FlatRecord> = Vec::new();

        for path in raw.pending_files().await? {
            let mut outcome = FileOutcome {
                path,
                state: FileState::Pending,
            };
            match RawResponseStore::read_page(&outcome.path).await {
                Ok(page) => {
                    let flattened = flattener.flatten_page(&page);
                    info!(
                        file = %outcome.path.display(),
                        records = flattened.records.len(),
                        coercion_failures = flattened.coercion_failures,
                        "file flattened"
                    );
                    outcome.state = FileState::Flattened {
                        records: flattened.records.len(),
                    };
                    combined.extend(flattened.records);
                }
                Err(err) => {
                    warn!(file = %outcome.path.display(), error = %format!("{err:#}"), "raw file skipped");
                    summary.failure_count += 1;
                    outcome.state = FileState::Failed {
                        error: format!("{err:#}"),
                    };
                }
            }
            summary.files.push(outcome);
        }

        if combined.is_empty() {
            info!(files = summary.files.len(), "no records to insert; nothing archived");
            return Ok(summary);
        }

        let inserted = self
            .loader
            .insert(&combined, table, flattener.schema())
            .await
            .with_context(|| {
                format!(
                    "loading {} records from {} files into {table}; files left in place",
                    combined.len(),
                    summary.files.iter().filter(|f| matches!(f.state, FileState::Flattened { .. })).count()
                )
            })?;
        summary.records_inserted = inserted;

        for outcome in &mut summary.files {
            if !matches!(outcome.state, FileState::Flattened { .. }) {
                continue;
            }
            match raw.archive(&outcome.path).await {
                Ok(to) => {
                    summary.success_count += 1;
                    summary.archived.push(to.clone());
                    outcome.state = FileState::Archived { to };
                }
                Err(err) => {
                    error!(file = %outcome.path.display(), error = %format!("{err:#}"), "archiving failed");
                    summary.failure_count += 1;
                    outcome.state = FileState::Failed {
                        error: format!("{err:#}"),
                    };
                }
            }
        }

        info!(
            inserted = summary.records_inserted,
            archived = summary.success_count,
            failed = summary.failure_count,
            "ingest complete"
        );
        Ok(summary)
    }
}
