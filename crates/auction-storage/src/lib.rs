//! Raw page storage, reconciliation backups and HTTP fetch utilities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use auction_core::PageFetchResult;
use chrono::{DateTime, Local};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "auction-storage";

const MAX_SOURCE_NAME_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Append-only store of fetched pages: one pretty-printed JSON document per page in the
/// pending directory, moved to the archive directory once ingested.
#[derive(Debug, Clone)]
pub struct RawResponseStore {
    pending_dir: PathBuf,
    archive_dir: PathBuf,
}

impl RawResponseStore {
    pub fn new(pending_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            pending_dir: pending_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    /// Store rooted at `pending_dir` with the default `uploaded/` archive subdirectory.
    pub fn with_default_archive(pending_dir: impl Into<PathBuf>) -> Self {
        let pending_dir = pending_dir.into();
        let archive_dir = pending_dir.join("uploaded");
        Self {
            pending_dir,
            archive_dir,
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn sanitize_source_id(source_id: &str) -> String {
        let cleaned: String = source_id
            .chars()
            .take(MAX_SOURCE_NAME_CHARS)
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        if cleaned.is_empty() {
            "source".to_string()
        } else {
            cleaned
        }
    }

    pub fn page_file_name(source_id: &str, page_number: u32, fetched_at: DateTime<Local>) -> String {
        format!(
            "{}_page{}_{}.json",
            Self::sanitize_source_id(source_id),
            page_number,
            fetched_at.format("%Y%m%d_%H%M%S")
        )
    }

    /// Persist one page verbatim. A rerun of the same page never replaces an earlier file.
    pub async fn persist_page(
        &self,
        page: &PageFetchResult,
        fetched_at: DateTime<Local>,
    ) -> anyhow::Result<StoredPage> {
        let bytes = serde_json::to_vec_pretty(&page.body).context("serializing page body")?;
        let file_name = Self::page_file_name(&page.source_id, page.page_number, fetched_at);
        let path = write_new_file(&self.pending_dir, &file_name, &bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "persisted raw page");
        Ok(StoredPage {
            content_hash: Self::sha256_hex(&bytes),
            path,
            byte_size: bytes.len(),
        })
    }

    /// Raw page files still waiting for ingestion, sorted by name.
    pub async fn pending_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !fs::try_exists(&self.pending_dir)
            .await
            .with_context(|| format!("checking {}", self.pending_dir.display()))?
        {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.pending_dir)
            .await
            .with_context(|| format!("reading {}", self.pending_dir.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if is_json && !hidden && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn read_page(path: &Path) -> anyhow::Result<JsonValue> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading raw page {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing raw page {}", path.display()))
    }

    /// Move an ingested file into the archive directory. On a name clash the current
    /// timestamp is appended to the file stem.
    pub async fn archive(&self, path: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.archive_dir)
            .await
            .with_context(|| format!("creating archive directory {}", self.archive_dir.display()))?;
        let file_name = path
            .file_name()
            .with_context(|| format!("{} has no file name", path.display()))?;
        let mut destination = self.archive_dir.join(file_name);
        if fs::try_exists(&destination).await? {
            let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
            let ext = path
                .extension()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "json".to_string());
            let stamp = Local::now().format("%Y%m%d_%H%M%S");
            destination = self.archive_dir.join(format!("{stem}_{stamp}.{ext}"));
        }

        if let Err(err) = fs::rename(path, &destination).await {
            debug!(error = %err, "rename failed; falling back to copy + remove");
            fs::copy(path, &destination).await.with_context(|| {
                format!("archiving {} -> {}", path.display(), destination.display())
            })?;
            fs::remove_file(path)
                .await
                .with_context(|| format!("removing archived source {}", path.display()))?;
        }
        info!(from = %path.display(), to = %destination.display(), "archived raw page");
        Ok(destination)
    }
}

/// Write `bytes` under `dir/file_name` via a temp file + rename, picking a `_N` suffix if the
/// name is already taken.
async fn write_new_file(dir: &Path, file_name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating directory {}", dir.display()))?;

    let name_path = Path::new(file_name);
    let stem = name_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = name_path
        .extension()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "json".to_string());

    let mut destination = dir.join(file_name);
    let mut suffix = 1u32;
    while fs::try_exists(&destination)
        .await
        .with_context(|| format!("checking {}", destination.display()))?
    {
        destination = dir.join(format!("{stem}_{suffix}.{ext}"));
        suffix += 1;
    }

    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    write_temp(&temp_path, bytes).await?;
    if let Err(err) = fs::rename(&temp_path, &destination).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp file {} -> {}",
                temp_path.display(),
                destination.display()
            )
        });
    }
    Ok(destination)
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    Ok(())
}

/// One JSON backup per table, overwritten on each reconciliation.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backup_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.json"))
    }

    /// Replace the table's backup with `rows`. The previous backup stays intact until the
    /// new file is fully written.
    pub async fn write(&self, table: &str, rows: &[JsonValue]) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating backup directory {}", self.dir.display()))?;
        let bytes = serde_json::to_vec_pretty(rows).context("serializing backup rows")?;
        let destination = self.backup_path(table);
        let temp_path = self.dir.join(format!(".{table}.{}.tmp", Uuid::new_v4()));
        write_temp(&temp_path, &bytes).await?;
        if let Err(err) = fs::rename(&temp_path, &destination).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err)
                .with_context(|| format!("replacing backup {}", destination.display()));
        }
        info!(table, rows = rows.len(), path = %destination.display(), "backup written");
        Ok(destination)
    }

    pub async fn read(&self, table: &str) -> anyhow::Result<Vec<JsonValue>> {
        let path = self.backup_path(table);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading backup {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing backup {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper. Every call is bounded by the configured timeout and is attempted
/// exactly once; re-running is the caller's decision.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn post_json(
        &self,
        source_id: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", source_id, url);
        async {
            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn page(source_id: &str, page_number: u32) -> PageFetchResult {
        let body = json!({"@odata.count": 1, "value": [{"id": "a"}]});
        PageFetchResult {
            source_id: source_id.to_string(),
            page_number,
            reported_total: 1,
            items: vec![json!({"id": "a"})],
            body,
        }
    }

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 10, 26, 9, 30, 5).single().expect("ts")
    }

    #[test]
    fn content_hashing_is_stable() {
        let hash = RawResponseStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn page_file_names_follow_source_page_timestamp_convention() {
        let name = RawResponseStore::page_file_name("national online/11924", 3, fixed_time());
        assert_eq!(name, "national_online_11924_page3_20251026_093005.json");
        let long = "x".repeat(80);
        let name = RawResponseStore::page_file_name(&long, 1, fixed_time());
        assert!(name.starts_with(&"x".repeat(50)));
        assert!(!name.starts_with(&"x".repeat(51)));
    }

    #[tokio::test]
    async fn rerun_of_same_page_produces_new_artifact() {
        let dir = tempdir().expect("tempdir");
        let store = RawResponseStore::with_default_archive(dir.path());

        let first = store.persist_page(&page("sale-1", 1), fixed_time()).await.expect("first");
        let second = store.persist_page(&page("sale-1", 1), fixed_time()).await.expect("second");

        assert_ne!(first.path, second.path);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(second.path.to_string_lossy().ends_with("_1.json"));

        let text = std::fs::read_to_string(&first.path).expect("read");
        assert!(text.contains('\n'), "raw pages are pretty-printed");
        let pending = store.pending_files().await.expect("pending");
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn archive_moves_file_and_avoids_clobbering() {
        let dir = tempdir().expect("tempdir");
        let store = RawResponseStore::with_default_archive(dir.path());

        let stored = store.persist_page(&page("sale-1", 1), fixed_time()).await.expect("persist");
        let archived = store.archive(&stored.path).await.expect("archive");
        assert!(!stored.path.exists());
        assert!(archived.starts_with(store.archive_dir()));

        std::fs::write(&stored.path, b"{}").expect("recreate");
        let again = store.archive(&stored.path).await.expect("archive again");
        assert_ne!(again, archived);
        assert!(archived.exists() && again.exists());
        assert!(store.pending_files().await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn pending_files_skips_temp_and_non_json() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("b_page1_x.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("a_page1_x.json"), b"{}").unwrap();
        std::fs::write(dir.path().join(".abc.tmp"), b"{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        let store = RawResponseStore::with_default_archive(dir.path());
        let files = store.pending_files().await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["a_page1_x.json", "b_page1_x.json"]);
    }

    #[tokio::test]
    async fn backup_is_overwritten_per_table() {
        let dir = tempdir().expect("tempdir");
        let backups = BackupStore::new(dir.path().join("backups"));
        backups.write("sale_info", &[json!({"id": 1})]).await.unwrap();
        let path = backups
            .write("sale_info", &[json!({"id": 2}), json!({"id": 3})])
            .await
            .unwrap();
        assert_eq!(path, backups.backup_path("sale_info"));
        let rows = backups.read("sale_info").await.unwrap();
        assert_eq!(rows, vec![json!({"id": 2}), json!({"id": 3})]);
        assert!(backups.read("other").await.is_err());
    }
}
