//! Page-by-page collection of one auction listing.

use anyhow::{bail, Result};
use async_trait::async_trait;
use auction_core::PageFetchResult;
use auction_storage::{RawResponseStore, StoredPage};
use chrono::Local;
use tracing::{error, info, info_span, warn, Instrument};

/// Anything that can produce one page of a listing.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, source_id: &str, page_number: u32, page_size: u32) -> Result<PageFetchResult>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationOptions {
    pub page_size: u32,
    pub start_page: u32,
    /// Records already collected by an earlier run that stopped part-way.
    pub already_collected: u64,
    pub max_pages: Option<u32>,
}

impl Default for PaginationOptions {
    fn default() -> Self {
        Self {
            page_size: 120,
            start_page: 1,
            already_collected: 0,
            max_pages: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Complete,
    /// A page came back empty before the reported total was reached.
    EmptyPage { page: u32 },
    PageCap { pages: u32 },
    FetchFailed { page: u32, error: String },
    PersistFailed { page: u32, error: String },
}

#[derive(Debug, Clone)]
pub struct PaginationRun {
    pub source_id: String,
    pub pages: Vec<PageFetchResult>,
    pub stored: Vec<StoredPage>,
    pub collected: u64,
    pub last_reported_total: u64,
    pub stop: StopReason,
}

impl PaginationRun {
    pub fn is_complete(&self) -> bool {
        self.stop == StopReason::Complete
    }
}

pub struct Paginator {
    store: RawResponseStore,
}

impl Paginator {
    pub fn new(store: RawResponseStore) -> Self {
        Self { store }
    }

    /// Fetches successive pages until the collected count reaches the most recently reported
    /// total. Every page is persisted before it is counted. Fetch and persist failures end the
    /// run and are reported through [`StopReason`]; only invalid options return an error.
    pub async fn collect_all_pages(
        &self,
        source_id: &str,
        source: &dyn PageSource,
        options: &PaginationOptions,
    ) -> Result<PaginationRun> {
        if options.page_size == 0 {
            bail!("page size must be at least 1");
        }
        if options.start_page == 0 {
            bail!("pages are numbered from 1");
        }

        let mut run = PaginationRun {
            source_id: source_id.to_string(),
            pages: Vec::new(),
            stored: Vec::new(),
            collected: options.already_collected,
            last_reported_total: 0,
            stop: StopReason::Complete,
        };
        let mut page_number = options.start_page;
        let mut fetched = 0u32;

        run.stop = loop {
            if options.max_pages.is_some_and(|max| fetched >= max) {
                warn!(source_id, pages = fetched, "page cap reached before listing was exhausted");
                break StopReason::PageCap { pages: fetched };
            }

            let span = info_span!("page_fetch", source_id, page = page_number);
            let page = match source
                .fetch_page(source_id, page_number, options.page_size)
                .instrument(span)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    error!(source_id, page = page_number, error = %format!("{err:#}"), "page fetch failed");
                    break StopReason::FetchFailed {
                        page: page_number,
                        error: format!("{err:#}"),
                    };
                }
            };

            let stored = match self.store.persist_page(&page, Local::now()).await {
                Ok(stored) => stored,
                Err(err) => {
                    error!(source_id, page = page_number, error = %format!("{err:#}"), "persisting page failed");
                    break StopReason::PersistFailed {
                        page: page_number,
                        error: format!("{err:#}"),
                    };
                }
            };

            fetched += 1;
            let item_count = page.item_count() as u64;
            run.collected += item_count;
            run.last_reported_total = page.reported_total;
            info!(
                source_id,
                page = page_number,
                items = item_count,
                collected = run.collected,
                reported_total = page.reported_total,
                path = %stored.path.display(),
                "page stored"
            );
            run.pages.push(page);
            run.stored.push(stored);

            if run.collected >= run.last_reported_total {
                break StopReason::Complete;
            }
            if item_count == 0 {
                warn!(
                    source_id,
                    page = page_number,
                    collected = run.collected,
                    reported_total = run.last_reported_total,
                    "empty page before reported total was reached"
                );
                break StopReason::EmptyPage { page: page_number };
            }
            page_number += 1;
        };

        Ok(run)
    }
}
