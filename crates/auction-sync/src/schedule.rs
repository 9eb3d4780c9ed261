//! Scrape timing derived from auction end dates, and the cron-driven job scheduler.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{AuctionConfig, AuctionPipeline};

/// UTC offsets, in minutes, of the zone abbreviations the auction site prints.
const ZONE_OFFSETS: [(&str, i32); 6] = [
    ("AEST", 600),
    ("AEDT", 660),
    ("ACST", 570),
    ("ACDT", 630),
    ("AWST", 480),
    ("AWDT", 540),
];

fn sale_date_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)(\d{1,2})/(\d{1,2})/(\d{4})\s+(\d{1,2}):(\d{2})\s*([ap]m)\s+([a-z]{3,5})\b").ok()
        })
        .as_ref()
}

pub fn zone_offset(abbreviation: &str) -> Option<FixedOffset> {
    let upper = abbreviation.to_ascii_uppercase();
    ZONE_OFFSETS
        .iter()
        .find(|(name, _)| *name == upper)
        .and_then(|(_, minutes)| FixedOffset::east_opt(minutes * 60))
}

/// End of an auction from the site's sale-date text, e.g. `Ends Thursday 23/10/2025 1:00pm ACST`
/// or `Thursday 23/10/2025 12:00pm - Friday 24/10/2025 12:00pm AEST`. For a range the end is
/// the last date. RFC 3339 text is accepted as well.
pub fn parse_sale_end(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }

    let caps = sale_date_pattern()?.captures_iter(text).last()?;
    let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let (day, month, year) = (number(1)?, number(2)?, number(3)?);
    let (hour12, minute) = (number(4)?, number(5)?);
    if !(1..=12).contains(&hour12) {
        return None;
    }
    let pm = caps.get(6)?.as_str().eq_ignore_ascii_case("pm");
    let hour = match (hour12, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };
    let offset = zone_offset(caps.get(7)?.as_str())?;
    let naive = NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)?.and_hms_opt(hour, minute, 0)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedScrape {
    pub source_id: String,
    pub sale_end: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
}

/// One scrape per enabled auction, `lead` before its end. Auctions whose run time has already
/// passed, or whose end date cannot be read, are left out.
pub fn plan_scrapes(auctions: &[AuctionConfig], lead: chrono::Duration, now: DateTime<Utc>) -> Vec<PlannedScrape> {
    let mut plans = Vec::new();
    for auction in auctions.iter().filter(|a| a.enabled) {
        let Some(text) = auction.sale_end.as_deref() else {
            continue;
        };
        let Some(sale_end) = parse_sale_end(text) else {
            warn!(source_id = %auction.source_id, sale_end = text, "could not parse auction end");
            continue;
        };
        let run_at = sale_end - lead;
        if run_at <= now {
            info!(source_id = %auction.source_id, %run_at, "scrape time already passed; skipping");
            continue;
        }
        plans.push(PlannedScrape {
            source_id: auction.source_id.clone(),
            sale_end,
            run_at,
        });
    }
    plans.sort_by_key(|p| p.run_at);
    plans
}

/// Scheduler with the periodic ingest job plus one one-shot scrape per planned auction.
pub async fn build_scheduler(pipeline: Arc<AuctionPipeline>, now: DateTime<Utc>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let config = pipeline.config();

    let cron = config.ingest_cron.clone();
    let ingest_pipeline = pipeline.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = ingest_pipeline.clone();
        Box::pin(async move {
            match pipeline.run_all_tables().await {
                Ok(runs) => info!(tables = runs.len(), "scheduled ingest finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled ingest failed"),
            }
        })
    })
    .with_context(|| format!("creating ingest job for cron {cron}"))?;
    sched.add(job).await.context("adding ingest job")?;

    let lead = chrono::Duration::minutes(config.scrape_lead_minutes);
    for plan in plan_scrapes(&pipeline.registry().auctions, lead, now) {
        let delay = (plan.run_at - now).to_std().unwrap_or(Duration::ZERO);
        let scrape_pipeline = pipeline.clone();
        let source_id = plan.source_id.clone();
        let job = Job::new_one_shot_async(delay, move |_uuid, _l| {
            let pipeline = scrape_pipeline.clone();
            let source_id = source_id.clone();
            Box::pin(async move {
                match pipeline.scrape_auction(&source_id).await {
                    Ok(run) => info!(
                        source_id = %source_id,
                        collected = run.collected,
                        complete = run.is_complete(),
                        "scheduled scrape finished"
                    ),
                    Err(err) => error!(source_id = %source_id, error = %format!("{err:#}"), "scheduled scrape failed"),
                }
            })
        })
        .with_context(|| format!("creating scrape job for {}", plan.source_id))?;
        sched.add(job).await.context("adding scrape job")?;
        info!(source_id = %plan.source_id, run_at = %plan.run_at, sale_end = %plan.sale_end, "scrape scheduled");
    }

    Ok(sched)
}
