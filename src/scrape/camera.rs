//! Chamber of Deputies stenographic report scraper
//!
//! The Chamber publishes one PDF per sitting at a predictable URL. There is
//! no index to query, so the scraper probes sitting numbers with HEAD
//! requests, reads each sitting's date off its info page, and discovers on
//! its own which legislatures it must walk to cover the requested date range.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{NaiveDate, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::http::HttpClient;
use crate::scrape::{dates, write_sidecar, ScrapeStats};

/// Default site root
const BASE_URL: &str = "https://documenti.camera.it";

/// Sitting numbers probed to estimate a legislature's extent
const PROBE_SITTINGS: &[u32] = &[
    1, 5, 10, 20, 50, 100, 200, 300, 400, 500, 600, 700, 800, 900, 1000,
];

/// Consecutive missing sittings that end a legislature scan
const MAX_CONSECUTIVE_MISSING: u32 = 50;

/// Sittings scanned beyond the highest probe hit
const SCAN_OVERRUN: u32 = 100;

/// How far back/forward legislature discovery walks
const BACKWARD_SEARCH_SPAN: i32 = 20;
const FORWARD_SEARCH_SPAN: i32 = 10;

/// What probing found out about one legislature
#[derive(Debug, Clone, Default)]
struct LegislatureInfo {
    exists: bool,
    earliest_date: Option<NaiveDate>,
    latest_date: Option<NaiveDate>,
    max_sitting_found: u32,
}

impl LegislatureInfo {
    /// Whether the legislature's sampled date span overlaps `[from, to]`
    fn overlaps(&self, from: NaiveDate, to: NaiveDate) -> bool {
        match (self.earliest_date, self.latest_date) {
            (Some(earliest), Some(latest)) => !(latest < from || earliest > to),
            _ => false,
        }
    }
}

/// Scraper for documenti.camera.it
pub struct CameraScraper {
    http: HttpClient,
    base_url: String,
    legislature_cache: HashMap<String, LegislatureInfo>,
    processed: HashSet<(String, u32)>,
}

impl CameraScraper {
    /// Create a scraper against the production site
    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, BASE_URL)
    }

    /// Create a scraper against an explicit site root (tests)
    pub fn with_base_url(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            legislature_cache: HashMap::new(),
            processed: HashSet::new(),
        }
    }

    fn pdf_url(&self, leg: &str, sitting: u32) -> String {
        format!(
            "{}/leg{}/resoconti/assemblea/html/sed{:04}/stenografico.pdf",
            self.base_url, leg, sitting
        )
    }

    fn info_url(&self, leg: &str, sitting: u32) -> String {
        format!(
            "{}/leg{}/resoconti/assemblea/html/sed{:04}/stenografico.htm",
            self.base_url, leg, sitting
        )
    }

    /// Harvest every sitting in `[from, to]`, starting discovery at
    /// `start_legislature` and walking to neighbors as needed.
    pub async fn run(
        &mut self,
        start_legislature: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        out_dir: &Path,
    ) -> Result<ScrapeStats> {
        info!(
            legislature = start_legislature,
            from = %from.map(|d| d.to_string()).unwrap_or_else(|| "beginning".into()),
            to = %to.map(|d| d.to_string()).unwrap_or_else(|| "today".into()),
            "starting Chamber harvest"
        );

        let legislatures = match from {
            Some(from) => {
                self.legislatures_for_range(start_legislature, from, to)
                    .await?
            }
            None => vec![start_legislature.to_string()],
        };

        if legislatures.is_empty() {
            warn!("no legislature covers the requested range");
            return Ok(ScrapeStats::default());
        }

        let mut stats = ScrapeStats::default();
        for leg in &legislatures {
            info!(legislature = %leg, "scanning legislature");
            stats.merge(self.scan_legislature(leg, from, to, out_dir).await?);
        }

        info!(
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            errors = stats.errors,
            "Chamber harvest complete"
        );
        Ok(stats)
    }

    /// Probe a legislature's extent, caching the result
    async fn discover_legislature(&mut self, leg: &str) -> Result<LegislatureInfo> {
        if let Some(info) = self.legislature_cache.get(leg) {
            return Ok(info.clone());
        }

        debug!(legislature = leg, "probing legislature extent");
        let mut info = LegislatureInfo::default();
        let mut found_dates = Vec::new();

        for &sitting in PROBE_SITTINGS {
            let (exists, date) = self.check_sitting(leg, sitting).await?;
            if exists {
                info.exists = true;
                info.max_sitting_found = info.max_sitting_found.max(sitting);
                if let Some(date) = date {
                    found_dates.push(date);
                }
            }
            self.http.polite_delay().await;
        }

        info.earliest_date = found_dates.iter().min().copied();
        info.latest_date = found_dates.iter().max().copied();

        if info.exists {
            debug!(
                legislature = leg,
                earliest = ?info.earliest_date,
                latest = ?info.latest_date,
                max_sitting = info.max_sitting_found,
                "legislature discovered"
            );
        } else {
            debug!(legislature = leg, "legislature does not exist");
        }

        self.legislature_cache.insert(leg.to_string(), info.clone());
        Ok(info)
    }

    /// Find every legislature needed to cover `[from, to]`
    async fn legislatures_for_range(
        &mut self,
        start_legislature: &str,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> Result<Vec<String>> {
        let to = to.unwrap_or_else(|| Utc::now().date_naive());
        let start_num: i32 = start_legislature
            .parse()
            .map_err(|_| crate::error::IngestError::scrape("legislature must be numeric"))?;

        let mut needed: Vec<String> = Vec::new();
        let start_info = self.discover_legislature(start_legislature).await?;

        if start_info.exists && start_info.earliest_date.is_some() {
            if start_info.overlaps(from, to) {
                needed.push(start_legislature.to_string());
            }

            // Walk backward while the range start predates this legislature
            if start_info.earliest_date.unwrap_or(to) > from {
                for num in ((start_num - BACKWARD_SEARCH_SPAN).max(1)..start_num).rev() {
                    let leg = num.to_string();
                    let info = self.discover_legislature(&leg).await?;
                    let Some(latest) = info.latest_date else { continue };

                    if latest >= from {
                        needed.push(leg);
                        if info.earliest_date.map_or(false, |earliest| earliest <= from) {
                            break;
                        }
                    } else {
                        break;
                    }
                }
            }

            // Walk forward while the range end postdates this legislature
            if start_info.latest_date.unwrap_or(from) < to {
                for num in (start_num + 1)..(start_num + FORWARD_SEARCH_SPAN) {
                    let leg = num.to_string();
                    let info = self.discover_legislature(&leg).await?;
                    let Some(earliest) = info.earliest_date else { break };

                    if earliest <= to {
                        needed.push(leg);
                        if info.latest_date.map_or(false, |latest| latest >= to) {
                            break;
                        }
                    } else {
                        break;
                    }
                }
            }
        } else {
            // Starting point is bad; sweep the neighborhood
            debug!("starting legislature not usable, extended search");
            for offset in -10i32..10 {
                let num = start_num + offset;
                if num < 1 {
                    continue;
                }
                let leg = num.to_string();
                let info = self.discover_legislature(&leg).await?;
                if info.overlaps(from, to) {
                    needed.push(leg);
                }
            }
        }

        needed.sort_by_key(|l| l.parse::<i32>().unwrap_or(0));
        needed.dedup();
        info!(legislatures = ?needed, "legislatures to process");
        Ok(needed)
    }

    /// HEAD the sitting PDF and, when present, read its date off the info page
    async fn check_sitting(&self, leg: &str, sitting: u32) -> Result<(bool, Option<NaiveDate>)> {
        if !self.http.head_ok(&self.pdf_url(leg, sitting)).await? {
            return Ok((false, None));
        }
        let date = match self.http.get_text(&self.info_url(leg, sitting)).await {
            Ok(Some(body)) => dates::extract_date(&body),
            _ => None,
        };
        Ok((true, date))
    }

    /// Scan sittings 1..max+overrun, downloading everything in range
    async fn scan_legislature(
        &mut self,
        leg: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        out_dir: &Path,
    ) -> Result<ScrapeStats> {
        let info = self.discover_legislature(leg).await?;
        if !info.exists {
            warn!(legislature = leg, "legislature not found");
            return Ok(ScrapeStats::default());
        }

        let end_sitting = info.max_sitting_found + SCAN_OVERRUN;
        let mut stats = ScrapeStats::default();
        let mut consecutive_missing = 0u32;

        for sitting in 1..=end_sitting {
            let (exists, date) = self.check_sitting(leg, sitting).await?;

            if !exists {
                consecutive_missing += 1;
                if consecutive_missing >= MAX_CONSECUTIVE_MISSING {
                    debug!(
                        legislature = leg,
                        sitting, "too many consecutive missing sittings, stopping"
                    );
                    break;
                }
                continue;
            }
            consecutive_missing = 0;

            if let Some(date) = date {
                if from.map_or(false, |f| date < f) || to.map_or(false, |t| date > t) {
                    stats.skipped += 1;
                    continue;
                }
            }

            match self.download_sitting(leg, sitting, date, out_dir).await {
                Ok(true) => stats.downloaded += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(legislature = leg, sitting, error = %e, "sitting download failed");
                    stats.errors += 1;
                }
            }

            self.http.polite_delay().await;
        }

        info!(
            legislature = leg,
            downloaded = stats.downloaded,
            errors = stats.errors,
            "legislature scan complete"
        );
        Ok(stats)
    }

    /// Download one sitting PDF and write its sidecar.
    ///
    /// Returns `Ok(false)` when the file was already present or the sitting
    /// was seen through another legislature.
    async fn download_sitting(
        &mut self,
        leg: &str,
        sitting: u32,
        date: Option<NaiveDate>,
        out_dir: &Path,
    ) -> Result<bool> {
        let key = (leg.to_string(), sitting);
        if self.processed.contains(&key) {
            return Ok(false);
        }

        let filename = match date {
            Some(date) => format!("camera_leg{leg}_sed{sitting:04}_{date}.pdf"),
            None => format!("camera_leg{leg}_sed{sitting:04}_unknown_date.pdf"),
        };
        let year_dir = date
            .map(|d| d.format("%Y").to_string())
            .unwrap_or_else(|| "unknown_year".to_string());
        let dest = out_dir
            .join(format!("legislatura_{leg}"))
            .join(year_dir)
            .join(&filename);

        if dest.exists() {
            debug!(file = %filename, "already downloaded");
            self.processed.insert(key);
            return Ok(false);
        }

        info!(file = %filename, "downloading sitting");
        self.http
            .download_to_file(&self.pdf_url(leg, sitting), &dest, Some("application/pdf"))
            .await?;

        let mut fields = Map::new();
        fields.insert("legislatura".into(), Value::String(leg.to_string()));
        fields.insert("seduta".into(), Value::Number(sitting.into()));
        fields.insert("source".into(), Value::String("camera".into()));
        fields.insert(
            "document_type".into(),
            Value::String("stenographic_report".into()),
        );
        fields.insert(
            "institution".into(),
            Value::String("camera_deputati".into()),
        );
        fields.insert("language".into(), Value::String("it".into()));
        write_sidecar(&dest, fields, date)?;

        self.processed.insert(key);
        Ok(true)
    }
}
