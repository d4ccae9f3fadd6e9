//! Senate stenographic report scraper
//!
//! The Senate publishes a chronological listing page per year with direct
//! links to the sitting PDFs. Past legislatures live under a
//! `/legislature/{n}/` prefix, the current one at the site root, so both
//! listing URLs are tried for every year.

use std::collections::HashSet;
use std::path::Path;

use chrono::{Datelike, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::http::HttpClient;
use crate::scrape::{dates, write_sidecar, ScrapeStats};

/// Default site root
const BASE_URL: &str = "https://www.senato.it";

/// Years probed backward when no start date is given
const MAX_BACKWARD_YEARS: i32 = 10;

/// Consecutive empty years that end a backward search
const MAX_CONSECUTIVE_EMPTY_YEARS: u32 = 2;

/// How far back/forward the legislature coverage search walks
const BACKWARD_LEGISLATURE_SPAN: i32 = 10;
const FORWARD_LEGISLATURE_SPAN: i32 = 5;

/// One PDF link found on a listing page
#[derive(Debug, Clone)]
struct SenatoDocument {
    url: String,
    filename: String,
    date: Option<NaiveDate>,
}

/// Scraper for senato.it chronological listings
pub struct SenatoScraper {
    http: HttpClient,
    base_url: String,
    processed: HashSet<String>,
}

impl SenatoScraper {
    /// Create a scraper against the production site
    pub fn new(http: HttpClient) -> Self {
        Self::with_base_url(http, BASE_URL)
    }

    /// Create a scraper against an explicit site root (tests)
    pub fn with_base_url(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            processed: HashSet::new(),
        }
    }

    /// Listing URL of one legislature's year
    fn legislature_listing_url(&self, legislature: &str, year: i32) -> String {
        format!(
            "{}/legislature/{}/lavori/assemblea/resoconti-elenco-cronologico?year={}",
            self.base_url, legislature, year
        )
    }

    /// Listing URL of the current legislature, which lives at the site root
    fn current_listing_url(&self, year: i32) -> String {
        format!(
            "{}/lavori/assemblea/resoconti-elenco-cronologico?year={}",
            self.base_url, year
        )
    }

    /// Listing URL candidates for one year, past-legislature form first
    fn listing_urls(&self, legislature: &str, year: i32) -> [String; 2] {
        [
            self.legislature_listing_url(legislature, year),
            self.current_listing_url(year),
        ]
    }

    /// Harvest every sitting report in `[from, to]` for one legislature
    pub async fn run(
        &mut self,
        legislature: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        out_dir: &Path,
    ) -> Result<ScrapeStats> {
        let end = to.unwrap_or_else(|| Utc::now().date_naive());
        info!(
            legislature,
            from = %from.map(|d| d.to_string()).unwrap_or_else(|| "beginning".into()),
            to = %end,
            "starting Senate harvest"
        );

        let mut stats = ScrapeStats::default();

        match from {
            Some(from) => {
                let legislatures = self
                    .legislatures_for_range(legislature, from.year(), end.year())
                    .await?;
                if legislatures.is_empty() {
                    warn!("no legislature listing covers the requested range");
                    return Ok(stats);
                }
                for leg in &legislatures {
                    for year in from.year()..=end.year() {
                        let (year_stats, _) = self
                            .scan_year(leg, year, Some(from), Some(end), out_dir)
                            .await?;
                        stats.merge(year_stats);
                    }
                }
            }
            None => {
                // No lower bound: walk backward until the listings dry up
                let mut empty_years = 0u32;
                for year in (end.year() - MAX_BACKWARD_YEARS..=end.year()).rev() {
                    let (year_stats, found_any) = self
                        .scan_year(legislature, year, None, Some(end), out_dir)
                        .await?;
                    stats.merge(year_stats);

                    if found_any {
                        empty_years = 0;
                    } else {
                        empty_years += 1;
                        if empty_years >= MAX_CONSECUTIVE_EMPTY_YEARS {
                            debug!(year, "no more listings, stopping backward search");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            errors = stats.errors,
            "Senate harvest complete"
        );
        Ok(stats)
    }

    /// Find the legislatures whose listings cover `[year_start, year_end]`.
    ///
    /// The starting legislature is tested year by year; years it does not
    /// serve are looked for under earlier legislatures, then later ones.
    async fn legislatures_for_range(
        &mut self,
        start_legislature: &str,
        year_start: i32,
        year_end: i32,
    ) -> Result<Vec<String>> {
        let start_num: i32 = start_legislature
            .parse()
            .map_err(|_| IngestError::scrape("legislature must be numeric"))?;

        let years: Vec<i32> = (year_start..=year_end).collect();
        let mut found: Vec<String> = Vec::new();
        let mut uncovered = years.clone();

        let covered_by_start = self.probe_years(start_legislature, &years).await?;
        if !covered_by_start.is_empty() {
            found.push(start_legislature.to_string());
            uncovered.retain(|y| !covered_by_start.contains(y));
        }

        // Years before the starting legislature live under earlier ones
        let mut missing_before: Vec<i32> = match covered_by_start.iter().min() {
            Some(&first_year) => uncovered.iter().copied().filter(|y| *y < first_year).collect(),
            None => uncovered.clone(),
        };
        if !missing_before.is_empty() {
            for num in ((start_num - BACKWARD_LEGISLATURE_SPAN).max(1)..start_num).rev() {
                let leg = num.to_string();
                let covered = self.probe_years(&leg, &missing_before).await?;
                if covered.is_empty() {
                    continue;
                }
                found.push(leg);
                missing_before.retain(|y| !covered.contains(y));
                uncovered.retain(|y| !covered.contains(y));
                if missing_before.is_empty() {
                    break;
                }
            }
        }

        // Whatever is still missing can only sit under later legislatures
        if !uncovered.is_empty() {
            for num in (start_num + 1)..(start_num + FORWARD_LEGISLATURE_SPAN) {
                let leg = num.to_string();
                let covered = self.probe_years(&leg, &uncovered).await?;
                if covered.is_empty() {
                    continue;
                }
                found.push(leg);
                uncovered.retain(|y| !covered.contains(y));
                if uncovered.is_empty() {
                    break;
                }
            }
            if !uncovered.is_empty() {
                warn!(years = ?uncovered, "no legislature listing covers these years");
            }
        }

        found.sort_by_key(|l| l.parse::<i32>().unwrap_or(0));
        found.dedup();
        info!(legislatures = ?found, "legislatures to process");
        Ok(found)
    }

    /// Which of `years` one legislature's own listing serves.
    ///
    /// Only the per-legislature URL counts here; the no-legislature listing
    /// answers for the current legislature whatever is probed and would
    /// credit every candidate with the current year. The current year itself
    /// is probed through it, since the sitting legislature has no archive URL
    /// yet.
    async fn probe_years(&mut self, legislature: &str, years: &[i32]) -> Result<Vec<i32>> {
        let current_year = Utc::now().date_naive().year();
        let mut covered = Vec::new();

        for &year in years {
            let url = if year == current_year {
                self.current_listing_url(year)
            } else {
                self.legislature_listing_url(legislature, year)
            };
            match self.http.get_text(&url).await {
                Ok(Some(body)) => {
                    if !parse_listing(&body, &url)?.is_empty() {
                        covered.push(year);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(legislature, year, error = %e, "listing probe failed"),
            }
            self.http.polite_delay().await;
        }

        if !covered.is_empty() {
            debug!(legislature, years = ?covered, "listing covers years");
        }
        Ok(covered)
    }

    /// Scan one year's listing; also reports whether the listing had links
    async fn scan_year(
        &mut self,
        legislature: &str,
        year: i32,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        out_dir: &Path,
    ) -> Result<(ScrapeStats, bool)> {
        let mut documents = Vec::new();
        for url in self.listing_urls(legislature, year) {
            match self.http.get_text(&url).await {
                Ok(Some(body)) => {
                    documents = parse_listing(&body, &url)?;
                    if !documents.is_empty() {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(year, error = %e, "listing fetch failed");
                    continue;
                }
            }
            self.http.polite_delay().await;
        }

        if documents.is_empty() {
            debug!(legislature, year, "no documents listed");
            return Ok((ScrapeStats::default(), false));
        }

        info!(legislature, year, count = documents.len(), "listing parsed");
        let mut stats = ScrapeStats::default();

        for doc in documents {
            if let Some(date) = doc.date {
                if from.map_or(false, |f| date < f) || to.map_or(false, |t| date > t) {
                    stats.skipped += 1;
                    continue;
                }
            }

            match self.download_document(legislature, year, &doc, out_dir).await {
                Ok(true) => stats.downloaded += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(file = %doc.filename, error = %e, "document download failed");
                    stats.errors += 1;
                }
            }

            self.http.polite_delay().await;
        }

        Ok((stats, true))
    }

    /// Download one report and write its sidecar.
    ///
    /// Returns `Ok(false)` when the file already exists locally.
    async fn download_document(
        &mut self,
        legislature: &str,
        year: i32,
        doc: &SenatoDocument,
        out_dir: &Path,
    ) -> Result<bool> {
        if self.processed.contains(&doc.url) {
            return Ok(false);
        }

        let dest = out_dir
            .join(format!("legislatura_{legislature}"))
            .join(year.to_string())
            .join(&doc.filename);

        if dest.exists() {
            debug!(file = %doc.filename, "already downloaded");
            self.processed.insert(doc.url.clone());
            return Ok(false);
        }

        info!(file = %doc.filename, "downloading report");
        self.http
            .download_to_file(&doc.url, &dest, Some("application/pdf"))
            .await?;

        let mut fields = Map::new();
        fields.insert(
            "legislatura".into(),
            Value::String(legislature.to_string()),
        );
        fields.insert("year".into(), Value::Number(year.into()));
        fields.insert("source".into(), Value::String("senato".into()));
        fields.insert(
            "document_type".into(),
            Value::String("stenographic_report".into()),
        );
        fields.insert(
            "institution".into(),
            Value::String("senato_repubblica".into()),
        );
        fields.insert("language".into(), Value::String("it".into()));
        fields.insert("source_url".into(), Value::String(doc.url.clone()));
        write_sidecar(&dest, fields, doc.date)?;

        self.processed.insert(doc.url.clone());
        Ok(true)
    }
}

/// Extract PDF links and their dates from a listing page
fn parse_listing(html: &str, page_url: &str) -> Result<Vec<SenatoDocument>> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(r#"a[href$=".pdf"]"#)
        .map_err(|e| IngestError::scrape(format!("bad selector: {e}")))?;
    let base = url::Url::parse(page_url)?;

    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        let url = resolved.to_string();
        if !seen.insert(url.clone()) {
            continue;
        }

        let filename = resolved
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|name| !name.is_empty())
            .unwrap_or("documento.pdf")
            .to_string();

        // The date usually sits in the row around the link, sometimes only
        // in the filename itself.
        let date = dates::extract_date(&surrounding_text(anchor))
            .or_else(|| dates::date_from_filename(&filename));

        out.push(SenatoDocument {
            url,
            filename,
            date,
        });
    }

    Ok(out)
}

/// Text of the anchor plus two levels of enclosing elements
fn surrounding_text(anchor: ElementRef<'_>) -> String {
    let mut text: String = anchor.text().collect();
    let mut node = anchor.parent();
    for _ in 0..2 {
        let Some(current) = node else { break };
        if let Some(element) = ElementRef::wrap(current) {
            text.push(' ');
            text.extend(element.text());
        }
        node = current.parent();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RetryPolicy;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_http() -> HttpClient {
        HttpClient::new(
            5,
            RetryPolicy {
                max_attempts: 1,
                backoff_base: 0.0,
                request_delay: 0.0,
                jitter: 0.0,
            },
        )
        .unwrap()
    }

    const LISTING: &str = r#"
        <html><body>
          <table>
            <tr><td>Seduta n. 101 del 15 marzo 2024</td>
                <td><a href="/doc/leg19/sed101.pdf">Resoconto</a></td></tr>
            <tr><td>Seduta n. 102 del 16 marzo 2024</td>
                <td><a href="/doc/leg19/sed102.pdf">Resoconto</a></td></tr>
            <tr><td>Indice</td><td><a href="/doc/indice.html">HTML</a></td></tr>
          </table>
        </body></html>
    "#;

    #[test]
    fn listing_parse_finds_pdf_links_and_dates() {
        let docs = parse_listing(LISTING, "https://www.senato.it/listing?year=2024").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].url, "https://www.senato.it/doc/leg19/sed101.pdf");
        assert_eq!(docs[0].filename, "sed101.pdf");
        assert_eq!(docs[0].date, NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(docs[1].date, NaiveDate::from_ymd_opt(2024, 3, 16));
    }

    #[test]
    fn listing_parse_falls_back_to_filename_date() {
        let html = r#"<a href="/doc/resoconto_2023-05-20.pdf">scarica</a>"#;
        let docs = parse_listing(html, "https://www.senato.it/").unwrap();
        assert_eq!(docs[0].date, NaiveDate::from_ymd_opt(2023, 5, 20));
    }

    #[test]
    fn listing_parse_deduplicates_links() {
        let html = r#"
            <a href="/doc/sed1.pdf">prima</a>
            <a href="/doc/sed1.pdf">ancora</a>
        "#;
        let docs = parse_listing(html, "https://www.senato.it/").unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn downloads_listed_reports_in_range() {
        let server = MockServer::start().await;

        let listing = format!(
            r#"<table><tr><td>Seduta del 15 marzo 2024</td>
               <td><a href="{0}/doc/sed101.pdf">pdf</a></td></tr>
               <tr><td>Seduta del 10 gennaio 2023</td>
               <td><a href="{0}/doc/old.pdf">pdf</a></td></tr></table>"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path(
                "/legislature/19/lavori/assemblea/resoconti-elenco-cronologico",
            ))
            .and(query_param("year", "2024"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/doc/sed101.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(b"%PDF-1.4".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut scraper = SenatoScraper::with_base_url(quick_http(), &server.uri());
        let (stats, found) = scraper
            .scan_year(
                "19",
                2024,
                NaiveDate::from_ymd_opt(2024, 1, 1),
                NaiveDate::from_ymd_opt(2024, 12, 31),
                dir.path(),
            )
            .await
            .unwrap();

        assert!(found);
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.skipped, 1);

        let pdf = dir
            .path()
            .join("legislatura_19")
            .join("2024")
            .join("sed101.pdf");
        assert!(pdf.exists());

        let sidecar: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(pdf.with_extension("json")).unwrap())
                .unwrap();
        assert_eq!(sidecar["source"], "senato");
        assert_eq!(sidecar["date"], "2024-03-15");
        assert_eq!(sidecar["institution"], "senato_repubblica");
    }

    #[tokio::test]
    async fn falls_back_to_current_legislature_listing() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(
                "/legislature/19/lavori/assemblea/resoconti-elenco-cronologico",
            ))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let listing = format!(
            r#"<a href="{}/doc/sed1.pdf">Seduta del 5 giugno 2025</a>"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/lavori/assemblea/resoconti-elenco-cronologico"))
            .and(query_param("year", "2025"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/doc/sed1.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(b"%PDF-1.4".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut scraper = SenatoScraper::with_base_url(quick_http(), &server.uri());
        let (stats, found) = scraper
            .scan_year("19", 2025, None, None, dir.path())
            .await
            .unwrap();

        assert!(found);
        assert_eq!(stats.downloaded, 1);
    }

    async fn mount_listing(server: &MockServer, leg: &str, year: i32, pdf_name: &str, date_text: &str) {
        let listing = format!(
            r#"<a href="{}/doc/{pdf_name}">Seduta del {date_text}</a>"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path(format!(
                "/legislature/{leg}/lavori/assemblea/resoconti-elenco-cronologico"
            )))
            .and(query_param("year", year.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/doc/{pdf_name}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(b"%PDF-1.4".to_vec()),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn previous_legislature_covers_missing_years() {
        let server = MockServer::start().await;
        // Legislature 19 has no 2022 listing; 18 serves it
        mount_listing(&server, "18", 2022, "sed44.pdf", "15 marzo 2022").await;

        let dir = tempfile::tempdir().unwrap();
        let mut scraper = SenatoScraper::with_base_url(quick_http(), &server.uri());
        let stats = scraper
            .run(
                "19",
                NaiveDate::from_ymd_opt(2022, 1, 1),
                NaiveDate::from_ymd_opt(2022, 12, 31),
                dir.path(),
            )
            .await
            .unwrap();

        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.errors, 0);
        assert!(dir
            .path()
            .join("legislatura_18")
            .join("2022")
            .join("sed44.pdf")
            .exists());
    }

    #[tokio::test]
    async fn coverage_walk_spans_neighboring_legislatures() {
        let server = MockServer::start().await;
        mount_listing(&server, "17", 2020, "sed17.pdf", "5 giugno 2020").await;
        mount_listing(&server, "18", 2021, "sed18.pdf", "10 maggio 2021").await;
        mount_listing(&server, "19", 2022, "sed19.pdf", "13 ottobre 2022").await;

        let dir = tempfile::tempdir().unwrap();
        let mut scraper = SenatoScraper::with_base_url(quick_http(), &server.uri());
        let stats = scraper
            .run(
                "18",
                NaiveDate::from_ymd_opt(2020, 1, 1),
                NaiveDate::from_ymd_opt(2022, 12, 31),
                dir.path(),
            )
            .await
            .unwrap();

        assert_eq!(stats.downloaded, 3);
        assert_eq!(stats.errors, 0);
        assert!(dir.path().join("legislatura_17").join("2020").join("sed17.pdf").exists());
        assert!(dir.path().join("legislatura_18").join("2021").join("sed18.pdf").exists());
        assert!(dir.path().join("legislatura_19").join("2022").join("sed19.pdf").exists());
    }
}
