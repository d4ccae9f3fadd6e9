//! Shared HTTP plumbing for the scrapers
//!
//! All scrape traffic goes through [`HttpClient`]: a single reqwest client
//! with a browser user agent, retry with exponential backoff, randomized
//! politeness delays, and atomic streaming downloads.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use reqwest::{Client, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

/// User agent presented to the scraped sites
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/123.0 Safari/537.36";

/// Retry and politeness settings for a client
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per request
    pub max_attempts: u32,
    /// Base for exponential backoff between attempts, in seconds
    pub backoff_base: f64,
    /// Delay between successive requests, in seconds
    pub request_delay: f64,
    /// Upper bound of the random jitter added to delays, in seconds
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            request_delay: 0.5,
            jitter: 0.2,
        }
    }
}

/// HTTP client shared by the scrapers
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl HttpClient {
    /// Create a client with the given timeout and retry policy
    pub fn new(timeout_secs: u64, policy: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, policy })
    }

    /// Access the underlying reqwest client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Sleep for the politeness delay plus random jitter
    pub async fn polite_delay(&self) {
        self.sleep_with_jitter(self.policy.request_delay).await;
    }

    /// Sleep for `base` seconds plus random jitter
    pub async fn sleep_with_jitter(&self, base: f64) {
        let jitter = rand::thread_rng().gen_range(0.0..=self.policy.jitter);
        tokio::time::sleep(Duration::from_secs_f64(base + jitter)).await;
    }

    /// HEAD a URL and report whether it answers 200
    pub async fn head_ok(&self, url: &str) -> Result<bool> {
        match self.client.head(url).send().await {
            Ok(resp) => Ok(resp.status() == StatusCode::OK),
            Err(e) if e.is_timeout() || e.is_connect() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// GET a page body as text; 404 maps to `Ok(None)`
    pub async fn get_text(&self, url: &str) -> Result<Option<String>> {
        let resp = self.client.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.text().await?))
    }

    /// Download a URL to `dest`, streaming through a `.part` sibling that is
    /// atomically renamed on completion.
    ///
    /// When `expect_content_type` is set, the response content type must
    /// contain it or the download is rejected. Retries with exponential
    /// backoff on network failures.
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        expect_content_type: Option<&str>,
    ) -> Result<()> {
        let part = dest.with_extension("part");
        let mut last_err = None;

        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                let wait = self.policy.backoff_base.powi(attempt as i32 - 1);
                warn!(url, attempt, "retrying download in {wait:.0}s");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }

            match self.try_download(url, dest, &part, expect_content_type).await {
                Ok(()) => return Ok(()),
                Err(IngestError::Scrape(msg)) => {
                    // Wrong content type is not transient
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(IngestError::Scrape(msg));
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            IngestError::Network(format!("download failed after retries: {url}"))
        }))
    }

    async fn try_download(
        &self,
        url: &str,
        dest: &Path,
        part: &Path,
        expect_content_type: Option<&str>,
    ) -> Result<()> {
        let resp = self.client.get(url).send().await?.error_for_status()?;

        if let Some(expected) = expect_content_type {
            let content_type = content_type_of(&resp);
            if !content_type.contains(expected) {
                return Err(IngestError::scrape(format!(
                    "unexpected content type '{content_type}' for {url}"
                )));
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(part).await?;
        let mut resp = resp;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(part, dest).await?;
        debug!(url, dest = %dest.display(), "download complete");
        Ok(())
    }
}

fn content_type_of(resp: &Response) -> String {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}
