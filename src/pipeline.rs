//! End-to-end orchestrator
//!
//! Runs download, upload, and rename per configured source. Runs are
//! incremental: the start date comes from the newest `date` in the source's
//! GCS manifest, falling back to the `--from` flag on a first run.

use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use tracing::{info, warn};

use crate::config::{Config, SourceConfig, SourceKind};
use crate::error::{IngestError, Result};
use crate::gcs::{GcsClient, ServiceAccountKey, TokenSource, TokenProvider, SCOPE_CLOUD_PLATFORM};
use crate::http::{HttpClient, RetryPolicy};
use crate::rename::Renamer;
use crate::scrape::{CameraScraper, DriveScraper, SenatoScraper, YoutubeScraper};
use crate::upload::Uploader;

/// Manifest object consulted for incremental resume
const MANIFEST_NAME: &str = "ingest/metadata.jsonl";

/// Which phases a run executes
#[derive(Debug, Clone, Copy)]
pub struct PhaseSelection {
    /// Scrape the source into the local directory
    pub download: bool,
    /// Upload the local directory and rewrite the manifest
    pub upload: bool,
    /// Rename the uploaded objects with the model
    pub rename: bool,
    /// Empty the GCS prefix before uploading
    pub refresh_gcs: bool,
}

impl Default for PhaseSelection {
    fn default() -> Self {
        Self {
            download: true,
            upload: true,
            rename: true,
            refresh_gcs: false,
        }
    }
}

/// Orchestrates the full ingest run
pub struct Pipeline {
    config: Config,
    http: HttpClient,
    out_root: PathBuf,
}

impl Pipeline {
    /// Build a pipeline from the configuration, downloading under `out_root`
    pub fn new(config: Config, out_root: &Path) -> Result<Self> {
        let http = HttpClient::new(
            config.network.timeout,
            RetryPolicy {
                max_attempts: config.network.max_attempts,
                backoff_base: config.network.backoff_base,
                request_delay: config.network.request_delay,
                jitter: config.network.jitter,
            },
        )?;
        Ok(Self {
            config,
            http,
            out_root: out_root.to_path_buf(),
        })
    }

    fn gcs_client(&self) -> Result<GcsClient> {
        let key = ServiceAccountKey::from_file(&self.config.auth.credentials_file)?;
        GcsClient::new(key)
    }

    /// Run the selected phases for every enabled source.
    ///
    /// A failing source aborts the run so a partial harvest is never
    /// silently promoted to GCS.
    pub async fn run(
        &self,
        only_source: Option<&str>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        phases: PhaseSelection,
    ) -> Result<()> {
        let sources = self.config.enabled_sources(only_source);
        if sources.is_empty() {
            return Err(IngestError::config(match only_source {
                Some(name) => format!("no enabled source named '{name}'"),
                None => "no enabled sources in the configuration".to_string(),
            }));
        }

        for source in sources {
            info!(source = %source.name, "processing source");
            self.run_source(source, from, to, phases).await?;
        }
        info!("pipeline run complete");
        Ok(())
    }

    async fn run_source(
        &self,
        source: &SourceConfig,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        phases: PhaseSelection,
    ) -> Result<()> {
        let local_dir = self.out_root.join(&source.local_subdir);

        if phases.download {
            let start = match self.resume_date(source).await? {
                Some(resumed) => {
                    info!(source = %source.name, from = %resumed, "resuming after last uploaded date");
                    Some(resumed)
                }
                None => from,
            };
            self.download_phase(source, start, to, &local_dir).await?;
        }

        if phases.upload {
            let uploader = Uploader::new(self.gcs_client()?, &source.bucket, &source.gcs_prefix);
            uploader
                .upload_directory(&local_dir, &source.file_patterns, phases.refresh_gcs)
                .await?;
        }

        if phases.rename {
            let key = ServiceAccountKey::from_file(&self.config.auth.credentials_file)?;
            let tokens =
                TokenSource::ServiceAccount(TokenProvider::new(key, SCOPE_CLOUD_PLATFORM));
            let renamer = Renamer::new(self.gcs_client()?, tokens, self.config.rename.clone());
            renamer.run(&source.bucket, &source.gcs_prefix).await?;
        }

        Ok(())
    }

    async fn download_phase(
        &self,
        source: &SourceConfig,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        local_dir: &Path,
    ) -> Result<()> {
        let stats = match &source.kind {
            SourceKind::Camera { legislature } => {
                let mut scraper = CameraScraper::new(self.http.clone());
                scraper.run(legislature, from, to, local_dir).await?
            }
            SourceKind::Senato { legislature } => {
                let mut scraper = SenatoScraper::new(self.http.clone());
                scraper.run(legislature, from, to, local_dir).await?
            }
            SourceKind::Youtube {
                channels,
                api_key_env,
            } => {
                let api_key = std::env::var(api_key_env).map_err(|_| {
                    IngestError::config(format!(
                        "source '{}' needs the {} environment variable",
                        source.name, api_key_env
                    ))
                })?;
                let scraper = YoutubeScraper::new(self.http.clone(), api_key);
                scraper.run(channels, from, to, local_dir).await?
            }
            SourceKind::Drive {
                folder_id,
                max_depth,
            } => {
                let key = ServiceAccountKey::from_file(&self.config.auth.credentials_file)?;
                let scraper = DriveScraper::new(self.http.clone(), key);
                scraper
                    .run(folder_id, *max_depth as u32, from, local_dir)
                    .await?
            }
        };

        if !stats.is_clean() {
            warn!(
                source = %source.name,
                errors = stats.errors,
                "download phase finished with errors"
            );
        }
        Ok(())
    }

    /// Day after the newest manifest date, or `None` on a first run
    async fn resume_date(&self, source: &SourceConfig) -> Result<Option<NaiveDate>> {
        let gcs = self.gcs_client()?;
        let latest = latest_manifest_date(&gcs, &source.bucket, &source.gcs_prefix).await?;
        Ok(latest.map(|d| d + Duration::days(1)))
    }
}

/// Newest `date` field across the manifest's records.
///
/// Malformed lines and records without a date are skipped; a missing
/// manifest means a first run.
pub async fn latest_manifest_date(
    gcs: &GcsClient,
    bucket: &str,
    prefix: &str,
) -> Result<Option<NaiveDate>> {
    let prefix = prefix.trim_matches('/');
    let object = if prefix.is_empty() {
        MANIFEST_NAME.to_string()
    } else {
        format!("{prefix}/{MANIFEST_NAME}")
    };

    let Some(content) = gcs.download_text(bucket, &object).await? else {
        return Ok(None);
    };

    let mut latest: Option<NaiveDate> = None;
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let Some(date) = record
            .get("date")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if latest.map_or(true, |cur| date > cur) {
            latest = Some(date);
        }
    }
    Ok(latest)
}
