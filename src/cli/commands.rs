//! Command execution handlers

use std::path::Path;

use console::style;

use crate::config::{Config, SourceKind};
use crate::error::{IngestError, Result};
use crate::gcs::{GcsClient, ServiceAccountKey, TokenProvider, TokenSource, SCOPE_CLOUD_PLATFORM};
use crate::http::{HttpClient, RetryPolicy};
use crate::pipeline::{Pipeline, PhaseSelection};
use crate::rename::Renamer;
use crate::scrape::{CameraScraper, DriveScraper, ScrapeStats, SenatoScraper, YoutubeScraper};
use crate::upload::Uploader;

/// Load the config file, or fall back to defaults when the default
/// location has none. An explicit `--config` path must exist.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => Config::load(Some(p)),
        None => match Config::load(None) {
            Ok(config) => Ok(config),
            Err(IngestError::FileNotFound { .. }) => Ok(Config::default()),
            Err(e) => Err(e),
        },
    }
}

fn http_client(config: &Config) -> Result<HttpClient> {
    HttpClient::new(
        config.network.timeout,
        RetryPolicy {
            max_attempts: config.network.max_attempts,
            backoff_base: config.network.backoff_base,
            request_delay: config.network.request_delay,
            jitter: config.network.jitter,
        },
    )
}

fn print_stats(label: &str, stats: &ScrapeStats) {
    let status = if stats.is_clean() {
        style("done").green().bold()
    } else {
        style("done with errors").yellow().bold()
    };
    println!(
        "{label} {status}: {} downloaded, {} skipped, {} errors",
        stats.downloaded, stats.skipped, stats.errors
    );
}

/// Split a `gs://bucket/prefix` URI
fn parse_gs_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("gs://")
        .ok_or_else(|| IngestError::config(format!("'{uri}' is not a gs:// URI")))?;
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(IngestError::config(format!("'{uri}' has no bucket")));
    }
    Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

/// Execute the run command
pub async fn execute_run(args: &super::RunArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let pipeline = Pipeline::new(config, &args.out)?;
    let phases = PhaseSelection {
        download: !args.skip_download,
        upload: !args.skip_upload,
        rename: !args.skip_rename,
        refresh_gcs: args.refresh_gcs,
    };
    pipeline
        .run(args.source.as_deref(), args.from, args.to, phases)
        .await?;
    println!("{} pipeline run complete", style("OK").green().bold());
    Ok(())
}

/// Execute the camera command
pub async fn execute_camera(args: &super::CameraArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut scraper = CameraScraper::new(http_client(&config)?);
    let stats = scraper.run(&args.leg, args.from, args.to, &args.out).await?;
    print_stats("camera", &stats);
    Ok(())
}

/// Execute the senato command
pub async fn execute_senato(args: &super::SenatoArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut scraper = SenatoScraper::new(http_client(&config)?);
    let stats = scraper.run(&args.leg, args.from, args.to, &args.out).await?;
    print_stats("senato", &stats);
    Ok(())
}

/// Execute the youtube command
pub async fn execute_youtube(args: &super::YoutubeArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    // Channels and the API key env come from the first youtube source
    let source = config
        .sources
        .iter()
        .find(|s| matches!(s.kind, SourceKind::Youtube { .. }))
        .ok_or_else(|| IngestError::config("no youtube source configured"))?;
    let SourceKind::Youtube {
        channels,
        api_key_env,
    } = &source.kind
    else {
        unreachable!()
    };

    let mut channels = channels.clone();
    if let Some(only) = &args.channel {
        let Some(slug) = channels.get(only).cloned() else {
            return Err(IngestError::config(format!(
                "channel '{only}' is not configured; known: {}",
                channels.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        };
        channels.clear();
        channels.insert(only.clone(), slug);
    }

    let api_key = match &args.api_key {
        Some(key) => key.clone(),
        None => std::env::var(api_key_env).map_err(|_| {
            IngestError::config(format!(
                "pass --api-key or set the {api_key_env} environment variable"
            ))
        })?,
    };

    let scraper = YoutubeScraper::new(http_client(&config)?, api_key);
    let stats = scraper.run(&channels, args.from, args.to, &args.out).await?;
    print_stats("youtube", &stats);
    Ok(())
}

/// Execute the drive command
pub async fn execute_drive(args: &super::DriveArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;

    let folder_id = match &args.folder_id {
        Some(id) => id.clone(),
        None => config
            .sources
            .iter()
            .find_map(|s| match &s.kind {
                SourceKind::Drive { folder_id, .. } => Some(folder_id.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                IngestError::config("pass --folder-id or configure a drive source")
            })?,
    };

    let key = ServiceAccountKey::from_file(&config.auth.credentials_file)?;
    let scraper = DriveScraper::new(http_client(&config)?, key);
    let stats = scraper
        .run(&folder_id, args.max_depth, args.from, &args.out)
        .await?;
    print_stats("drive", &stats);
    Ok(())
}

/// Execute the upload command
pub async fn execute_upload(args: &super::UploadArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let key = ServiceAccountKey::from_file(&config.auth.credentials_file)?;
    let uploader = Uploader::new(GcsClient::new(key)?, &args.bucket, &args.prefix);
    let stats = uploader
        .upload_directory(&args.src, &args.patterns, args.refresh)
        .await?;
    println!(
        "{} {} files uploaded, {} manifest records",
        style("OK").green().bold(),
        stats.uploaded,
        stats.records
    );
    Ok(())
}

/// Execute the rename command
pub async fn execute_rename(args: &super::RenameArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let (bucket, prefix) = parse_gs_uri(&args.gcs_input)?;

    let mut rename_config = config.rename.clone();
    if let Some(workers) = args.workers {
        rename_config.workers = workers;
    }
    if rename_config.project_id.is_empty() {
        return Err(IngestError::config(
            "rename.project_id must be set in the configuration",
        ));
    }

    let key = ServiceAccountKey::from_file(&config.auth.credentials_file)?;
    let tokens = TokenSource::ServiceAccount(TokenProvider::new(key.clone(), SCOPE_CLOUD_PLATFORM));
    let renamer = Renamer::new(GcsClient::new(key)?, tokens, rename_config);
    let stats = renamer.run(&bucket, &prefix).await?;
    println!(
        "{} {} renamed, {} unchanged, {} skipped, {} errors",
        style("OK").green().bold(),
        stats.renamed,
        stats.unchanged,
        stats.skipped,
        stats.errors
    );
    Ok(())
}

/// Execute the config command
pub async fn execute_config(args: &super::ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    match &args.command {
        super::ConfigCommands::Show => {
            let config = load_config(config_path)?;
            let content =
                toml::to_string_pretty(&config).map_err(|e| IngestError::config(e.to_string()))?;
            println!("{content}");
        }
        super::ConfigCommands::Path => {
            println!("{}", Config::config_path()?.display());
        }
        super::ConfigCommands::Init { force } => {
            let path = Config::init(*force)?;
            println!(
                "{} configuration written to {}",
                style("OK").green().bold(),
                path.display()
            );
        }
    }
    Ok(())
}
