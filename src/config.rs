//! Configuration management for parlingest
//!
//! The pipeline is driven by a TOML file declaring the sources to harvest
//! plus network, auth, and rename settings. The file is looked up at an
//! explicit `--config` path first, then at the platform config directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Google credential settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Network settings shared by all scrapers
    #[serde(default)]
    pub network: NetworkConfig,

    /// Settings for the GCS rename phase
    #[serde(default)]
    pub rename: RenameConfig,

    /// Sources to harvest
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Google credential settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Path to the service-account key JSON
    pub credentials_file: PathBuf,
}

/// Network settings shared by all scrapers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// HTTP timeout in seconds
    pub timeout: u64,
    /// Maximum attempts per request
    pub max_attempts: u32,
    /// Base for exponential backoff between attempts, in seconds
    pub backoff_base: f64,
    /// Politeness delay between requests, in seconds
    pub request_delay: f64,
    /// Upper bound of random jitter added to delays, in seconds
    pub jitter: f64,
}

/// Settings for the GCS rename phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameConfig {
    /// Google Cloud project hosting the Vertex AI endpoint
    pub project_id: String,
    /// Vertex AI region ("global" or a specific one for data residency)
    pub region: String,
    /// Gemini model id
    pub model: String,
    /// Concurrent rename workers
    pub workers: usize,
    /// Max PDF pages fed to the model
    pub max_pdf_pages: usize,
    /// Max characters of document context fed to the model
    pub max_chars: usize,
    /// Local CSV log of rename outcomes
    pub log_file: PathBuf,
}

/// One harvest source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source name, used for `--source` filtering
    pub name: String,
    /// Whether the orchestrator runs this source
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Subdirectory of the local output root for this source
    pub local_subdir: String,
    /// Destination GCS bucket
    pub bucket: String,
    /// Destination GCS prefix
    #[serde(default)]
    pub gcs_prefix: String,
    /// Glob patterns selecting files to upload
    #[serde(default = "default_patterns")]
    pub file_patterns: Vec<String>,
    /// Kind-specific parameters
    pub kind: SourceKind,
}

/// Kind-specific source parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// Chamber of Deputies stenographic reports
    Camera {
        /// Starting legislature; others are discovered as needed
        legislature: String,
    },
    /// Senate sitting reports
    Senato {
        /// Starting legislature; others are discovered as needed
        legislature: String,
    },
    /// YouTube channel transcripts and metadata
    Youtube {
        /// Channel id -> directory slug
        channels: BTreeMap<String, String>,
        /// Environment variable holding the Data API key
        #[serde(default = "default_api_key_env")]
        api_key_env: String,
    },
    /// Google Drive folder tree
    Drive {
        /// Root folder id
        folder_id: String,
        /// Maximum folder recursion depth
        #[serde(default = "default_drive_depth")]
        max_depth: usize,
    },
}

fn default_true() -> bool {
    true
}

fn default_patterns() -> Vec<String> {
    vec!["*.pdf".into(), "*.json".into()]
}

fn default_api_key_env() -> String {
    "YOUTUBE_API_KEY".into()
}

fn default_drive_depth() -> usize {
    2
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: PathBuf::from("GOOGLE_CREDENTIALS.json"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout: 30,
            max_attempts: 3,
            backoff_base: 2.0,
            request_delay: 0.5,
            jitter: 0.2,
        }
    }
}

impl Default for RenameConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            region: "global".to_string(),
            model: "gemini-2.0-flash-lite-001".to_string(),
            workers: 16,
            max_pdf_pages: 3,
            max_chars: 4000,
            log_file: PathBuf::from("rename_gcs_log.csv"),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| IngestError::config("Could not find config directory"))?;
        Ok(config_dir.join("parlingest").join("config.toml"))
    }

    /// Load configuration from an explicit path or the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            return Err(IngestError::file_not_found(path));
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the given path
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| IngestError::config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Write a starter configuration to the default location
    pub fn init(force: bool) -> Result<PathBuf> {
        let path = Self::config_path()?;
        if path.exists() && !force {
            return Err(IngestError::config(
                "Configuration file already exists. Use --force to overwrite.",
            ));
        }
        Self::default().save(&path)?;
        Ok(path)
    }

    /// Sources enabled for an orchestrator run, optionally filtered by name
    pub fn enabled_sources(&self, only: Option<&str>) -> Vec<&SourceConfig> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| only.map_or(true, |name| s.name == name))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(&source.name) {
                return Err(IngestError::config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
            if source.bucket.is_empty() {
                return Err(IngestError::config(format!(
                    "source '{}' has no bucket",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [auth]
        credentials_file = "creds.json"

        [rename]
        project_id = "my-project"
        region = "global"
        model = "gemini-2.0-flash-lite-001"
        workers = 8
        max_pdf_pages = 3
        max_chars = 4000
        log_file = "rename.csv"

        [[sources]]
        name = "camera"
        local_subdir = "camera"
        bucket = "documenti"
        gcs_prefix = "camera"

        [sources.kind]
        type = "camera"
        legislature = "19"

        [[sources]]
        name = "youtube"
        enabled = false
        local_subdir = "youtube"
        bucket = "documenti"
        gcs_prefix = "youtube"
        file_patterns = ["*.txt", "*.json"]

        [sources.kind]
        type = "youtube"
        [sources.kind.channels]
        "UC123" = "somechannel"
    "#;

    #[test]
    fn parses_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.rename.workers, 8);

        match &config.sources[0].kind {
            SourceKind::Camera { legislature } => assert_eq!(legislature, "19"),
            other => panic!("unexpected kind: {other:?}"),
        }
        assert!(config.sources[0].enabled);
        assert_eq!(config.sources[0].file_patterns, vec!["*.pdf", "*.json"]);

        match &config.sources[1].kind {
            SourceKind::Youtube { channels, api_key_env } => {
                assert_eq!(channels.get("UC123").unwrap(), "somechannel");
                assert_eq!(api_key_env, "YOUTUBE_API_KEY");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert!(!config.sources[1].enabled);
    }

    #[test]
    fn enabled_sources_filters_by_name() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.enabled_sources(None).len(), 1);
        assert_eq!(config.enabled_sources(Some("camera")).len(), 1);
        assert!(config.enabled_sources(Some("youtube")).is_empty());
        assert!(config.enabled_sources(Some("nope")).is_empty());
    }

    #[test]
    fn duplicate_source_names_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        let dup = config.sources[0].clone();
        config.sources.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn network_defaults() {
        let config = Config::default();
        assert_eq!(config.network.timeout, 30);
        assert_eq!(config.network.max_attempts, 3);
        assert_eq!(config.rename.model, "gemini-2.0-flash-lite-001");
    }
}
