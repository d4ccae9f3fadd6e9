//! Error types for parlingest

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for parlingest operations
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Google API error: {0}")]
    GoogleApi(String),

    #[error("API quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("GCS error: {0}")]
    Gcs(String),

    #[error("Scrape error: {0}")]
    Scrape(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Rename error: {0}")]
    Rename(String),

    #[error("Text extraction failed: {0}")]
    Extraction(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for parlingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Create a new scrape error
    pub fn scrape(msg: impl Into<String>) -> Self {
        Self::Scrape(msg.into())
    }

    /// Create a new GCS error
    pub fn gcs(msg: impl Into<String>) -> Self {
        Self::Gcs(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a file not found error
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }
}
