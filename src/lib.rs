//! Parlingest - Italian parliamentary document ingestion
//!
//! Parlingest harvests public institutional sources (Chamber and Senate
//! stenographic reports, YouTube channel transcripts, shared Google Drive
//! folders), mirrors the documents into Google Cloud Storage with JSONL
//! ingest manifests, and renames the uploaded objects into archival names
//! with Gemini Flash on Vertex AI.
//!
//! # Quick Start
//!
//! ```bash
//! # Full pipeline for every configured source
//! parlingest run --out ./downloads
//!
//! # One source, incremental from the last uploaded date
//! parlingest run --out ./downloads --source camera
//!
//! # Individual phases
//! parlingest camera --out ./downloads/camera --leg 19 --from 2024-01-01
//! parlingest upload --src ./downloads/camera --bucket documenti --prefix camera
//! parlingest rename gs://documenti/camera
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gcs;
pub mod http;
pub mod pipeline;
pub mod rename;
pub mod scrape;
pub mod upload;

// Re-export commonly used types
pub use error::{IngestError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
