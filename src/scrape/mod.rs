//! Source scrapers and their shared plumbing

pub mod camera;
pub mod dates;
pub mod drive;
pub mod senato;
pub mod youtube;

pub use camera::CameraScraper;
pub use drive::DriveScraper;
pub use senato::SenatoScraper;
pub use youtube::YoutubeScraper;

use std::path::Path;

use chrono::{NaiveDate, Utc};
use serde_json::{Map, Value};

use crate::error::Result;

/// Totals reported by a scraper run
#[derive(Debug, Default, Clone, Copy)]
pub struct ScrapeStats {
    /// Documents written to disk
    pub downloaded: usize,
    /// Documents skipped (already present or filtered)
    pub skipped: usize,
    /// Failed documents
    pub errors: usize,
}

impl ScrapeStats {
    /// Merge totals from another run
    pub fn merge(&mut self, other: ScrapeStats) {
        self.downloaded += other.downloaded;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }

    /// Whether the run finished without failures
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

/// Write a JSON metadata sidecar next to a downloaded document.
///
/// The sidecar carries the fields the uploader later merges into the ingest
/// manifest; `date` is the field incremental runs resume from.
pub fn write_sidecar(
    document_path: &Path,
    mut fields: Map<String, Value>,
    date: Option<NaiveDate>,
) -> Result<()> {
    if let Some(date) = date {
        fields.insert("date".into(), Value::String(date.to_string()));
    }
    fields.insert(
        "created_at".into(),
        Value::String(Utc::now().to_rfc3339()),
    );

    let sidecar_path = document_path.with_extension("json");
    let content = serde_json::to_string_pretty(&Value::Object(fields))?;
    std::fs::write(sidecar_path, content)?;
    Ok(())
}

/// Reduce free text to a filesystem-safe fragment
pub fn sanitize_fragment(text: &str, max_len: usize) -> String {
    let first_line = text.trim().lines().next().unwrap_or("");
    let truncated: String = first_line.chars().take(max_len).collect();

    let cleaned: String = truncated
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect();

    let joined = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .trim_matches('_')
        .to_string();

    if joined.is_empty() {
        "doc".to_string()
    } else {
        joined
    }
}
