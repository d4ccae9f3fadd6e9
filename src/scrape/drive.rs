//! Google Drive folder downloader
//!
//! Walks a shared folder tree with a read-only service account, downloads
//! the supported document types, and rewrites Drive filenames into
//! filesystem-safe ones. Drive names regularly contain slashes, colons and
//! Windows-reserved words, so sanitization is deliberately aggressive.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::gcs::auth::{ServiceAccountKey, TokenProvider, SCOPE_DRIVE_READONLY};
use crate::gcs::TokenSource;
use crate::http::HttpClient;
use crate::scrape::{write_sidecar, ScrapeStats};

/// Drive API v3 root
const API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Mime type marking subfolders
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Extensions worth downloading
const SUPPORTED_EXTENSIONS: &[&str] = &[
    ".pdf", ".docx", ".doc", ".xlsx", ".xls", ".txt", ".md", ".json",
];

/// Files larger than this are skipped
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Results per files.list page
const PAGE_SIZE: u32 = 100;

/// Longest filename kept after sanitization
const MAX_FILENAME_LENGTH: usize = 200;

/// Windows device names that cannot be used as file stems
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Clone, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "createdTime", default)]
    created_time: Option<String>,
    #[serde(rename = "modifiedTime", default)]
    modified_time: Option<String>,
}

impl DriveFile {
    fn size_bytes(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn created_date(&self) -> Option<NaiveDate> {
        self.created_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc).date_naive())
    }

    fn is_supported(&self) -> bool {
        let lower = self.name.to_lowercase();
        SUPPORTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    }
}

#[derive(Debug, Deserialize)]
struct FileListPage {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Downloader for one shared Drive folder tree
pub struct DriveScraper {
    http: HttpClient,
    tokens: TokenSource,
    api_base: String,
}

impl DriveScraper {
    /// Create a scraper authenticated with a service-account key
    pub fn new(http: HttpClient, key: ServiceAccountKey) -> Self {
        Self {
            http,
            tokens: TokenSource::ServiceAccount(TokenProvider::new(key, SCOPE_DRIVE_READONLY)),
            api_base: API_BASE.to_string(),
        }
    }

    /// Create a scraper against an explicit endpoint (tests)
    pub fn with_endpoints(http: HttpClient, tokens: TokenSource, api_base: &str) -> Self {
        Self {
            http,
            tokens,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Download every supported file under `folder_id`
    pub async fn run(
        &self,
        folder_id: &str,
        max_depth: u32,
        created_after: Option<NaiveDate>,
        out_dir: &Path,
    ) -> Result<ScrapeStats> {
        info!(folder = folder_id, max_depth, "scanning Drive folder tree");
        let files = self.scan_folder(folder_id, max_depth).await?;
        info!(count = files.len(), "supported files found");

        let mut stats = ScrapeStats::default();
        for file in files {
            if let (Some(after), Some(created)) = (created_after, file.created_date()) {
                if created < after {
                    stats.skipped += 1;
                    continue;
                }
            }

            match self.download_file(&file, out_dir).await {
                Ok(true) => stats.downloaded += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(file = %file.name, error = %e, "download failed");
                    stats.errors += 1;
                }
            }
            self.http.polite_delay().await;
        }

        info!(
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            errors = stats.errors,
            "Drive harvest complete"
        );
        Ok(stats)
    }

    /// Breadth-first walk of the folder tree, depth-capped
    async fn scan_folder(&self, folder_id: &str, max_depth: u32) -> Result<Vec<DriveFile>> {
        let mut files = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back((folder_id.to_string(), 0u32));

        while let Some((current, depth)) = queue.pop_front() {
            for entry in self.list_children(&current).await? {
                if entry.mime_type == FOLDER_MIME {
                    if depth < max_depth {
                        queue.push_back((entry.id, depth + 1));
                    } else {
                        debug!(folder = %entry.name, "depth limit reached, not descending");
                    }
                } else if entry.is_supported() {
                    files.push(entry);
                } else {
                    debug!(file = %entry.name, "unsupported type, skipping");
                }
            }
        }

        Ok(files)
    }

    /// One paged files.list pass over a folder
    async fn list_children(&self, folder_id: &str) -> Result<Vec<DriveFile>> {
        let token = self.tokens.token().await?;
        let query = format!("'{folder_id}' in parents and trashed = false");
        let page_size = PAGE_SIZE.to_string();
        let mut children = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .inner()
                .get(format!("{}/files", self.api_base))
                .bearer_auth(&token)
                .query(&[
                    ("q", query.as_str()),
                    ("pageSize", page_size.as_str()),
                    (
                        "fields",
                        "nextPageToken, files(id, name, mimeType, size, createdTime, modifiedTime)",
                    ),
                ]);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }

            let resp = request.send().await?;
            let page: FileListPage = check_drive_response(resp, "files.list").await?;
            children.extend(page.files);

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(children)
    }

    /// Download one file and write its sidecar.
    ///
    /// Returns `Ok(false)` when the file is oversized or already on disk.
    async fn download_file(&self, file: &DriveFile, out_dir: &Path) -> Result<bool> {
        let sanitized = sanitize_drive_filename(&file.name);
        if sanitized != file.name {
            debug!(original = %file.name, sanitized = %sanitized, "filename sanitized");
        }

        if file.size_bytes() > MAX_FILE_SIZE {
            warn!(
                file = %sanitized,
                size_mb = file.size_bytes() / (1024 * 1024),
                "file too large, skipping"
            );
            return Ok(false);
        }

        let dest = out_dir.join(&sanitized);
        if dest.exists() {
            debug!(file = %sanitized, "already downloaded");
            return Ok(false);
        }
        tokio::fs::create_dir_all(out_dir).await?;

        info!(file = %sanitized, "downloading");
        let token = self.tokens.token().await?;
        let resp = self
            .http
            .inner()
            .get(format!("{}/files/{}", self.api_base, file.id))
            .query(&[("alt", "media")])
            .bearer_auth(&token)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(IngestError::GoogleApi(format!(
                "Drive download failed ({status}): {body}"
            )));
        }

        let tmp = dest.with_extension("tmp");
        let mut out = tokio::fs::File::create(&tmp).await?;
        let mut resp = resp;
        while let Some(chunk) = resp.chunk().await? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        drop(out);
        tokio::fs::rename(&tmp, &dest).await?;

        let mut fields = Map::new();
        fields.insert("drive_file_id".into(), Value::String(file.id.clone()));
        fields.insert("original_name".into(), Value::String(file.name.clone()));
        fields.insert("sanitized_name".into(), Value::String(sanitized.clone()));
        fields.insert(
            "name_was_sanitized".into(),
            Value::Bool(sanitized != file.name),
        );
        fields.insert("mime_type".into(), Value::String(file.mime_type.clone()));
        fields.insert("size_bytes".into(), Value::Number(file.size_bytes().into()));
        if let Some(created) = &file.created_time {
            fields.insert("created_time".into(), Value::String(created.clone()));
        }
        if let Some(modified) = &file.modified_time {
            fields.insert("modified_time".into(), Value::String(modified.clone()));
        }
        fields.insert("source".into(), Value::String("google_drive".into()));
        fields.insert(
            "document_type".into(),
            Value::String("office_document".into()),
        );
        fields.insert("language".into(), Value::String("it".into()));
        write_sidecar(&dest, fields, file.created_date())?;

        Ok(true)
    }
}

async fn check_drive_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    operation: &str,
) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 403 && body.to_lowercase().contains("quota") {
            return Err(IngestError::QuotaExhausted(format!(
                "Drive API quota exhausted during {operation}"
            )));
        }
        return Err(IngestError::GoogleApi(format!(
            "{operation} failed ({status}): {body}"
        )));
    }
    Ok(resp.json().await?)
}

/// Rewrite a Drive filename into a portable one.
///
/// Forbidden characters become underscores, control characters vanish,
/// repeated separators collapse, and Windows device names get a prefix.
pub fn sanitize_drive_filename(name: &str) -> String {
    if name.trim().is_empty() {
        return "file_senza_nome".to_string();
    }

    let mut sanitized: String = name
        .chars()
        .filter_map(|c| match c {
            '?' | '"' => None,
            '/' | '\\' | ':' | '*' | '<' | '>' | '|' | '\n' | '\r' | '\t' => Some('_'),
            c if (c as u32) < 32 || c as u32 == 127 => None,
            c => Some(c),
        })
        .collect();

    sanitized = sanitized.split_whitespace().collect::<Vec<_>>().join(" ");
    while sanitized.contains("__") {
        sanitized = sanitized.replace("__", "_");
    }
    while sanitized.contains("_ ") {
        sanitized = sanitized.replace("_ ", " ");
    }
    while sanitized.contains(" _") {
        sanitized = sanitized.replace(" _", " ");
    }
    sanitized = sanitized
        .trim_matches(|c| c == '_' || c == '.' || c == ' ')
        .to_string();

    let stem = sanitized
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&sanitized);
    if RESERVED_NAMES.contains(&stem.to_uppercase().as_str()) {
        sanitized = format!("file_{sanitized}");
    }

    if sanitized.chars().count() > MAX_FILENAME_LENGTH {
        sanitized = match sanitized.rsplit_once('.') {
            Some((stem, ext)) => {
                let keep = MAX_FILENAME_LENGTH.saturating_sub(ext.chars().count() + 1);
                let stem: String = stem.chars().take(keep).collect();
                format!("{stem}.{ext}")
            }
            None => sanitized.chars().take(MAX_FILENAME_LENGTH).collect(),
        };
    }

    if sanitized.is_empty() {
        "file_sanitizzato".to_string()
    } else {
        sanitized
    }
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

    fn test_scraper(server: &MockServer) -> DriveScraper {
        DriveScraper::with_endpoints(
            quick_http(),
            TokenSource::Static("test-token".to_string()),
            &server.uri(),
        )
    }

    #[test]
    fn sanitization_handles_drive_names() {
        assert_eq!(
            sanitize_drive_filename("Meeting Notes 14:30 - Project/Status.pdf"),
            "Meeting Notes 14_30 - Project_Status.pdf"
        );
        assert_eq!(
            sanitize_drive_filename("Report Q1/Q2 <DRAFT>.docx"),
            "Report Q1_Q2 DRAFT_.docx"
        );
        assert_eq!(sanitize_drive_filename("Config file*.json"), "Config file_.json");
        assert_eq!(sanitize_drive_filename("User Guide v2.0?.txt"), "User Guide v2.0.txt");
        assert_eq!(sanitize_drive_filename(""), "file_senza_nome");
        assert_eq!(sanitize_drive_filename("***"), "file_sanitizzato");
    }

    #[test]
    fn sanitization_prefixes_reserved_names() {
        assert_eq!(sanitize_drive_filename("CON.txt"), "file_CON.txt");
        assert_eq!(sanitize_drive_filename("com1.pdf"), "file_com1.pdf");
        assert_eq!(sanitize_drive_filename("console.txt"), "console.txt");
    }

    #[test]
    fn sanitization_caps_length_keeping_extension() {
        let long = format!("{}.pdf", "a".repeat(300));
        let out = sanitize_drive_filename(&long);
        assert_eq!(out.chars().count(), 200);
        assert!(out.ends_with(".pdf"));
    }

    #[test]
    fn supported_extension_check() {
        let file = |name: &str| DriveFile {
            id: "x".into(),
            name: name.into(),
            mime_type: "application/pdf".into(),
            size: None,
            created_time: None,
            modified_time: None,
        };
        assert!(file("Relazione.PDF").is_supported());
        assert!(file("note.md").is_supported());
        assert!(!file("video.mp4").is_supported());
    }

    #[tokio::test]
    async fn folder_walk_downloads_supported_files() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("q", "'root1' in parents and trashed = false"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"files":[
                    {"id":"sub1","name":"Allegati","mimeType":"application/vnd.google-apps.folder"},
                    {"id":"f1","name":"Relazione: 2024/finale.pdf","mimeType":"application/pdf",
                     "size":"10","createdTime":"2024-05-01T08:00:00Z"},
                    {"id":"f2","name":"clip.mp4","mimeType":"video/mp4","size":"10"}
                ]}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("q", "'sub1' in parents and trashed = false"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"files":[{"id":"f3","name":"nota.txt","mimeType":"text/plain","size":"4"}]}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/f1"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/f3"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"nota".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let stats = test_scraper(&server)
            .run("root1", 2, None, dir.path())
            .await
            .unwrap();

        assert_eq!(stats.downloaded, 2);
        assert_eq!(stats.errors, 0);

        let pdf = dir.path().join("Relazione 2024_finale.pdf");
        assert!(pdf.exists());
        assert!(dir.path().join("nota.txt").exists());

        let sidecar: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(pdf.with_extension("json")).unwrap())
                .unwrap();
        assert_eq!(sidecar["source"], "google_drive");
        assert_eq!(sidecar["drive_file_id"], "f1");
        assert_eq!(sidecar["name_was_sanitized"], true);
        assert_eq!(sidecar["date"], "2024-05-01");
    }

    #[tokio::test]
    async fn depth_limit_stops_descent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("q", "'root1' in parents and trashed = false"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"files":[{"id":"sub1","name":"Sotto","mimeType":"application/vnd.google-apps.folder"}]}"#,
            ))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let stats = test_scraper(&server)
            .run("root1", 0, None, dir.path())
            .await
            .unwrap();
        assert_eq!(stats.downloaded, 0);
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() {
        let server = MockServer::start().await;
        let big = (MAX_FILE_SIZE + 1).to_string();
        Mock::given(method("GET"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"{{"files":[{{"id":"f1","name":"enorme.pdf","mimeType":"application/pdf","size":"{big}"}}]}}"#
            )))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let stats = test_scraper(&server)
            .run("root1", 1, None, dir.path())
            .await
            .unwrap();
        assert_eq!(stats.downloaded, 0);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn created_after_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"files":[{"id":"f1","name":"vecchio.pdf","mimeType":"application/pdf",
                    "size":"4","createdTime":"2022-01-01T00:00:00Z"}]}"#,
            ))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let stats = test_scraper(&server)
            .run("root1", 1, NaiveDate::from_ymd_opt(2024, 1, 1), dir.path())
            .await
            .unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.downloaded, 0);
    }
}
