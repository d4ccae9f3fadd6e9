//! Gemini-assisted renaming of uploaded documents
//!
//! Every non-JSON object under a prefix is read, its first pages are sent to
//! Gemini Flash on Vertex AI, and the object (plus its metadata sidecar) is
//! renamed to the archival name the model proposes. Afterwards the prefix's
//! `ingest/batch.jsonl` is patched so its URIs and dates follow the renames.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RenameConfig;
use crate::error::{IngestError, Result};
use crate::gcs::{GcsClient, TokenSource};
use crate::scrape::dates;

/// Vertex AI GA endpoint root
const VERTEX_BASE: &str = "https://aiplatform.googleapis.com/v1";

/// Attempts per model call
const MODEL_RETRIES: u32 = 3;

/// Batch manifest patched after the renames
const BATCH_NAME: &str = "ingest/batch.jsonl";

const SYSTEM_PROMPT: &str = "Sei un archivista esperto. Analizza i primi caratteri del documento fornito (PDF, XML o TXT) e il suo nome originale. \
Il documento è un atto ufficiale del Parlamento italiano (Camera o Senato) o un altro documento istituzionale. \
Genera un nuovo nome di file nel formato ESATTO: \n\n\
<organo>_<tipo_atto>_<data_iso>_<descrizione_o_presidenza>\n\n\
- <organo>: 'camera' o 'senato' (o 'doc' se incerto)\n\
- <tipo_atto>: es. 'resoconto_stenografico', 'ddl', 'audizione' (o 'atto')\n\
- <data_iso>: data AAAA-MM-GG\n\
- <descrizione_o_presidenza>: cognome presidente o breve descrizione (≤3 parole)\n\n\
RISPONDI SOLO COL NOME, senza testo extra.";

/// Totals reported by a rename run
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameStats {
    /// Objects renamed (sidecar included)
    pub renamed: usize,
    /// Objects whose proposed name matched the current one
    pub unchanged: usize,
    /// Objects without usable text or without a model proposal
    pub skipped: usize,
    /// Objects that failed
    pub errors: usize,
}

/// What happened to one object
#[derive(Debug, Clone)]
enum Outcome {
    NoText,
    EmptyResponse,
    Unchanged,
    Renamed {
        new_uri: String,
        new_date: Option<String>,
    },
    Failed(String),
}

impl Outcome {
    /// Log column value, either the new URI or a status word
    fn log_value(&self) -> String {
        match self {
            Self::NoText => "NO_TEXT".to_string(),
            Self::EmptyResponse => "EMPTY_RESPONSE".to_string(),
            Self::Unchanged => "UNCHANGED".to_string(),
            Self::Renamed { new_uri, .. } => new_uri.clone(),
            Self::Failed(reason) => format!("ERROR:{reason}"),
        }
    }
}

/// Renames the objects under one bucket prefix
pub struct Renamer {
    gcs: GcsClient,
    tokens: TokenSource,
    http: reqwest::Client,
    config: RenameConfig,
    vertex_base: String,
}

impl Renamer {
    /// Create a renamer against the production Vertex endpoint
    pub fn new(gcs: GcsClient, tokens: TokenSource, config: RenameConfig) -> Self {
        Self::with_vertex_base(gcs, tokens, config, VERTEX_BASE)
    }

    /// Construct against an explicit Vertex endpoint (tests)
    pub fn with_vertex_base(
        gcs: GcsClient,
        tokens: TokenSource,
        config: RenameConfig,
        vertex_base: &str,
    ) -> Self {
        Self {
            gcs,
            tokens,
            http: reqwest::Client::new(),
            config,
            vertex_base: vertex_base.trim_end_matches('/').to_string(),
        }
    }

    fn model_url(&self) -> String {
        format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            self.vertex_base, self.config.project_id, self.config.region, self.config.model
        )
    }

    /// Rename everything under `gs://bucket/prefix` and patch the batch manifest
    pub async fn run(&self, bucket: &str, prefix: &str) -> Result<RenameStats> {
        let prefix = normalize_prefix(prefix);
        let objects = self.gcs.list_objects(bucket, &prefix).await?;
        let targets: Vec<String> = objects
            .into_iter()
            .map(|o| o.name)
            .filter(|name| {
                let lower = name.to_lowercase();
                !lower.ends_with(".json") && !lower.ends_with(".jsonl") && !lower.ends_with(".bak")
            })
            .collect();

        if targets.is_empty() {
            info!(bucket, prefix = %prefix, "nothing to rename");
            return Ok(RenameStats::default());
        }
        info!(bucket, prefix = %prefix, count = targets.len(), "renaming objects");

        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();
        for object in targets {
            let permits = Arc::clone(&semaphore);
            let renamer = self.clone_for_task();
            let bucket = bucket.to_string();
            tasks.spawn(async move {
                let _permit = permits.acquire().await;
                let outcome = renamer.process_object(&bucket, &object).await;
                (format!("gs://{bucket}/{object}"), outcome)
            });
        }

        let mut results: Vec<(String, Outcome)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(error = %e, "rename task panicked");
                    results.push((String::new(), Outcome::Failed(e.to_string())));
                }
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));

        self.write_log(&results)?;

        let mut stats = RenameStats::default();
        let mut changes: HashMap<String, (String, Option<String>)> = HashMap::new();
        for (origin_uri, outcome) in &results {
            match outcome {
                Outcome::Renamed { new_uri, new_date } => {
                    stats.renamed += 1;
                    changes.insert(origin_uri.clone(), (new_uri.clone(), new_date.clone()));
                }
                Outcome::Unchanged => stats.unchanged += 1,
                Outcome::NoText | Outcome::EmptyResponse => stats.skipped += 1,
                Outcome::Failed(_) => stats.errors += 1,
            }
        }

        self.patch_batch_manifest(bucket, &prefix, &changes).await?;

        info!(
            renamed = stats.renamed,
            unchanged = stats.unchanged,
            skipped = stats.skipped,
            errors = stats.errors,
            "rename complete"
        );
        Ok(stats)
    }

    fn clone_for_task(&self) -> Self {
        Self {
            gcs: self.gcs.clone(),
            tokens: self.tokens.clone(),
            http: self.http.clone(),
            config: self.config.clone(),
            vertex_base: self.vertex_base.clone(),
        }
    }

    /// Rename one object; failures are reported per object, never fatal
    async fn process_object(&self, bucket: &str, object: &str) -> Outcome {
        match self.try_process(bucket, object).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    async fn try_process(&self, bucket: &str, object: &str) -> Result<Outcome> {
        let Some(bytes) = self.gcs.download_bytes(bucket, object).await? else {
            return Ok(Outcome::Failed("object vanished".to_string()));
        };

        let context = self.build_context(object, &bytes);
        let Some(context) = context else {
            return Ok(Outcome::NoText);
        };

        let response = self.call_model(&context).await?;
        if response.trim().is_empty() {
            return Ok(Outcome::EmptyResponse);
        }
        let new_stem = sanitize_stem(&response);

        let (dir, _, ext) = split_object_path(object);
        let new_key = format!("{dir}{new_stem}{ext}");
        if new_key == object {
            return Ok(Outcome::Unchanged);
        }

        self.gcs
            .copy_object(bucket, object, bucket, &new_key)
            .await?;

        // The sidecar follows its document, content untouched
        let (dir, stem, _) = split_object_path(object);
        let old_sidecar = format!("{dir}{stem}.json");
        let new_sidecar = format!("{dir}{new_stem}.json");
        match self.gcs.object_exists(bucket, &old_sidecar).await {
            Ok(true) => {
                self.gcs
                    .copy_object(bucket, &old_sidecar, bucket, &new_sidecar)
                    .await?;
                self.gcs.delete_object(bucket, &old_sidecar).await?;
            }
            Ok(false) => {}
            Err(e) => warn!(sidecar = %old_sidecar, error = %e, "sidecar rename failed"),
        }

        self.gcs.delete_object(bucket, object).await?;

        let new_date = dates::date_from_filename(&new_key).map(|d| d.to_string());
        debug!(from = object, to = %new_key, "object renamed");
        Ok(Outcome::Renamed {
            new_uri: format!("gs://{bucket}/{new_key}"),
            new_date,
        })
    }

    /// Model input: original filename plus the document's opening text
    fn build_context(&self, object: &str, bytes: &[u8]) -> Option<String> {
        let lower = object.to_lowercase();
        let filename = object.rsplit('/').next().unwrap_or(object);

        let content = if lower.ends_with(".pdf") {
            pdf_extract::extract_text_from_mem(bytes).ok()?
        } else if [".txt", ".xml", ".html", ".md"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            String::from_utf8_lossy(bytes).into_owned()
        } else {
            return None;
        };
        if content.trim().is_empty() {
            return None;
        }

        let full = format!("NOME FILE ORIGINALE: {filename}\n\nCONTENUTO:\n{content}");
        Some(full.chars().take(self.config.max_chars).collect())
    }

    /// Ask Gemini Flash for the new name
    async fn call_model(&self, content: &str) -> Result<String> {
        let token = self.tokens.token().await?;
        let body = json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_PROMPT }] },
            "contents": [{ "role": "user", "parts": [{ "text": content }] }],
            "generationConfig": { "temperature": 0.0, "maxOutputTokens": 256 },
        });

        let mut last_err = None;
        for attempt in 0..MODEL_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(1 << (attempt - 1))).await;
            }

            let result = self
                .http
                .post(self.model_url())
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let payload: Value = resp.json().await?;
                    let text = payload
                        .pointer("/candidates/0/content/parts/0/text")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            IngestError::Rename("model response without text part".to_string())
                        })?;
                    return Ok(text.trim().to_string());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    last_err = Some(IngestError::Rename(format!(
                        "model call failed ({status}): {body}"
                    )));
                }
                Err(e) => last_err = Some(e.into()),
            }
        }

        Err(last_err
            .unwrap_or_else(|| IngestError::Rename("model call failed".to_string())))
    }

    /// Two-column CSV: origin URI, new URI or status
    fn write_log(&self, results: &[(String, Outcome)]) -> Result<()> {
        let mut writer = csv::Writer::from_path(&self.config.log_file)?;
        writer.write_record(["vecchio_uri", "nuovo_uri_o_stato"])?;
        for (origin, outcome) in results {
            writer.write_record([origin.as_str(), outcome.log_value().as_str()])?;
        }
        writer.flush()?;
        info!(log = %self.config.log_file.display(), "rename log written");
        Ok(())
    }

    /// Rewrite batch.jsonl records whose URI was renamed.
    ///
    /// Malformed lines are kept verbatim, and the old manifest is backed up
    /// before the overwrite.
    async fn patch_batch_manifest(
        &self,
        bucket: &str,
        prefix: &str,
        changes: &HashMap<String, (String, Option<String>)>,
    ) -> Result<()> {
        if changes.is_empty() {
            debug!("no renames, batch manifest untouched");
            return Ok(());
        }

        let batch = format!("{prefix}{BATCH_NAME}");
        let Some(content) = self.gcs.download_text(bucket, &batch).await? else {
            info!(batch = %batch, "batch manifest not found, skipping update");
            return Ok(());
        };

        let mut updated_lines = Vec::new();
        let mut updates = 0usize;

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(mut record) = serde_json::from_str::<Value>(line) else {
                warn!("malformed batch record kept verbatim");
                updated_lines.push(line.to_string());
                continue;
            };

            let uri = record
                .pointer("/content/uri")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if let Some((new_uri, new_date)) = changes.get(&uri) {
                if let Some(content_obj) = record.get_mut("content").and_then(Value::as_object_mut)
                {
                    content_obj.insert("uri".into(), Value::String(new_uri.clone()));
                }
                if let (Some(date), Some(struct_data)) = (
                    new_date,
                    record.get_mut("structData").and_then(Value::as_object_mut),
                ) {
                    struct_data.insert("date".into(), Value::String(date.clone()));
                    struct_data.insert("date_corrected_by_rename".into(), Value::Bool(true));
                    struct_data.insert(
                        "date_correction_timestamp".into(),
                        Value::String(Utc::now().to_rfc3339()),
                    );
                }
                updates += 1;
            }
            updated_lines.push(serde_json::to_string(&record)?);
        }

        if updates == 0 {
            info!("no batch records matched the renames");
            return Ok(());
        }

        let backup = format!("{batch}.{}.bak", Utc::now().format("%Y%m%dT%H%M%S"));
        self.gcs.copy_object(bucket, &batch, bucket, &backup).await?;

        let body = format!("{}\n", updated_lines.join("\n"));
        self.gcs
            .upload_string(bucket, &batch, &body, Some("application/json"))
            .await?;
        info!(updates, backup = %backup, "batch manifest patched");
        Ok(())
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Lowercase, whitespace to underscores, everything else stripped
fn sanitize_stem(stem: &str) -> String {
    let joined = stem
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "documento_rinominato".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Split an object name into directory prefix, stem, and dotted extension
fn split_object_path(name: &str) -> (String, String, String) {
    let (dir, file) = match name.rsplit_once('/') {
        Some((dir, file)) => (format!("{dir}/"), file),
        None => (String::new(), name),
    };
    match file.rsplit_once('.') {
        Some((stem, ext)) => (dir, stem.to_string(), format!(".{ext}")),
        None => (dir, file.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn stem_sanitization() {
        assert_eq!(
            sanitize_stem("Camera Resoconto Stenografico 2024-03-15 Fontana"),
            "camera_resoconto_stenografico_2024-03-15_fontana"
        );
        assert_eq!(sanitize_stem("  __..  "), "documento_rinominato");
        assert_eq!(sanitize_stem("già_fatto"), "gi_fatto");
    }

    #[test]
    fn object_path_split() {
        assert_eq!(
            split_object_path("camera/2024/doc.pdf"),
            ("camera/2024/".to_string(), "doc".to_string(), ".pdf".to_string())
        );
        assert_eq!(
            split_object_path("doc"),
            (String::new(), "doc".to_string(), String::new())
        );
    }

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("camera"), "camera/");
        assert_eq!(normalize_prefix("/camera/"), "camera/");
        assert_eq!(normalize_prefix(""), "");
    }

    fn test_config(log_file: &Path) -> RenameConfig {
        RenameConfig {
            project_id: "proj".to_string(),
            region: "global".to_string(),
            model: "gemini-2.0-flash-lite-001".to_string(),
            workers: 2,
            max_pdf_pages: 3,
            max_chars: 4000,
            log_file: log_file.to_path_buf(),
        }
    }

    fn test_renamer(server: &MockServer, log_file: &Path) -> Renamer {
        let base = format!("{}/storage/v1/", server.uri());
        let upload = format!("{}/upload/storage/v1/", server.uri());
        let gcs = GcsClient::with_endpoints(TokenSource::Static("tok".into()), &base, &upload)
            .unwrap();
        Renamer::with_vertex_base(
            gcs,
            TokenSource::Static("tok".into()),
            test_config(log_file),
            &server.uri(),
        )
    }

    #[test]
    fn context_includes_filename_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let gcs = GcsClient::with_endpoints(
            TokenSource::Static("tok".into()),
            "http://localhost/storage/v1/",
            "http://localhost/upload/storage/v1/",
        )
        .unwrap();
        let renamer = Renamer::new(
            gcs,
            TokenSource::Static("tok".into()),
            test_config(&dir.path().join("log.csv")),
        );

        let context = renamer
            .build_context("camera/verbale.txt", b"Seduta del 15 marzo 2024")
            .unwrap();
        assert!(context.starts_with("NOME FILE ORIGINALE: verbale.txt\n\nCONTENUTO:\n"));
        assert!(context.contains("Seduta del 15 marzo 2024"));

        assert!(renamer.build_context("camera/video.mp4", b"data").is_none());
        assert!(renamer.build_context("camera/vuoto.txt", b"   ").is_none());
    }

    #[tokio::test]
    async fn renames_object_and_patches_batch() {
        let server = MockServer::start().await;
        let log = tempfile::tempdir().unwrap();
        let log_file = log.path().join("rename_log.csv");

        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"name": "camera/verbale.txt"},
                    {"name": "camera/verbale.json"},
                    {"name": "camera/ingest/batch.jsonl"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o/camera%2Fverbale.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(
                b"Seduta del 15 marzo 2024, presidenza Fontana".to_vec(),
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(
                "/projects/proj/locations/global/publishers/google/models/gemini-2.0-flash-lite-001:generateContent",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{
                    "text": "camera_resoconto_stenografico_2024-03-15_fontana\n"
                }]}}]
            })))
            .mount(&server)
            .await;

        let new_key = "camera/camera_resoconto_stenografico_2024-03-15_fontana";
        Mock::given(method("POST"))
            .and(path(format!(
                "/storage/v1/b/bkt/o/camera%2Fverbale.txt/copyTo/b/bkt/o/{}",
                format!("{new_key}.txt").replace('/', "%2F")
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o/camera%2Fverbale.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "camera/verbale.json"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!(
                "/storage/v1/b/bkt/o/camera%2Fverbale.json/copyTo/b/bkt/o/{}",
                format!("{new_key}.json").replace('/', "%2F")
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/b/bkt/o/camera%2Fverbale.json"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/b/bkt/o/camera%2Fverbale.txt"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let batch_line = serde_json::json!({
            "content": {"uri": "gs://bkt/camera/verbale.txt", "mimeType": "text/plain"},
            "structData": {"date": "2020-01-01", "source": "camera"}
        });
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o/camera%2Fingest%2Fbatch.jsonl"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("{batch_line}\nnot json at all\n")),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::path_regex(
                r"^/storage/v1/b/bkt/o/camera%2Fingest%2Fbatch\.jsonl/copyTo/.*\.bak$",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/bkt/o"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let renamer = test_renamer(&server, &log_file);
        let stats = renamer.run("bkt", "camera").await.unwrap();

        assert_eq!(stats.renamed, 1);
        assert_eq!(stats.errors, 0);

        let log_content = std::fs::read_to_string(&log_file).unwrap();
        assert!(log_content.contains("vecchio_uri,nuovo_uri_o_stato"));
        assert!(log_content.contains(&format!("gs://bkt/{new_key}.txt")));

        // Batch manifest rewritten with the new URI and corrected date
        let requests = server.received_requests().await.unwrap();
        let batch_upload = requests
            .iter()
            .find(|r| {
                r.url.path() == "/upload/storage/v1/b/bkt/o"
                    && r.url
                        .query_pairs()
                        .any(|(k, v)| k == "name" && v.contains("batch.jsonl"))
            })
            .map(|r| String::from_utf8_lossy(&r.body).into_owned())
            .unwrap();
        assert!(batch_upload.contains(&format!("gs://bkt/{new_key}.txt")));
        assert!(batch_upload.contains("\"date\":\"2024-03-15\""));
        assert!(batch_upload.contains("\"date_corrected_by_rename\":true"));
        assert!(batch_upload.contains("not json at all"));
    }

    #[tokio::test]
    async fn objects_without_text_are_logged_and_left_alone() {
        let server = MockServer::start().await;
        let log = tempfile::tempdir().unwrap();
        let log_file = log.path().join("rename_log.csv");

        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "camera/clip.mp4"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o/camera%2Fclip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
            .mount(&server)
            .await;

        let renamer = test_renamer(&server, &log_file);
        let stats = renamer.run("bkt", "camera").await.unwrap();

        assert_eq!(stats.renamed, 0);
        assert_eq!(stats.skipped, 1);
        let log_content = std::fs::read_to_string(&log_file).unwrap();
        assert!(log_content.contains("NO_TEXT"));
    }
}
