//! Bucket uploader and ingest manifest writer
//!
//! Mirrors a scraped directory into a bucket prefix and rebuilds
//! `{prefix}/ingest/metadata.jsonl`: one record per data file carrying its
//! `gs://` URI, relative path, sha1 and the merged sidecar metadata. The
//! previous manifest is kept as a timestamped `.bak` object.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use wax::{Glob, Pattern};

use crate::error::{IngestError, Result};
use crate::gcs::GcsClient;

/// Manifest object name under the prefix
const MANIFEST_NAME: &str = "ingest/metadata.jsonl";

/// Totals reported by an upload run
#[derive(Debug, Default, Clone, Copy)]
pub struct UploadStats {
    /// Data files uploaded
    pub uploaded: usize,
    /// Manifest records written
    pub records: usize,
}

/// Uploads one source directory into one bucket prefix
pub struct Uploader {
    gcs: GcsClient,
    bucket: String,
    prefix: String,
}

impl Uploader {
    /// Create an uploader for `gs://bucket/prefix`
    pub fn new(gcs: GcsClient, bucket: &str, prefix: &str) -> Self {
        Self {
            gcs,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn object_name(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }

    /// Upload every file under `src` matching `patterns` and rewrite the
    /// manifest. With `refresh`, the prefix is emptied first.
    pub async fn upload_directory(
        &self,
        src: &Path,
        patterns: &[String],
        refresh: bool,
    ) -> Result<UploadStats> {
        if !src.is_dir() {
            info!(src = %src.display(), "source directory missing, nothing to upload");
            return Ok(UploadStats::default());
        }

        if refresh {
            self.clear_prefix().await?;
        }

        let files = collect_files(src, patterns)?;
        if files.is_empty() {
            info!(src = %src.display(), ?patterns, "no files match the patterns");
            return Ok(UploadStats::default());
        }

        // Sidecars travel inside the records, not as standalone uploads
        let data_files: Vec<&PathBuf> = files
            .iter()
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map_or(true, |ext| !ext.eq_ignore_ascii_case("json"))
            })
            .collect();
        info!(
            total = files.len(),
            data = data_files.len(),
            "uploading to gs://{}/{}",
            self.bucket,
            self.prefix
        );

        let bar = ProgressBar::new(data_files.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut records = Vec::with_capacity(data_files.len());
        let mut stats = UploadStats::default();

        for data_file in data_files {
            let relative = relative_slash_path(data_file, src)?;
            bar.set_message(relative.clone());

            let object = self.object_name(&relative);
            self.gcs
                .upload_file(&self.bucket, &object, data_file, content_type_for(data_file))
                .await?;
            stats.uploaded += 1;

            let mut record = Map::new();
            record.insert(
                "source_file_gcs_uri".into(),
                Value::String(format!("gs://{}/{}", self.bucket, object)),
            );
            record.insert("relative_path".into(), Value::String(relative));
            record.insert(
                "sha1_hash".into(),
                Value::String(sha1_of_file(data_file)?),
            );
            record.insert(
                "upload_timestamp_utc".into(),
                Value::String(Utc::now().to_rfc3339()),
            );

            // Sidecar fields win over the synthesized ones
            let sidecar = data_file.with_extension("json");
            if sidecar.exists() {
                match serde_json::from_str::<Map<String, Value>>(&std::fs::read_to_string(
                    &sidecar,
                )?) {
                    Ok(fields) => record.extend(fields),
                    Err(e) => warn!(sidecar = %sidecar.display(), error = %e, "corrupt sidecar, skipping"),
                }
            }

            records.push(Value::Object(record));
            bar.inc(1);
        }
        bar.finish_and_clear();

        stats.records = records.len();
        self.write_manifest(&records).await?;

        info!(
            uploaded = stats.uploaded,
            records = stats.records,
            "upload complete"
        );
        Ok(stats)
    }

    /// Delete everything currently stored under the prefix
    async fn clear_prefix(&self) -> Result<()> {
        let existing = self.gcs.list_objects(&self.bucket, &self.prefix).await?;
        if existing.is_empty() {
            debug!("prefix already empty");
            return Ok(());
        }

        info!(
            count = existing.len(),
            "clearing gs://{}/{}", self.bucket, self.prefix
        );
        let bar = ProgressBar::new(existing.len() as u64);
        for object in existing {
            self.gcs.delete_object(&self.bucket, &object.name).await?;
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(())
    }

    /// Replace the manifest, backing up the previous one first
    async fn write_manifest(&self, records: &[Value]) -> Result<()> {
        if records.is_empty() {
            info!("no data records, manifest left untouched");
            return Ok(());
        }

        let manifest = self.object_name(MANIFEST_NAME);
        if self.gcs.object_exists(&self.bucket, &manifest).await? {
            let backup = format!("{manifest}.{}.bak", Utc::now().format("%Y%m%dT%H%M%S"));
            self.gcs
                .copy_object(&self.bucket, &manifest, &self.bucket, &backup)
                .await?;
            info!(backup = %backup, "previous manifest backed up");
        }

        let mut staged = tempfile::NamedTempFile::new()?;
        for record in records {
            writeln!(staged, "{}", serde_json::to_string(record)?)?;
        }
        staged.flush()?;

        self.gcs
            .upload_file(
                &self.bucket,
                &manifest,
                staged.path(),
                Some("application/json"),
            )
            .await?;
        info!(manifest = %manifest, records = records.len(), "manifest written");
        Ok(())
    }
}

/// Walk `src` and keep the files matching any pattern.
///
/// Bare patterns like `*.pdf` match at any depth, as an `rglob` would.
fn collect_files(src: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let globs = patterns
        .iter()
        .map(|pattern| {
            let full = if pattern.contains('/') {
                pattern.clone()
            } else {
                format!("**/{pattern}")
            };
            Glob::new(&full)
                .map(Glob::into_owned)
                .map_err(|e| IngestError::config(format!("invalid pattern '{pattern}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut files = Vec::new();
    for entry in WalkDir::new(src) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = relative_slash_path(entry.path(), src)?;
        if globs.iter().any(|g| g.is_match(relative.as_str())) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Path of `file` relative to `base`, with forward slashes
fn relative_slash_path(file: &Path, base: &Path) -> Result<String> {
    let relative = file.strip_prefix(base).map_err(|_| {
        IngestError::Upload(format!(
            "{} is outside the source directory",
            file.display()
        ))
    })?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

fn sha1_of_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha1::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn content_type_for(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("pdf") => Some("application/pdf"),
        Some("txt") | Some("md") => Some("text/plain"),
        Some("json") | Some("jsonl") => Some("application/json"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcs::TokenSource;
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_uploader(server: &MockServer, prefix: &str) -> Uploader {
        let base = format!("{}/storage/v1/", server.uri());
        let upload = format!("{}/upload/storage/v1/", server.uri());
        let gcs = GcsClient::with_endpoints(TokenSource::Static("tok".into()), &base, &upload)
            .unwrap();
        Uploader::new(gcs, "bkt", prefix)
    }

    fn make_tree(dir: &Path) {
        let sub = dir.join("legislatura_19").join("2024");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("doc.pdf"), b"hello").unwrap();
        std::fs::write(
            sub.join("doc.json"),
            r#"{"source":"camera","date":"2024-03-15"}"#,
        )
        .unwrap();
        std::fs::write(dir.join("notes.txt"), b"appunti").unwrap();
    }

    #[tokio::test]
    async fn uploads_data_files_and_manifest() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/bkt/o"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        // Manifest existence probe
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o/camera%2Fingest%2Fmetadata.jsonl"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let uploader = test_uploader(&server, "camera").await;
        let stats = uploader
            .upload_directory(
                dir.path(),
                &["*.pdf".to_string(), "*.txt".to_string(), "*.json".to_string()],
                false,
            )
            .await
            .unwrap();

        assert_eq!(stats.uploaded, 2);
        assert_eq!(stats.records, 2);

        let requests = server.received_requests().await.unwrap();
        let uploads: Vec<_> = requests
            .iter()
            .filter(|r| r.url.path() == "/upload/storage/v1/b/bkt/o")
            .collect();
        let names: Vec<String> = uploads
            .iter()
            .filter_map(|r| {
                r.url
                    .query_pairs()
                    .find(|(k, _)| k == "name")
                    .map(|(_, v)| v.into_owned())
            })
            .collect();
        assert!(names.contains(&"camera/legislatura_19/2024/doc.pdf".to_string()));
        assert!(names.contains(&"camera/notes.txt".to_string()));
        assert!(names.contains(&"camera/ingest/metadata.jsonl".to_string()));

        let manifest_body = uploads
            .iter()
            .find(|r| {
                r.url
                    .query_pairs()
                    .any(|(k, v)| k == "name" && v.contains("metadata.jsonl"))
            })
            .map(|r| String::from_utf8_lossy(&r.body).into_owned())
            .unwrap();
        let first_line = manifest_body.lines().next().unwrap();
        let record: Value = serde_json::from_str(first_line).unwrap();
        assert_eq!(
            record["source_file_gcs_uri"],
            "gs://bkt/camera/legislatura_19/2024/doc.pdf"
        );
        assert_eq!(record["relative_path"], "legislatura_19/2024/doc.pdf");
        // sha1("hello")
        assert_eq!(
            record["sha1_hash"],
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(record["source"], "camera");
        assert_eq!(record["date"], "2024-03-15");
    }

    #[tokio::test]
    async fn existing_manifest_is_backed_up_with_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/bkt/o"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o/camera%2Fingest%2Fmetadata.jsonl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "camera/ingest/metadata.jsonl"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(
                r"^/storage/v1/b/bkt/o/camera%2Fingest%2Fmetadata\.jsonl/copyTo/b/bkt/o/.*\.\d{8}T\d{6}\.bak$",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let uploader = test_uploader(&server, "camera").await;
        let stats = uploader
            .upload_directory(dir.path(), &["*.pdf".to_string()], false)
            .await
            .unwrap();
        assert_eq!(stats.records, 1);
    }

    #[tokio::test]
    async fn refresh_clears_prefix_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bkt/o"))
            .and(query_param("prefix", "camera"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "camera/stale.pdf"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/b/bkt/o/camera%2Fstale.pdf"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let uploader = test_uploader(&server, "camera").await;
        let stats = uploader
            .upload_directory(dir.path(), &["*.pdf".to_string()], true)
            .await
            .unwrap();
        assert_eq!(stats.uploaded, 0);
    }

    #[tokio::test]
    async fn missing_source_directory_is_a_noop() {
        let server = MockServer::start().await;
        let uploader = test_uploader(&server, "camera").await;
        let stats = uploader
            .upload_directory(Path::new("/nonexistent/dir"), &["*.pdf".to_string()], false)
            .await
            .unwrap();
        assert_eq!(stats.uploaded, 0);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn pattern_matching_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let files = collect_files(dir.path(), &["*.pdf".to_string()]).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("legislatura_19/2024/doc.pdf"));
    }
}
