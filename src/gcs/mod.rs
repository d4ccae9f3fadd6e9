//! Google Cloud Storage client over the JSON API
//!
//! The original pipeline talks to GCS through the vendor SDK; here the same
//! operations (list, upload, download, copy, delete) are expressed directly
//! against the JSON API with a service-account bearer token.

pub mod auth;

pub use auth::{ServiceAccountKey, TokenProvider, SCOPE_CLOUD_PLATFORM, SCOPE_DRIVE_READONLY};

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{IngestError, Result};

/// Default JSON API endpoint
const API_BASE: &str = "https://storage.googleapis.com/storage/v1/";

/// Default media upload endpoint
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/";

/// Where a bearer token comes from
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Service-account key exchanged for OAuth2 tokens
    ServiceAccount(TokenProvider),
    /// Fixed token, used by tests and local emulators
    Static(String),
}

impl TokenSource {
    /// Return a valid bearer token
    pub async fn token(&self) -> Result<String> {
        match self {
            Self::ServiceAccount(provider) => provider.token().await,
            Self::Static(token) => Ok(token.clone()),
        }
    }
}

/// Metadata of one bucket object
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectInfo {
    /// Full object name (path within the bucket)
    pub name: String,
    /// Object size in bytes, as reported by the API
    #[serde(default)]
    pub size: Option<String>,
}

impl ObjectInfo {
    /// `gs://` URI of this object
    pub fn uri(&self, bucket: &str) -> String {
        format!("gs://{}/{}", bucket, self.name)
    }

    /// Object size in bytes; the API reports it as a decimal string
    pub fn size_bytes(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectInfo>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// GCS JSON API client
#[derive(Debug, Clone)]
pub struct GcsClient {
    client: Client,
    tokens: TokenSource,
    api_base: Url,
    upload_base: Url,
}

impl GcsClient {
    /// Create a client authenticated with a service-account key
    pub fn new(key: ServiceAccountKey) -> Result<Self> {
        let tokens = TokenSource::ServiceAccount(TokenProvider::new(key, SCOPE_CLOUD_PLATFORM));
        Self::with_endpoints(tokens, API_BASE, UPLOAD_BASE)
    }

    /// Create a client against explicit endpoints (tests, emulators)
    pub fn with_endpoints(tokens: TokenSource, api_base: &str, upload_base: &str) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            tokens,
            api_base: Url::parse(api_base)?,
            upload_base: Url::parse(upload_base)?,
        })
    }

    fn object_url(&self, bucket: &str, object: &str) -> Result<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| IngestError::gcs("invalid API base URL"))?
            .pop_if_empty()
            .extend(["b", bucket, "o", object]);
        Ok(url)
    }

    async fn bearer(&self) -> Result<String> {
        self.tokens.token().await
    }

    /// List all objects under a prefix, following pagination
    pub async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let token = self.bearer().await?;
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| IngestError::gcs("invalid API base URL"))?
            .pop_if_empty()
            .extend(["b", bucket, "o"]);

        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self.client.get(url.clone()).bearer_auth(&token);
            if !prefix.is_empty() {
                req = req.query(&[("prefix", prefix)]);
            }
            if let Some(ref pt) = page_token {
                req = req.query(&[("pageToken", pt)]);
            }

            let resp = req.send().await?;
            let resp = Self::check(resp, "list").await?;
            let page: ListResponse = resp.json().await?;
            objects.extend(page.items);

            match page.next_page_token {
                Some(pt) => page_token = Some(pt),
                None => break,
            }
        }

        let total_bytes: u64 = objects.iter().map(ObjectInfo::size_bytes).sum();
        debug!(
            bucket,
            prefix,
            count = objects.len(),
            total_bytes,
            "listed objects"
        );
        Ok(objects)
    }

    /// Check whether an object exists
    pub async fn object_exists(&self, bucket: &str, object: &str) -> Result<bool> {
        let token = self.bearer().await?;
        let url = self.object_url(bucket, object)?;
        let resp = self.client.get(url).bearer_auth(&token).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(IngestError::gcs(format!("stat failed ({status})"))),
        }
    }

    /// Download an object as text; a missing object maps to `Ok(None)`
    pub async fn download_text(&self, bucket: &str, object: &str) -> Result<Option<String>> {
        match self.download_bytes(bucket, object).await? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    /// Download an object's bytes; a missing object maps to `Ok(None)`
    pub async fn download_bytes(&self, bucket: &str, object: &str) -> Result<Option<Vec<u8>>> {
        let token = self.bearer().await?;
        let url = self.object_url(bucket, object)?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&token)
            .query(&[("alt", "media")])
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check(resp, "download").await?;
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    /// Upload a local file as `object`
    pub async fn upload_file(
        &self,
        bucket: &str,
        object: &str,
        path: &std::path::Path,
        content_type: Option<&str>,
    ) -> Result<()> {
        let body = tokio::fs::read(path).await?;
        self.upload_bytes(bucket, object, body, content_type).await
    }

    /// Upload a string as `object`
    pub async fn upload_string(
        &self,
        bucket: &str,
        object: &str,
        content: &str,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.upload_bytes(bucket, object, content.as_bytes().to_vec(), content_type)
            .await
    }

    async fn upload_bytes(
        &self,
        bucket: &str,
        object: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()> {
        let token = self.bearer().await?;
        let mut url = self.upload_base.clone();
        url.path_segments_mut()
            .map_err(|_| IngestError::gcs("invalid upload base URL"))?
            .pop_if_empty()
            .extend(["b", bucket, "o"]);

        let resp = self
            .client
            .post(url)
            .bearer_auth(&token)
            .query(&[("uploadType", "media"), ("name", object)])
            .header(
                reqwest::header::CONTENT_TYPE,
                content_type.unwrap_or("application/octet-stream"),
            )
            .body(body)
            .send()
            .await?;

        Self::check(resp, "upload").await?;
        debug!(bucket, object, "uploaded object");
        Ok(())
    }

    /// Server-side copy of an object
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
    ) -> Result<()> {
        let token = self.bearer().await?;
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| IngestError::gcs("invalid API base URL"))?
            .pop_if_empty()
            .extend([
                "b",
                src_bucket,
                "o",
                src_object,
                "copyTo",
                "b",
                dst_bucket,
                "o",
                dst_object,
            ]);

        let resp = self.client.post(url).bearer_auth(&token).send().await?;
        Self::check(resp, "copy").await?;
        Ok(())
    }

    /// Delete an object
    pub async fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        let token = self.bearer().await?;
        let url = self.object_url(bucket, object)?;
        let resp = self.client.delete(url).bearer_auth(&token).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp, "delete").await?;
        Ok(())
    }

    async fn check(resp: reqwest::Response, op: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::FORBIDDEN && body.to_lowercase().contains("quota") {
            return Err(IngestError::QuotaExhausted(format!("GCS {op}: {body}")));
        }
        Err(IngestError::gcs(format!("{op} failed ({status}): {body}")))
    }
}
