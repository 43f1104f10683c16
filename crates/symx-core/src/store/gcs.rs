//! Google Cloud Storage implementation of [`ObjectStore`].
//!
//! Speaks the GCS JSON/media API directly over `reqwest`: object metadata
//! reads carry the generation and MD5, writes use `ifGenerationMatch`
//! preconditions, and HTTP 412 maps to [`StoreError::PreconditionFailed`].
//! Authentication is a bearer token from `GOOGLE_ACCESS_TOKEN` or the GCE
//! metadata server -- symx does not manage credentials itself.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{BlobInfo, ObjectStore, StoreError};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Upload timeout for multi-gigabyte mirror blobs.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// A parsed `gs://[project@]bucket` storage URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    /// Optional GCP project the client is billed to.
    pub project: Option<String>,
    /// Bucket name.
    pub bucket: String,
}

impl StorageUri {
    /// Parse a `gs://[project@]bucket` URI.
    ///
    /// # Errors
    ///
    /// Returns a message suitable for the CLI when the scheme is not
    /// `gs` or the bucket is missing.
    pub fn parse(input: &str) -> Result<Self, String> {
        let uri = url::Url::parse(input).map_err(|e| format!("invalid storage URI: {e}"))?;
        if uri.scheme() != "gs" {
            return Err(format!(
                "unsupported storage URI scheme '{}': symx currently supports gs:// only",
                uri.scheme()
            ));
        }
        let bucket = uri
            .host_str()
            .ok_or("a bucket name is required for gs:// storage")?
            .to_string();
        let project = match uri.username() {
            "" => None,
            name => Some(name.to_string()),
        };
        Ok(StorageUri { project, bucket })
    }
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    generation: String,
    #[serde(rename = "md5Hash")]
    md5_hash: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// [`ObjectStore`] backed by a GCS bucket.
#[derive(Debug)]
pub struct GcsStore {
    client: reqwest::Client,
    bucket: String,
    api_base: String,
    upload_base: String,
    static_token: Option<String>,
    cached_token: Mutex<Option<CachedToken>>,
}

impl GcsStore {
    /// Connect to the bucket named by `uri`.
    pub fn new(uri: &StorageUri) -> Self {
        Self::with_endpoints(
            uri,
            "https://storage.googleapis.com/storage/v1",
            "https://storage.googleapis.com/upload/storage/v1",
        )
    }

    /// Connect against custom API endpoints (used by tests to point at a
    /// local HTTP double).
    pub fn with_endpoints(uri: &StorageUri, api_base: &str, upload_base: &str) -> Self {
        GcsStore {
            client: reqwest::Client::new(),
            bucket: uri.bucket.clone(),
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
            static_token: std::env::var("GOOGLE_ACCESS_TOKEN").ok(),
            cached_token: Mutex::new(None),
        }
    }

    /// Override the bearer token (test constructor).
    pub fn with_token(mut self, token: &str) -> Self {
        self.static_token = Some(token.to_string());
        self
    }

    fn object_url(&self, key: &str) -> String {
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC);
        format!("{}/b/{}/o/{}", self.api_base, self.bucket, encoded)
    }

    async fn token(&self) -> Result<String, StoreError> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }

        let mut cached = self.cached_token.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.expires_at > Instant::now() {
                return Ok(entry.token.clone());
            }
        }

        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?;
        let token: MetadataToken = response.json().await?;

        // Refresh a minute before the token actually expires.
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn parse_resource(key: &str, resource: &ObjectResource) -> Result<BlobInfo, StoreError> {
        let generation = resource
            .generation
            .parse::<u64>()
            .map_err(|_| StoreError::Backend(format!("bad generation for '{key}'")))?;
        let md5 = match &resource.md5_hash {
            Some(b64) => Some(md5_base64_to_hex(b64)?),
            None => None,
        };
        let size = resource
            .size
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(BlobInfo {
            generation,
            md5,
            size,
        })
    }
}

/// GCS reports MD5 as base64 of the raw digest; the pipeline compares
/// hex strings.
fn md5_base64_to_hex(b64: &str) -> Result<String, StoreError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| StoreError::Backend(format!("undecodable md5Hash: {e}")))?;
    Ok(hex::encode(raw))
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn head(&self, key: &str) -> Result<Option<BlobInfo>, StoreError> {
        let token = self.token().await?;
        let response = self
            .client
            .get(self.object_url(key))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let resource: ObjectResource = response.json().await?;
                Ok(Some(Self::parse_resource(key, &resource)?))
            }
            status => Err(StoreError::Backend(format!(
                "metadata read for '{key}' failed with {status}"
            ))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<(Bytes, u64)>, StoreError> {
        let token = self.token().await?;
        let response = self
            .client
            .get(self.object_url(key))
            .query(&[("alt", "media")])
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let generation = response
                    .headers()
                    .get("x-goog-generation")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                let body = response.bytes().await?;
                Ok(Some((body, generation)))
            }
            status => Err(StoreError::Backend(format!(
                "read of '{key}' failed with {status}"
            ))),
        }
    }

    async fn download_to_path(&self, key: &str, dest: &Path) -> Result<bool, StoreError> {
        let token = self.token().await?;
        let response = self
            .client
            .get(self.object_url(key))
            .query(&[("alt", "media")])
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => {
                let mut file = tokio::fs::File::create(dest).await?;
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    file.write_all(&chunk?).await?;
                }
                file.flush().await?;
                Ok(true)
            }
            status => Err(StoreError::Backend(format!(
                "download of '{key}' failed with {status}"
            ))),
        }
    }

    async fn put_bytes(
        &self,
        key: &str,
        body: Bytes,
        if_generation_match: u64,
    ) -> Result<u64, StoreError> {
        let token = self.token().await?;
        let response = self
            .client
            .post(format!("{}/b/{}/o", self.upload_base, self.bucket))
            .query(&[
                ("uploadType", "media"),
                ("name", key),
                ("ifGenerationMatch", &if_generation_match.to_string()),
            ])
            .bearer_auth(token)
            .body(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED => Err(StoreError::PreconditionFailed {
                key: key.to_string(),
                expected: if_generation_match,
            }),
            status if status.is_success() => {
                let resource: ObjectResource = response.json().await?;
                Ok(Self::parse_resource(key, &resource)?.generation)
            }
            status => Err(StoreError::Backend(format!(
                "write of '{key}' failed with {status}"
            ))),
        }
    }

    async fn put_file(
        &self,
        key: &str,
        src: &Path,
        if_generation_match: Option<u64>,
    ) -> Result<u64, StoreError> {
        let token = self.token().await?;
        let file = tokio::fs::File::open(src).await?;
        let size = file.metadata().await?.len();
        let stream = tokio_util::io::ReaderStream::new(file);

        let mut query: Vec<(&str, String)> = vec![
            ("uploadType", "media".to_string()),
            ("name", key.to_string()),
        ];
        if let Some(expected) = if_generation_match {
            query.push(("ifGenerationMatch", expected.to_string()));
        }

        let response = self
            .client
            .post(format!("{}/b/{}/o", self.upload_base, self.bucket))
            .query(&query)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .timeout(UPLOAD_TIMEOUT)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED => Err(StoreError::PreconditionFailed {
                key: key.to_string(),
                expected: if_generation_match.unwrap_or(0),
            }),
            status if status.is_success() => {
                let resource: ObjectResource = response.json().await?;
                Ok(Self::parse_resource(key, &resource)?.generation)
            }
            status => Err(StoreError::Backend(format!(
                "upload of '{key}' failed with {status}"
            ))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.token().await?;
            let mut query: Vec<(&str, String)> = vec![("prefix", prefix.to_string())];
            if let Some(page) = &page_token {
                query.push(("pageToken", page.clone()));
            }

            let response = self
                .client
                .get(format!("{}/b/{}/o", self.api_base, self.bucket))
                .query(&query)
                .bearer_auth(token)
                .send()
                .await?
                .error_for_status()?;
            let page: ListResponse = response.json().await?;
            keys.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(keys)
    }

    fn name(&self) -> &str {
        &self.bucket
    }
}
