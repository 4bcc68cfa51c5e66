use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::models::MediaFile;

/// An object found while listing a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: i64,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    /// Writes `bytes` under `key`, replacing any existing object.
    async fn put_object(&self, key: &str, bytes: Vec<u8>, content_type: Option<String>)
        -> Result<()>;

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Every object whose key starts with `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>>;
}

/// Where a media file's bytes live. Persisted per file in `storage_backend`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageBackend {
    Supabase,
    S3,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Supabase => "supabase",
            StorageBackend::S3 => "s3",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "supabase" => Ok(StorageBackend::Supabase),
            "s3" => Ok(StorageBackend::S3),
            other => bail!("unknown storage backend: {other}"),
        }
    }
}

/// The configured backends, resolved per file rather than per tenant.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    backends: HashMap<StorageBackend, Arc<dyn ObjectStorage>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: StorageBackend, storage: Arc<dyn ObjectStorage>) -> Self {
        self.backends.insert(backend, storage);
        self
    }

    pub fn get(&self, backend: StorageBackend) -> Result<Arc<dyn ObjectStorage>> {
        self.backends
            .get(&backend)
            .cloned()
            .ok_or_else(|| anyhow!("storage backend {backend} is not configured"))
    }

    pub fn for_media(&self, media: &MediaFile) -> Result<Arc<dyn ObjectStorage>> {
        self.get(media.storage_backend.parse()?)
    }

    pub fn configured(&self) -> Vec<StorageBackend> {
        let mut backends: Vec<_> = self.backends.keys().copied().collect();
        backends.sort_by_key(|backend| backend.as_str());
        backends
    }
}

pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes));

        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        request
            .send()
            .await
            .with_context(|| format!("failed to upload {key} to S3"))?;
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let presign_config = PresigningConfig::builder()
            .expires_in(expires_in)
            .build()
            .context("failed to build S3 presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .context("failed to presign S3 download")?;

        Ok(presigned.uri().to_string())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to download {key} from S3"))?;

        let bytes = response
            .body
            .collect()
            .await
            .context("failed to read S3 object stream")?
            .into_bytes()
            .to_vec();
        Ok(bytes)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to delete {key} from S3"))?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .with_context(|| format!("failed to list S3 prefix {prefix}"))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    objects.push(StoredObject {
                        key: key.to_string(),
                        size: object.size().unwrap_or_default(),
                    });
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }
        Ok(objects)
    }
}

/// Path segments keep `/` but escape everything a URL path would misread.
const OBJECT_PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

const LIST_PAGE_SIZE: usize = 1000;

/// The managed storage service's REST object API.
pub struct SupabaseStorage {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    /// Folders come back without an id.
    id: Option<String>,
    metadata: Option<ListMetadata>,
}

#[derive(Debug, Deserialize)]
struct ListMetadata {
    size: Option<i64>,
}

impl SupabaseStorage {
    pub fn new(
        base_url: &str,
        service_key: &str,
        bucket: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {service_key}"))
                .context("invalid storage service key")?,
        );
        headers.insert(
            "apikey",
            HeaderValue::from_str(service_key).context("invalid storage service key")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("failed to build storage HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        })
    }

    fn object_url(&self, action: &str, key: &str) -> String {
        let key = utf8_percent_encode(key.trim_start_matches('/'), OBJECT_PATH);
        format!(
            "{}/storage/v1/object/{action}{}/{key}",
            self.base_url,
            self.bucket
        )
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("{what} failed with {status}: {body}")
    }

    /// One page of a folder listing; folders come back as entries without an id.
    async fn list_page(&self, prefix: &str, offset: usize) -> Result<Vec<ListEntry>> {
        let response = self
            .client
            .post(format!(
                "{}/storage/v1/object/list/{}",
                self.base_url, self.bucket
            ))
            .json(&json!({
                "prefix": prefix,
                "limit": LIST_PAGE_SIZE,
                "offset": offset,
                "sortBy": {"column": "name", "order": "asc"},
            }))
            .send()
            .await
            .context("storage list request failed")?;
        Self::check(response, "storage list")
            .await?
            .json()
            .await
            .context("invalid storage list response")
    }
}

#[async_trait]
impl ObjectStorage for SupabaseStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        let content_type =
            content_type.unwrap_or_else(|| "application/octet-stream".to_string());
        let response = self
            .client
            .post(self.object_url("", key))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("failed to upload {key}"))?;
        Self::check(response, "storage upload").await?;
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let response = self
            .client
            .post(self.object_url("sign/", key))
            .json(&json!({ "expiresIn": expires_in.as_secs() }))
            .send()
            .await
            .with_context(|| format!("failed to sign {key}"))?;
        let signed: SignedUrlResponse = Self::check(response, "storage sign")
            .await?
            .json()
            .await
            .context("invalid signed url response")?;
        Ok(format!("{}/storage/v1{}", self.base_url, signed.signed_url))
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.object_url("", key))
            .send()
            .await
            .with_context(|| format!("failed to download {key}"))?;
        let bytes = Self::check(response, "storage download")
            .await?
            .bytes()
            .await
            .context("failed to read storage download")?;
        Ok(bytes.to_vec())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!(
                "{}/storage/v1/object/{}",
                self.base_url, self.bucket
            ))
            .json(&json!({ "prefixes": [key] }))
            .send()
            .await
            .with_context(|| format!("failed to delete {key}"))?;
        Self::check(response, "storage delete").await?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut folders = vec![prefix.trim_end_matches('/').to_string()];

        while let Some(folder) = folders.pop() {
            let mut offset = 0;
            loop {
                let entries = self.list_page(&folder, offset).await?;
                let page_len = entries.len();
                for entry in entries {
                    let key = if folder.is_empty() {
                        entry.name
                    } else {
                        format!("{folder}/{}", entry.name)
                    };
                    match entry.id {
                        Some(_) => objects.push(StoredObject {
                            key,
                            size: entry.metadata.and_then(|m| m.size).unwrap_or_default(),
                        }),
                        None => folders.push(key),
                    }
                }
                if page_len < LIST_PAGE_SIZE {
                    break;
                }
                offset += page_len;
            }
        }

        debug!(prefix, count = objects.len(), "listed storage prefix");
        Ok(objects)
    }
}
