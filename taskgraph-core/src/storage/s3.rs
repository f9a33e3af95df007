//! S3-compatible object storage
//!
//! `location` names the bucket and `name` the object key. A file is the
//! object's bytes held in memory; `sync` uploads the whole buffer.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{DurableStore, StoreFile};
use crate::config::env_parse;
use crate::error::{Result, TaskGraphError};

/// Configuration for the S3 client
#[derive(Clone)]
pub struct S3Config {
    /// S3 endpoint URL
    pub endpoint: String,
    pub region: String,
    /// Access key ID
    pub access_key_id: Option<String>,
    /// Secret access key
    pub secret_access_key: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Attempts per request
    pub retries: u32,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            access_key_id: None,
            secret_access_key: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
            retries: 3,
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("retries", &self.retries)
            .finish()
    }
}

impl S3Config {
    /// Defaults overridden by `S3_ENDPOINT`, `S3_REGION`, `S3_RETRIES` and
    /// the `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` pair
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
            config.endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if let Ok(region) = std::env::var("S3_REGION") {
            config.region = region;
        }
        if let Some(retries) = env_parse::<u32>("S3_RETRIES")? {
            config.retries = retries.max(1);
        }
        config.set_credentials(
            std::env::var("AWS_ACCESS_KEY_ID").ok(),
            std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
        )?;
        Ok(config)
    }

    /// Static credentials come as a pair; one without the other is rejected
    pub fn set_credentials(&mut self, access_key_id: Option<String>, secret_access_key: Option<String>) -> Result<()> {
        let access_key_id = access_key_id.filter(|k| !k.is_empty());
        let secret_access_key = secret_access_key.filter(|k| !k.is_empty());
        if access_key_id.is_some() != secret_access_key.is_some() {
            return Err(TaskGraphError::InvalidConfig {
                reason: "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set together".into(),
            });
        }
        self.access_key_id = access_key_id;
        self.secret_access_key = secret_access_key;
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

/// Path-style S3 client over reqwest
pub struct S3Client {
    client: Client,
    config: S3Config,
}

impl S3Client {
    pub fn new(config: S3Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| TaskGraphError::StorageError {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        match &config.access_key_id {
            Some(key) if config.has_credentials() => {
                info!("S3 client for {} using access key {}", config.endpoint, key)
            }
            _ => info!("S3 client for {} without credentials", config.endpoint),
        }
        Ok(Self { client, config })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.config.endpoint, bucket, key)
    }

    /// Get an object
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let url = self.object_url(bucket, key);
        let resp = self.client.get(&url).send().await.map_err(|e| TaskGraphError::StorageError {
            message: format!("Get object failed for {}/{}: {}", bucket, key, e),
        })?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(TaskGraphError::ObjectNotFound {
                key: format!("{}/{}", bucket, key),
            });
        }
        if !resp.status().is_success() {
            return Err(TaskGraphError::StorageError {
                message: format!("Get object failed for {}/{}: status {}", bucket, key, resp.status()),
            });
        }

        resp.bytes().await.map_err(|e| TaskGraphError::StorageError {
            message: format!("Failed to read body for {}/{}: {}", bucket, key, e),
        })
    }

    /// Put an object, returning its etag
    pub async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<String> {
        let url = self.object_url(bucket, key);
        let resp = self
            .client
            .put(&url)
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| TaskGraphError::StorageError {
                message: format!("Put object failed for {}/{}: {}", bucket, key, e),
            })?;

        if !resp.status().is_success() {
            return Err(TaskGraphError::StorageError {
                message: format!("Put object failed for {}/{}: status {}", bucket, key, resp.status()),
            });
        }

        let etag = resp
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        debug!("Put {}/{} complete, etag={}", bucket, key, etag);
        Ok(etag)
    }

    /// Run `op` up to the configured number of attempts, backing off
    /// between retryable failures
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let retries = self.config.retries.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < retries => {
                    warn!("{} attempt {}/{} failed: {}", what, attempt + 1, retries, e);
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Durable store backed by S3 buckets
#[derive(Clone)]
pub struct S3Store {
    client: Arc<S3Client>,
}

impl S3Store {
    pub fn new(client: Arc<S3Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DurableStore for S3Store {
    /// A missing object opens as an empty file
    async fn open(&self, location: &str, name: &str) -> Result<Box<dyn StoreFile>> {
        let what = format!("Get {}/{}", location, name);
        let existing = self
            .client
            .with_retry(&what, || self.client.get_object(location, name))
            .await;
        let data = match existing {
            Ok(data) => BytesMut::from(&data[..]),
            Err(TaskGraphError::ObjectNotFound { .. }) => BytesMut::new(),
            Err(e) => return Err(e),
        };

        Ok(Box::new(S3File {
            client: self.client.clone(),
            bucket: location.to_string(),
            key: name.to_string(),
            data,
            pos: 0,
        }))
    }
}

/// An object buffered in memory
pub struct S3File {
    client: Arc<S3Client>,
    bucket: String,
    key: String,
    data: BytesMut,
    /// Read cursor into `data`
    pos: usize,
}

#[async_trait]
impl StoreFile for S3File {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let rest = &self.data[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        let body = Bytes::copy_from_slice(&self.data);
        let what = format!("Put {}/{}", self.bucket, self.key);
        let (client, bucket, key) = (&self.client, &self.bucket, &self.key);
        client
            .with_retry(&what, || client.put_object(bucket, key, body.clone()))
            .await?;
        Ok(())
    }
}
