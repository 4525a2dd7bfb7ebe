//! Thin object-store abstraction: put a local file under a bucket+key, and
//! mint a pre-signed GET URL that expires at an absolute instant. One real
//! backend (S3) and one in-memory test double.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use chrono::{
    DateTime,
    Utc,
};
use errors::ErrorMetadata;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Upload `local_path` to `bucket/key`, replacing any existing object
    /// at that key.
    async fn put_file(&self, bucket: &str, key: &str, local_path: &Path) -> anyhow::Result<()>;

    /// Generate a GET URL for `bucket/key` valid until the absolute instant
    /// `expires_at`.
    async fn generate_presigned_url(
        &self,
        bucket: &str,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<String>;
}

/// AWS S3-backed implementation.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = aws_sdk_s3::Client::new(&config);
        Self { client }
    }

    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

fn expires_in(expires_at: DateTime<Utc>) -> anyhow::Result<std::time::Duration> {
    let now = Utc::now();
    let delta = expires_at - now;
    delta.to_std().map_err(|_| {
        anyhow::Error::new(ErrorMetadata::fatal(
            "ExpiredPresignRequest",
            format!("presigned URL expiration {expires_at} is not in the future"),
        ))
    })
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_file(&self, bucket: &str, key: &str, local_path: &Path) -> anyhow::Result<()> {
        let body = aws_sdk_s3::primitives::ByteStream::from_path(local_path)
            .await
            .map_err(|e| {
                anyhow::Error::new(e).context(ErrorMetadata::fatal(
                    "ObjectStoreError",
                    format!("failed to read {} for upload", local_path.display()),
                ))
            })?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                anyhow::Error::new(e).context(ErrorMetadata::service_unavailable(
                    "ObjectStoreError",
                    format!("failed to upload to {bucket}/{key}"),
                ))
            })?;
        tracing::info!(bucket, key, "uploaded archive to object storage");
        Ok(())
    }

    async fn generate_presigned_url(
        &self,
        bucket: &str,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let presigning_config = PresigningConfig::builder()
            .expires_in(expires_in(expires_at)?)
            .build()?;
        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| {
                anyhow::Error::new(e).context(ErrorMetadata::service_unavailable(
                    "ObjectStoreError",
                    format!("failed to presign GET for {bucket}/{key}"),
                ))
            })?;
        Ok(presigned.uri().to_owned())
    }
}

/// In-memory double. Captures uploaded bytes, keyed by `bucket/key`, so
/// tests can assert on archive contents without hitting the network.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, bytes::Bytes>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<bytes::Bytes> {
        self.objects
            .lock()
            .expect("object store lock poisoned")
            .get(&object_path(bucket, key))
            .cloned()
    }
}

fn object_path(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_file(&self, bucket: &str, key: &str, local_path: &Path) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(local_path).await.map_err(|e| {
            anyhow::Error::new(e).context(ErrorMetadata::fatal(
                "ObjectStoreError",
                format!("failed to read {} for upload", local_path.display()),
            ))
        })?;
        self.objects
            .lock()
            .expect("object store lock poisoned")
            .insert(object_path(bucket, key), bytes::Bytes::from(bytes));
        Ok(())
    }

    async fn generate_presigned_url(
        &self,
        bucket: &str,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        expires_in(expires_at)?;
        Ok(format!(
            "https://local-object-store.test/{}/{}?expires={}",
            bucket,
            key,
            expires_at.timestamp()
        ))
    }
}
