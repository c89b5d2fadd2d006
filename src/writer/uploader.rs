use crate::config::types::{ObjectStoreBackend, ObjectStoreConfig};
use crate::event::ids;
use crate::writer::encoder::{CONTENT_TYPE, FILE_EXTENSION};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectMeta, ObjectStore, PutOptions, PutPayload};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("invalid object store config: {0}")]
    Config(String),

    #[error("cannot prepare {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Destination for encoded batches.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Store one encoded batch under a fresh key derived from `at`.
    async fn upload(&self, data: Bytes, at: DateTime<Utc>) -> Result<Path, UploadError>;
}

/// Writes encoded batches to an object store, one new key per batch.
#[derive(Debug, Clone)]
pub struct BatchUploader {
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
    content_type: bool,
}

impl BatchUploader {
    pub fn new(store: Arc<dyn ObjectStore>, key_prefix: &str) -> Self {
        Self {
            store,
            key_prefix: key_prefix.trim_matches('/').to_string(),
            content_type: true,
        }
    }

    /// Build the store described by `config`.
    ///
    /// The local filesystem backend cannot persist object attributes, so
    /// batches written there carry no content type.
    pub fn from_config(config: &ObjectStoreConfig, key_prefix: &str) -> Result<Self, UploadError> {
        let uploader = match config.backend {
            ObjectStoreBackend::Memory => Self::new(Arc::new(InMemory::new()), key_prefix),
            ObjectStoreBackend::Local => {
                let path = config.path.as_ref().ok_or_else(|| {
                    UploadError::Config("local backend requires object_store.path".to_string())
                })?;
                std::fs::create_dir_all(path).map_err(|source| UploadError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                let store = LocalFileSystem::new_with_prefix(path)?;
                let mut uploader = Self::new(Arc::new(store), key_prefix);
                uploader.content_type = false;
                uploader
            }
            ObjectStoreBackend::S3 => {
                let bucket = config.bucket.as_ref().ok_or_else(|| {
                    UploadError::Config("s3 backend requires object_store.bucket".to_string())
                })?;
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_allow_http(config.allow_http);
                if let Some(region) = &config.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(key_id) = &config.access_key_id {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(secret) = &config.secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                Self::new(Arc::new(builder.build()?), key_prefix)
            }
        };

        info!(
            backend = ?config.backend,
            key_prefix = %uploader.key_prefix,
            "Object store ready"
        );
        Ok(uploader)
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Root under which every batch is written: `<key_prefix>/parquet`.
    pub fn batch_root(&self) -> String {
        if self.key_prefix.is_empty() {
            FILE_EXTENSION.to_string()
        } else {
            format!("{}/{}", self.key_prefix, FILE_EXTENSION)
        }
    }

    /// `<key_prefix>/parquet/date=YYYY-MM-DD/hour=HH/batch-<16 hex>.parquet`
    pub fn object_key(&self, at: DateTime<Utc>) -> Path {
        Path::from(format!(
            "{}/date={}/hour={}/batch-{}.{}",
            self.batch_root(),
            at.format("%Y-%m-%d"),
            at.format("%H"),
            ids::batch_suffix(),
            FILE_EXTENSION
        ))
    }

    /// Keys under `prefix` (default: every batch), sorted.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectMeta>, UploadError> {
        let prefix = Path::from(prefix.map(str::to_string).unwrap_or_else(|| self.batch_root()));
        let mut objects: Vec<ObjectMeta> = self.store.list(Some(&prefix)).try_collect().await?;
        objects.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(objects)
    }

    pub async fn fetch(&self, key: &str) -> Result<Bytes, UploadError> {
        let result = self.store.get(&Path::from(key)).await?;
        Ok(result.bytes().await?)
    }
}

#[async_trait]
impl BatchSink for BatchUploader {
    async fn upload(&self, data: Bytes, at: DateTime<Utc>) -> Result<Path, UploadError> {
        let key = self.object_key(at);
        let mut options = PutOptions::default();
        if self.content_type {
            options.attributes = Attributes::from_iter([(Attribute::ContentType, CONTENT_TYPE)]);
        }
        self.store
            .put_opts(&key, PutPayload::from_bytes(data), options)
            .await?;
        Ok(key)
    }
}
