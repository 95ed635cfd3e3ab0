//! Blob storage seen by the derivative pipeline.
//!
//! Each [`BlobStore`] is bound to one container. The pipeline reads originals
//! and variants from the photos container and uses the watermarks container as
//! a read-through cache for generated derivatives.

mod azure;
mod local;
mod memory;
mod sas;

pub use azure::{AzureBlobConfig, AzureBlobStore};
pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use sas::{SasCache, SasSigner};

use crate::config::{BlobBackend, Config};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

pub type BlobStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {container}/{key}")]
    NotFound { container: String, key: String },
    #[error("invalid blob key")]
    InvalidKey { key: String },
    #[error("blob storage returned {status} for {container}/{key}")]
    Upstream {
        status: u16,
        container: String,
        key: String,
    },
    #[error("blob object exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("blob storage request failed")]
    Transport(#[source] reqwest::Error),
    #[error("blob storage io error")]
    Io(#[source] std::io::Error),
}

impl BlobError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type BlobResult<T> = std::result::Result<T, BlobError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobProbe {
    pub found: bool,
    pub size: Option<u64>,
}

impl BlobProbe {
    pub fn missing() -> Self {
        Self {
            found: false,
            size: None,
        }
    }

    pub fn found(size: u64) -> Self {
        Self {
            found: true,
            size: Some(size),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Container (namespace) this store is bound to.
    fn container(&self) -> &str;

    /// Metadata probe. Never transfers the object body.
    async fn probe(&self, key: &str) -> BlobResult<BlobProbe>;

    /// Full download. `max_bytes` bounds the buffered size.
    async fn get(&self, key: &str, max_bytes: u64) -> BlobResult<Bytes>;

    /// Streamed download. Missing objects fail before the stream is returned.
    async fn get_stream(&self, key: &str) -> BlobResult<BlobStream>;

    /// Unconditional overwrite.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> BlobResult<()>;
}

#[derive(Clone)]
pub struct BlobStores {
    pub photos: Arc<dyn BlobStore>,
    pub watermarks: Arc<dyn BlobStore>,
}

impl BlobStores {
    pub fn from_config(config: &Config) -> Result<Self> {
        match &config.blob_backend {
            BlobBackend::Local { root } => Ok(Self {
                photos: Arc::new(
                    LocalBlobStore::new(root, &config.photos_container)
                        .context("open local photos container")?,
                ),
                watermarks: Arc::new(
                    LocalBlobStore::new(root, &config.watermarks_container)
                        .context("open local watermarks container")?,
                ),
            }),
            BlobBackend::Azure(azure) => {
                let signer = SasSigner::new(&azure.account, &azure.account_key)?;
                let sas_cache = SasCache::new(signer, config.sas_ttl, config.sas_cache_capacity);
                let client = reqwest::Client::builder()
                    .timeout(config.blob_timeout)
                    .redirect(reqwest::redirect::Policy::none())
                    .build()
                    .context("build blob http client")?;
                Ok(Self {
                    photos: Arc::new(AzureBlobStore::new(
                        azure,
                        &config.photos_container,
                        client.clone(),
                        sas_cache.clone(),
                    )?),
                    watermarks: Arc::new(AzureBlobStore::new(
                        azure,
                        &config.watermarks_container,
                        client,
                        sas_cache,
                    )?),
                })
            }
            BlobBackend::Memory => Ok(Self {
                photos: Arc::new(MemoryBlobStore::new(&config.photos_container)),
                watermarks: Arc::new(MemoryBlobStore::new(&config.watermarks_container)),
            }),
        }
    }
}

/// Rejects keys that could escape a container: absolute paths, parent
/// components, backslashes, NULs and empty segments.
pub(crate) fn validate_key(key: &str) -> BlobResult<&str> {
    let invalid = || BlobError::InvalidKey {
        key: key.chars().take(200).collect(),
    };
    if key.is_empty() || key.len() > 1024 || key.starts_with('/') {
        return Err(invalid());
    }
    if key.contains('\0') || key.contains('\\') {
        return Err(invalid());
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid());
        }
    }
    Ok(key)
}
