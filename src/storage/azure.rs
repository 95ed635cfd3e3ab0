use super::sas::{SasCache, SasPermission};
use super::{BlobError, BlobProbe, BlobResult, BlobStore, BlobStream, validate_key};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use reqwest::{StatusCode, header};
use url::Url;

#[derive(Debug, Clone)]
pub struct AzureBlobConfig {
    pub account: String,
    pub account_key: String,
    /// Overrides `https://<account>.blob.core.windows.net`, e.g. for Azurite.
    pub endpoint: Option<String>,
}

/// One Azure Blob container accessed over the REST API with per-blob SAS.
pub struct AzureBlobStore {
    container: String,
    base: Url,
    client: reqwest::Client,
    sas: SasCache,
}

impl AzureBlobStore {
    pub fn new(
        config: &AzureBlobConfig,
        container: &str,
        client: reqwest::Client,
        sas: SasCache,
    ) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", sas.account()));
        let base = Url::parse(&endpoint).with_context(|| format!("invalid blob endpoint {endpoint}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("blob endpoint {endpoint} cannot be a base url"));
        }
        Ok(Self {
            container: container.to_string(),
            base,
            client,
            sas,
        })
    }

    fn blob_url(&self, key: &str, permission: SasPermission) -> BlobResult<Url> {
        let key = validate_key(key)?;
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| BlobError::InvalidKey {
                key: key.to_string(),
            })?;
            segments.pop_if_empty().push(&self.container);
            segments.extend(key.split('/'));
        }
        let query = self
            .sas
            .token(&self.container, key, permission)
            .map_err(|_| BlobError::InvalidKey {
                key: key.to_string(),
            })?;
        url.set_query(Some(&query));
        Ok(url)
    }

    fn status_error(&self, key: &str, status: StatusCode) -> BlobError {
        if status == StatusCode::NOT_FOUND {
            return BlobError::NotFound {
                container: self.container.clone(),
                key: key.to_string(),
            };
        }
        BlobError::Upstream {
            status: status.as_u16(),
            container: self.container.clone(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn probe(&self, key: &str) -> BlobResult<BlobProbe> {
        let url = self.blob_url(key, SasPermission::Read)?;
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            status if status.is_success() => Ok(BlobProbe {
                found: true,
                size: content_length(response.headers()),
            }),
            StatusCode::NOT_FOUND => Ok(BlobProbe::missing()),
            status => Err(self.status_error(key, status)),
        }
    }

    async fn get(&self, key: &str, max_bytes: u64) -> BlobResult<Bytes> {
        let url = self.blob_url(key, SasPermission::Read)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(self.status_error(key, response.status()));
        }
        if let Some(length) = content_length(response.headers()) {
            if length > max_bytes {
                return Err(BlobError::TooLarge { limit: max_bytes });
            }
        }
        let mut buffer = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport_error)?;
            if (buffer.len() + chunk.len()) as u64 > max_bytes {
                return Err(BlobError::TooLarge { limit: max_bytes });
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    async fn get_stream(&self, key: &str) -> BlobResult<BlobStream> {
        let url = self.blob_url(key, SasPermission::Read)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(self.status_error(key, response.status()));
        }
        Ok(response
            .bytes_stream()
            .map_err(|err| std::io::Error::other(err.without_url()))
            .boxed())
    }

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> BlobResult<()> {
        let url = self.blob_url(key, SasPermission::Write)?;
        let response = self
            .client
            .put(url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, bytes.len())
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(self.status_error(key, response.status()));
        }
        Ok(())
    }
}

/// Request URLs carry the SAS token, so they are stripped before the error
/// can reach a log line.
fn transport_error(err: reqwest::Error) -> BlobError {
    BlobError::Transport(err.without_url())
}

fn content_length(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}
