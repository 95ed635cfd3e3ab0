//! Request-driven derivative pipeline.
//!
//! `serve` validates the slug, looks the photo up, quantizes the width and
//! then either streams the cached derivative or generates one (source fetch,
//! compose, upload) and returns the fresh bytes in the same response.
//! Generation runs in a detached task so a disconnecting client does not
//! throw away finished work, and concurrent misses for one blob name are
//! collapsed onto a single leader.

use crate::config::Config;
use crate::db::{Database, Photo};
use crate::derivative::{derivative_blob_name, quantize_width, resolve_width, validate_slug};
use crate::metrics::Metrics;
use crate::singleflight::{Singleflight, SingleflightPermit};
use crate::storage::{BlobError, BlobStores, BlobStream};
use crate::watermark::Compositor;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::warn;

pub const DERIVATIVE_CONTENT_TYPE: &str = "image/jpeg";

/// Leaders a follower may outlast before generating on its own. Every round
/// shares the one compose deadline.
const FOLLOW_ATTEMPTS: usize = 3;

/// Logs at info when the request asked for diagnostics, at debug otherwise.
macro_rules! stage_event {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DerivativeError {
    #[error("invalid slug")]
    InvalidSlug,
    #[error("photo not found")]
    PhotoNotFound,
    #[error("source image not found")]
    SourceNotFound,
    #[error("unsupported source image")]
    UnsupportedImage,
    #[error("derivative generation timed out")]
    ComposeTimeout,
}

#[derive(Debug, Clone)]
pub struct DerivativeRequest {
    pub slug: String,
    pub width: Option<String>,
    pub refresh: bool,
    pub debug: bool,
    pub if_none_match: Option<String>,
}

impl DerivativeRequest {
    pub fn new(slug: impl Into<String>, width: Option<&str>) -> Self {
        Self {
            slug: slug.into(),
            width: width.map(str::to_string),
            refresh: false,
            debug: false,
            if_none_match: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Refresh,
    /// Missed, then served from the entry another request generated.
    Coalesced,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Refresh => "refresh",
            Self::Coalesced => "coalesced",
        }
    }

    pub fn header_value(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            _ => "MISS",
        }
    }
}

pub enum DerivativeBody {
    NotModified,
    Cached(BlobStream),
    Fresh(Bytes),
}

pub struct DerivativeResponse {
    pub blob_name: String,
    pub width: u32,
    pub cache: CacheStatus,
    pub content_length: Option<u64>,
    pub body: DerivativeBody,
}

impl DerivativeResponse {
    pub fn etag(&self) -> String {
        etag_for(&self.blob_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Existing,
    Generated,
}

/// Derivatives are immutable per blob name, so the name is a strong validator.
pub fn etag_for(blob_name: &str) -> String {
    format!("\"{}\"", blob_name)
}

fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match.split(',').any(|candidate| {
        let candidate = candidate.trim();
        candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == etag
    })
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub template_version: u32,
    pub max_source_bytes: u64,
    pub compose_timeout: Duration,
    pub max_concurrent_compositions: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            template_version: config.template_version,
            max_source_bytes: config.max_source_bytes,
            compose_timeout: config.compose_timeout,
            max_concurrent_compositions: config.max_concurrent_compositions,
        }
    }
}

#[derive(Clone)]
struct Job {
    slug: String,
    blob_name: String,
    source_key: String,
    width: u32,
    debug: bool,
}

enum Produced {
    Fresh(Bytes),
    Cached(CachedBlob),
}

struct CachedBlob {
    stream: BlobStream,
    size: Option<u64>,
}

#[derive(Clone)]
pub struct DerivativePipeline {
    db: Database,
    stores: BlobStores,
    compositor: Arc<Compositor>,
    singleflight: Singleflight,
    compose_semaphore: Arc<Semaphore>,
    metrics: Arc<Metrics>,
    settings: PipelineSettings,
}

impl DerivativePipeline {
    pub fn new(
        db: Database,
        stores: BlobStores,
        compositor: Arc<Compositor>,
        metrics: Arc<Metrics>,
        settings: PipelineSettings,
    ) -> Self {
        let permits = settings.max_concurrent_compositions.max(1);
        Self {
            db,
            stores,
            compositor,
            singleflight: Singleflight::new(),
            compose_semaphore: Arc::new(Semaphore::new(permits)),
            metrics,
            settings,
        }
    }

    pub async fn serve(&self, request: DerivativeRequest) -> Result<DerivativeResponse> {
        let result = self.serve_inner(&request).await;
        match &result {
            Ok(response) => {
                if !matches!(response.body, DerivativeBody::NotModified) {
                    self.metrics.observe_derivative_result(response.cache.as_str());
                }
            }
            Err(_) => self.metrics.observe_derivative_result("error"),
        }
        result
    }

    async fn serve_inner(&self, request: &DerivativeRequest) -> Result<DerivativeResponse> {
        let slug = validate_slug(&request.slug).map_err(|_| DerivativeError::InvalidSlug)?;
        let photo = self.lookup(slug).await?;
        let width = resolve_width(request.width.as_deref());
        let blob_name = derivative_blob_name(slug, width, self.settings.template_version);

        if !request.refresh {
            if let Some(if_none_match) = request.if_none_match.as_deref() {
                if etag_matches(if_none_match, &etag_for(&blob_name)) {
                    return Ok(DerivativeResponse {
                        blob_name,
                        width,
                        cache: CacheStatus::Hit,
                        content_length: None,
                        body: DerivativeBody::NotModified,
                    });
                }
            }
        }

        let job = Job {
            slug: slug.to_string(),
            source_key: photo.source_key().to_string(),
            blob_name,
            width,
            debug: request.debug,
        };

        if !request.refresh {
            if let Some(cached) = self.read_cached(&job).await {
                return Ok(DerivativeResponse {
                    blob_name: job.blob_name,
                    width,
                    cache: CacheStatus::Hit,
                    content_length: cached.size,
                    body: DerivativeBody::Cached(cached.stream),
                });
            }
        }

        let produced = self.produce(&job).await?;
        let (cache, content_length, body) = match produced {
            Produced::Fresh(bytes) => {
                let cache = if request.refresh {
                    CacheStatus::Refresh
                } else {
                    CacheStatus::Miss
                };
                (cache, Some(bytes.len() as u64), DerivativeBody::Fresh(bytes))
            }
            Produced::Cached(cached) => (
                CacheStatus::Coalesced,
                cached.size,
                DerivativeBody::Cached(cached.stream),
            ),
        };
        Ok(DerivativeResponse {
            blob_name: job.blob_name,
            width,
            cache,
            content_length,
            body,
        })
    }

    /// Makes sure the derivative for `(slug, width)` exists in the cache.
    pub async fn ensure(&self, slug: &str, width: u32) -> Result<EnsureOutcome> {
        let slug = validate_slug(slug).map_err(|_| DerivativeError::InvalidSlug)?;
        let photo = self.lookup(slug).await?;
        let width = quantize_width(width as i64);
        let job = Job {
            slug: slug.to_string(),
            source_key: photo.source_key().to_string(),
            blob_name: derivative_blob_name(slug, width, self.settings.template_version),
            width,
            debug: false,
        };
        match self.stores.watermarks.probe(&job.blob_name).await {
            Ok(probe) if probe.found => return Ok(EnsureOutcome::Existing),
            Ok(_) => {}
            Err(err) => {
                warn!(blob = %job.blob_name, error = ?err, "warmup cache probe failed");
                self.metrics.observe_cache_fail_open("probe_error");
            }
        }
        match self.produce(&job).await? {
            Produced::Fresh(_) => Ok(EnsureOutcome::Generated),
            Produced::Cached(_) => Ok(EnsureOutcome::Existing),
        }
    }

    async fn lookup(&self, slug: &str) -> Result<Photo> {
        let photo = self.db.find_photo_by_slug(slug).await?;
        match photo {
            Some(photo) if photo.published => Ok(photo),
            _ => Err(DerivativeError::PhotoNotFound.into()),
        }
    }

    /// Probe then stream. Every storage failure on this path is a miss.
    async fn read_cached(&self, job: &Job) -> Option<CachedBlob> {
        let started = Instant::now();
        let probe = self.stores.watermarks.probe(&job.blob_name).await;
        self.metrics.observe_stage_duration("probe", started.elapsed());
        let size = match probe {
            Ok(probe) if probe.found => probe.size,
            Ok(_) => {
                stage_event!(
                    job.debug,
                    slug = %job.slug,
                    blob = %job.blob_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "derivative cache miss"
                );
                return None;
            }
            Err(err) => {
                warn!(
                    container = self.stores.watermarks.container(),
                    blob = %job.blob_name,
                    error = ?err,
                    "cache probe failed; regenerating"
                );
                self.metrics.observe_cache_fail_open("probe_error");
                return None;
            }
        };
        match self.stores.watermarks.get_stream(&job.blob_name).await {
            Ok(stream) => {
                stage_event!(
                    job.debug,
                    slug = %job.slug,
                    blob = %job.blob_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "derivative cache hit"
                );
                Some(CachedBlob { stream, size })
            }
            Err(err) if err.is_not_found() => {
                warn!(blob = %job.blob_name, "cached derivative vanished after probe; regenerating");
                self.metrics.observe_cache_fail_open("vanished");
                None
            }
            Err(err) => {
                warn!(blob = %job.blob_name, error = ?err, "cached derivative download failed; regenerating");
                self.metrics.observe_cache_fail_open("stream_error");
                None
            }
        }
    }

    /// Generates or waits on whoever is generating. The caller gets an answer
    /// within one compose timeout whichever path it takes.
    async fn produce(&self, job: &Job) -> Result<Produced> {
        let deadline = tokio::time::Instant::now() + self.settings.compose_timeout;
        for _ in 0..FOLLOW_ATTEMPTS {
            let permit = self.singleflight.acquire(&job.blob_name);
            if permit.is_leader() {
                return self
                    .generate_detached(job, Some(permit), deadline)
                    .await
                    .map(Produced::Fresh);
            }
            let finished = permit.wait_result(deadline).await;
            match tokio::time::timeout_at(deadline, self.read_cached(job)).await {
                Ok(Some(cached)) => return Ok(Produced::Cached(cached)),
                Ok(None) if finished => {}
                _ => return Err(self.timed_out(job, "waiting on in-flight generation")),
            }
        }
        self.generate_detached(job, None, deadline)
            .await
            .map(Produced::Fresh)
    }

    /// Runs generation on its own task; the caller waits until `deadline`
    /// but the task keeps going and still fills the cache.
    async fn generate_detached(
        &self,
        job: &Job,
        permit: Option<SingleflightPermit>,
        deadline: tokio::time::Instant,
    ) -> Result<Bytes> {
        let pipeline = self.clone();
        let task_job = job.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            pipeline.generate(&task_job).await
        });
        match tokio::time::timeout_at(deadline, task).await {
            Ok(joined) => joined.context("derivative generation task failed")?,
            Err(_) => Err(self.timed_out(job, "derivative generation exceeded timeout")),
        }
    }

    fn timed_out(&self, job: &Job, stage: &'static str) -> anyhow::Error {
        warn!(
            slug = %job.slug,
            blob = %job.blob_name,
            timeout_ms = self.settings.compose_timeout.as_millis() as u64,
            stage,
            "derivative not ready before compose deadline"
        );
        DerivativeError::ComposeTimeout.into()
    }

    async fn generate(&self, job: &Job) -> Result<Bytes> {
        let started = Instant::now();
        let source = match self
            .stores
            .photos
            .get(&job.source_key, self.settings.max_source_bytes)
            .await
        {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                return Err(anyhow::Error::new(err).context(DerivativeError::SourceNotFound));
            }
            Err(err @ BlobError::TooLarge { .. }) => {
                return Err(anyhow::Error::new(err).context(DerivativeError::UnsupportedImage));
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("download source {}", job.source_key)));
            }
        };
        let fetch_elapsed = started.elapsed();
        self.metrics.observe_stage_duration("source_fetch", fetch_elapsed);
        stage_event!(
            job.debug,
            slug = %job.slug,
            source_key = %job.source_key,
            bytes = source.len(),
            elapsed_ms = fetch_elapsed.as_millis() as u64,
            "source fetched"
        );

        let permit = self
            .compose_semaphore
            .clone()
            .acquire_owned()
            .await
            .context("compose semaphore closed")?;
        self.record_compose_slots();
        let compositor = self.compositor.clone();
        let width = job.width;
        let compose_started = Instant::now();
        let composed = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            compositor.compose(&source, width)
        })
        .await
        .context("compose task failed")?;
        self.record_compose_slots();
        let composed = match composed {
            Ok(composed) => composed,
            Err(err) if err.is_unsupported_image() => {
                warn!(slug = %job.slug, source_key = %job.source_key, error = ?err, "source image rejected");
                return Err(anyhow::Error::new(err).context(DerivativeError::UnsupportedImage));
            }
            Err(err) => return Err(anyhow::Error::new(err).context("compose derivative")),
        };
        let compose_elapsed = compose_started.elapsed();
        self.metrics.observe_stage_duration("compose", compose_elapsed);
        stage_event!(
            job.debug,
            slug = %job.slug,
            width = composed.width,
            height = composed.height,
            elapsed_ms = compose_elapsed.as_millis() as u64,
            "derivative composed"
        );

        let upload_started = Instant::now();
        match self
            .stores
            .watermarks
            .put(&job.blob_name, composed.bytes.clone(), DERIVATIVE_CONTENT_TYPE)
            .await
        {
            Ok(()) => {
                let upload_elapsed = upload_started.elapsed();
                self.metrics.observe_stage_duration("upload", upload_elapsed);
                stage_event!(
                    job.debug,
                    blob = %job.blob_name,
                    bytes = composed.bytes.len(),
                    elapsed_ms = upload_elapsed.as_millis() as u64,
                    "derivative cached"
                );
            }
            Err(err) => {
                warn!(
                    container = self.stores.watermarks.container(),
                    blob = %job.blob_name,
                    error = ?err,
                    "derivative upload failed; serving uncached bytes"
                );
                self.metrics.observe_upload_failure();
            }
        }
        Ok(composed.bytes)
    }

    fn record_compose_slots(&self) {
        let max = self.settings.max_concurrent_compositions.max(1);
        let in_use = max.saturating_sub(self.compose_semaphore.available_permits());
        self.metrics.set_semaphore_in_use("compose", in_use as i64);
    }
}
