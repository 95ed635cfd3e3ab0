use super::{BlobError, BlobProbe, BlobResult, BlobStore, BlobStream, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Process-local container. Counts every operation and can be told to fail,
/// which is how the cache fail-open paths get exercised.
#[derive(Clone)]
pub struct MemoryBlobStore {
    container: String,
    objects: Arc<DashMap<String, StoredBlob>>,
    counters: Arc<Counters>,
    faults: Arc<Faults>,
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Default)]
struct Counters {
    probes: AtomicUsize,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    fail_probe: AtomicBool,
    fail_get: AtomicBool,
    fail_put: AtomicBool,
    phantom_probe: AtomicBool,
    get_delay_ms: AtomicU64,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationCounts {
    pub probes: usize,
    pub gets: usize,
    pub puts: usize,
}

#[cfg(test)]
impl OperationCounts {
    pub fn total(&self) -> usize {
        self.probes + self.gets + self.puts
    }
}

impl MemoryBlobStore {
    pub fn new(container: &str) -> Self {
        Self {
            container: container.to_string(),
            objects: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            faults: Arc::new(Faults::default()),
        }
    }

    #[cfg(test)]
    pub fn counts(&self) -> OperationCounts {
        OperationCounts {
            probes: self.counters.probes.load(Ordering::Relaxed),
            gets: self.counters.gets.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub fn object(&self, key: &str) -> Option<StoredBlob> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: &str, bytes: impl Into<Bytes>, content_type: &str) {
        self.objects.insert(
            key.to_string(),
            StoredBlob {
                bytes: bytes.into(),
                content_type: content_type.to_string(),
            },
        );
    }

    #[cfg(test)]
    pub fn fail_probes(&self, enabled: bool) {
        self.faults.fail_probe.store(enabled, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn fail_gets(&self, enabled: bool) {
        self.faults.fail_get.store(enabled, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn fail_puts(&self, enabled: bool) {
        self.faults.fail_put.store(enabled, Ordering::Relaxed);
    }

    /// Holds every download for `delay`, standing in for a slow source.
    #[cfg(test)]
    pub fn delay_gets(&self, delay: Duration) {
        self.faults
            .get_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Probes report every key as present, as if another process deleted the
    /// object between the probe and the download.
    #[cfg(test)]
    pub fn phantom_probes(&self, enabled: bool) {
        self.faults.phantom_probe.store(enabled, Ordering::Relaxed);
    }

    fn not_found(&self, key: &str) -> BlobError {
        BlobError::NotFound {
            container: self.container.clone(),
            key: key.to_string(),
        }
    }

    fn injected(&self, key: &str) -> BlobError {
        BlobError::Upstream {
            status: 503,
            container: self.container.clone(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn probe(&self, key: &str) -> BlobResult<BlobProbe> {
        self.counters.probes.fetch_add(1, Ordering::Relaxed);
        let key = validate_key(key)?;
        if self.faults.fail_probe.load(Ordering::Relaxed) {
            return Err(self.injected(key));
        }
        if self.faults.phantom_probe.load(Ordering::Relaxed) {
            return Ok(BlobProbe::found(0));
        }
        Ok(self
            .objects
            .get(key)
            .map(|entry| BlobProbe::found(entry.bytes.len() as u64))
            .unwrap_or_else(BlobProbe::missing))
    }

    async fn get(&self, key: &str, max_bytes: u64) -> BlobResult<Bytes> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let key = validate_key(key)?;
        let delay_ms = self.faults.get_delay_ms.load(Ordering::Relaxed);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.faults.fail_get.load(Ordering::Relaxed) {
            return Err(self.injected(key));
        }
        let bytes = self
            .objects
            .get(key)
            .map(|entry| entry.bytes.clone())
            .ok_or_else(|| self.not_found(key))?;
        if bytes.len() as u64 > max_bytes {
            return Err(BlobError::TooLarge { limit: max_bytes });
        }
        Ok(bytes)
    }

    async fn get_stream(&self, key: &str) -> BlobResult<BlobStream> {
        let bytes = self.get(key, u64::MAX).await?;
        Ok(futures::stream::once(async move { Ok(bytes) }).boxed())
    }

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> BlobResult<()> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        let key = validate_key(key)?;
        if self.faults.fail_put.load(Ordering::Relaxed) {
            return Err(self.injected(key));
        }
        self.insert(key, bytes, content_type);
        Ok(())
    }
}
