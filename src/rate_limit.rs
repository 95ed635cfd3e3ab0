use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const MAX_ENTRIES: usize = 10_000;
const EVICT_AFTER: Duration = Duration::from_secs(60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_seconds: u64,
}

impl RateLimitInfo {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_seconds: 0,
        }
    }
}

/// Per-client-IP token bucket guarding the derivative route.
#[derive(Clone)]
pub struct RateLimiter {
    enabled: bool,
    rate_per_second: f64,
    burst: f64,
    buckets: Arc<DashMap<IpAddr, Bucket>>,
    last_cleanup_epoch: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl RateLimiter {
    /// `rate_per_minute == 0` disables limiting; `burst == 0` means one
    /// minute's worth of requests.
    pub fn new(rate_per_minute: u64, burst: u64) -> Self {
        let burst = if burst == 0 {
            rate_per_minute.max(1)
        } else {
            burst
        };
        Self {
            enabled: rate_per_minute > 0,
            rate_per_second: rate_per_minute as f64 / 60.0,
            burst: burst as f64,
            buckets: Arc::new(DashMap::new()),
            last_cleanup_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn check(&self, ip: IpAddr) -> RateLimitInfo {
        if !self.enabled {
            return RateLimitInfo::unlimited();
        }
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> RateLimitInfo {
        self.maybe_cleanup(now);
        let mut entry = self.buckets.entry(ip).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
            last_seen: now,
        });
        let bucket = entry.value_mut();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.burst);
        bucket.last_refill = now;
        bucket.last_seen = now;
        let limit = self.burst.max(1.0).ceil() as u64;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return RateLimitInfo {
                allowed: true,
                limit,
                remaining: bucket.tokens.floor().max(0.0) as u64,
                reset_seconds: 0,
            };
        }
        RateLimitInfo {
            allowed: false,
            limit,
            remaining: 0,
            reset_seconds: ((1.0 - bucket.tokens) / self.rate_per_second)
                .ceil()
                .max(1.0) as u64,
        }
    }

    fn maybe_cleanup(&self, now: Instant) {
        if self.buckets.len() <= MAX_ENTRIES || !self.should_cleanup() {
            return;
        }
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) <= EVICT_AFTER);
        if self.buckets.len() > MAX_ENTRIES {
            let mut entries = self
                .buckets
                .iter()
                .map(|entry| (*entry.key(), entry.value().last_seen))
                .collect::<Vec<_>>();
            entries.sort_by_key(|(_, last_seen)| *last_seen);
            let overflow = entries.len().saturating_sub(MAX_ENTRIES);
            for (ip, _) in entries.into_iter().take(overflow) {
                self.buckets.remove(&ip);
            }
        }
    }

    fn should_cleanup(&self) -> bool {
        let now_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or(0);
        let last = self.last_cleanup_epoch.load(Ordering::Relaxed);
        if now_epoch.saturating_sub(last) < CLEANUP_INTERVAL.as_secs() {
            return false;
        }
        self.last_cleanup_epoch
            .compare_exchange(last, now_epoch, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
