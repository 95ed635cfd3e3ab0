use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub struct Metrics {
    registry: Registry,
    http_requests: IntCounterVec,
    derivative_requests: IntCounterVec,
    stage_duration: HistogramVec,
    cache_fail_open: IntCounterVec,
    upload_failures: IntCounter,
    warmup_jobs: IntCounterVec,
    inflight_requests: IntGauge,
    semaphore_in_use: IntGaugeVec,
    warmup_queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let http_requests = IntCounterVec::new(
            Opts::new(
                "wm_http_requests_total",
                "HTTP request count by route group, method, and status",
            ),
            &["route_group", "method", "status"],
        )
        .expect("http_requests_total");
        let derivative_requests = IntCounterVec::new(
            Opts::new(
                "wm_derivative_requests_total",
                "Derivative requests by result (hit, miss, refresh, error)",
            ),
            &["result"],
        )
        .expect("derivative_requests_total");
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "wm_stage_duration_seconds",
                "Derivative pipeline duration by stage",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0,
            ]),
            &["stage"],
        )
        .expect("stage_duration_seconds");
        let cache_fail_open = IntCounterVec::new(
            Opts::new(
                "wm_cache_fail_open_total",
                "Cache reads that fell through to generation, by kind",
            ),
            &["kind"],
        )
        .expect("cache_fail_open_total");
        let upload_failures = IntCounter::new(
            "wm_cache_upload_failures_total",
            "Derivative uploads that failed after a successful compose",
        )
        .expect("cache_upload_failures_total");
        let warmup_jobs = IntCounterVec::new(
            Opts::new("wm_warmup_jobs_total", "Warmup derivatives by outcome"),
            &["outcome"],
        )
        .expect("warmup_jobs_total");
        let inflight_requests = IntGauge::new("wm_inflight_requests", "Requests in flight")
            .expect("inflight_requests");
        let semaphore_in_use = IntGaugeVec::new(
            Opts::new("wm_semaphore_in_use", "Semaphore usage by kind"),
            &["kind"],
        )
        .expect("semaphore_in_use");
        let warmup_queue_depth = IntGauge::new("wm_warmup_queue_depth", "Warmup queue depth")
            .expect("warmup_queue_depth");

        registry
            .register(Box::new(http_requests.clone()))
            .expect("register http_requests");
        registry
            .register(Box::new(derivative_requests.clone()))
            .expect("register derivative_requests");
        registry
            .register(Box::new(stage_duration.clone()))
            .expect("register stage_duration");
        registry
            .register(Box::new(cache_fail_open.clone()))
            .expect("register cache_fail_open");
        registry
            .register(Box::new(upload_failures.clone()))
            .expect("register upload_failures");
        registry
            .register(Box::new(warmup_jobs.clone()))
            .expect("register warmup_jobs");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(semaphore_in_use.clone()))
            .expect("register semaphore_in_use");
        registry
            .register(Box::new(warmup_queue_depth.clone()))
            .expect("register warmup_queue_depth");

        Self {
            registry,
            http_requests,
            derivative_requests,
            stage_duration,
            cache_fail_open,
            upload_failures,
            warmup_jobs,
            inflight_requests,
            semaphore_in_use,
            warmup_queue_depth,
        }
    }

    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn inflight_guard(self: &Arc<Self>) -> InflightGuard {
        self.inflight_requests.inc();
        InflightGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn observe_http_request(&self, route_group: &str, method: &str, status: &str) {
        self.http_requests
            .with_label_values(&[route_group, method, status])
            .inc();
    }

    pub fn observe_derivative_result(&self, result: &str) {
        self.derivative_requests.with_label_values(&[result]).inc();
    }

    pub fn observe_stage_duration(&self, stage: &str, duration: Duration) {
        self.stage_duration
            .with_label_values(&[stage])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_cache_fail_open(&self, kind: &str) {
        self.cache_fail_open.with_label_values(&[kind]).inc();
    }

    pub fn observe_upload_failure(&self) {
        self.upload_failures.inc();
    }

    pub fn observe_warmup(&self, outcome: &str) {
        self.warmup_jobs.with_label_values(&[outcome]).inc();
    }

    pub fn set_semaphore_in_use(&self, kind: &str, in_use: i64) {
        self.semaphore_in_use.with_label_values(&[kind]).set(in_use);
    }

    pub fn set_warmup_queue_depth(&self, depth: i64) {
        self.warmup_queue_depth.set(depth);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InflightGuard {
    metrics: Arc<Metrics>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}
