use crate::config::Config;
use crate::db::Database;
use crate::metrics::Metrics;
use crate::pipeline::DerivativePipeline;
use crate::rate_limit::RateLimiter;
use crate::warmup::WarmupJob;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub pipeline: DerivativePipeline,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: RateLimiter,
    pub warmup_tx: mpsc::Sender<WarmupJob>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Database,
        pipeline: DerivativePipeline,
        metrics: Arc<Metrics>,
        warmup_tx: mpsc::Sender<WarmupJob>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit_per_minute, config.rate_limit_burst);
        Self {
            config: Arc::new(config),
            db,
            pipeline,
            metrics,
            rate_limiter,
            warmup_tx,
        }
    }

    /// `debug=1` only counts when the deployment allows it.
    pub fn debug_honored(&self, requested: bool) -> bool {
        requested && self.config.debug_query_enabled
    }
}
