#![allow(clippy::collapsible_if)]

mod config;
mod db;
mod derivative;
mod http;
mod metrics;
mod pipeline;
mod rate_limit;
mod singleflight;
mod state;
mod storage;
mod warmup;
mod watermark;

use crate::config::Config;
use crate::db::Database;
use crate::metrics::Metrics;
use crate::pipeline::{DerivativePipeline, PipelineSettings};
use crate::state::AppState;
use crate::storage::BlobStores;
use crate::watermark::Compositor;
use axum::Router;
use axum::body::HttpBody;
use axum::http::{Response, header};
use axum::middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::{
    CompressionLayer,
    predicate::{DefaultPredicate, Predicate},
};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{info, warn};

/// JPEG payloads are already compressed; gzip only costs CPU.
#[derive(Clone)]
struct NoImageCompression {
    inner: DefaultPredicate,
}

impl NoImageCompression {
    fn new() -> Self {
        Self {
            inner: DefaultPredicate::new(),
        }
    }
}

impl Predicate for NoImageCompression {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: HttpBody,
    {
        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            if let Ok(content_type) = content_type.to_str() {
                if content_type.starts_with("image/") {
                    return false;
                }
            }
        }
        self.inner.should_compress(response)
    }
}

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    let access_state = state.clone();
    http::router(state)
        .layer(CompressionLayer::new().compress_when(NoImageCompression::new()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
            header::SET_COOKIE,
        ]))
        .layer(middleware::from_fn(move |request, next| {
            let state = access_state.clone();
            async move { http::access_middleware(state, request, next).await }
        }))
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

/// Derivative names carry only the template version, so any template edit
/// keeps serving stale cached images until the version is bumped.
fn log_template_identity(config: &Config) {
    warn!(
        template_version = config.template_version,
        watermark_text = %config.watermark_text,
        watermark_font_family = %config.watermark_font_family,
        jpeg_quality = config.jpeg_quality,
        "cached derivatives are keyed by template version; bump WATERMARK_TEMPLATE_VERSION \
         after any watermark or jpeg quality change"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    info!(
        blob_backend = config.blob_backend.name(),
        photos_container = %config.photos_container,
        watermarks_container = %config.watermarks_container,
        template_version = config.template_version,
        max_concurrent_compositions = config.max_concurrent_compositions,
        compose_timeout_ms = config.compose_timeout.as_millis() as u64,
        rate_limit_per_minute = config.rate_limit_per_minute,
        debug_query_enabled = config.debug_query_enabled,
        admin_enabled = config.admin_token.is_some(),
        "startup config summary"
    );
    log_template_identity(&config);

    let db = Database::new(&config).await?;
    let stores = BlobStores::from_config(&config)?;
    let compositor = Arc::new(Compositor::from_config(&config)?);
    let metrics = Arc::new(Metrics::new());
    let pipeline = DerivativePipeline::new(
        db.clone(),
        stores,
        compositor,
        metrics.clone(),
        PipelineSettings::from_config(&config),
    );

    let (warmup_tx, warmup_rx) = mpsc::channel(config.warmup_queue_capacity.max(1));
    warmup::spawn_workers(
        pipeline.clone(),
        metrics.clone(),
        warmup_rx,
        config.warmup_workers,
    );

    let state = Arc::new(AppState::new(config, db, pipeline, metrics, warmup_tx));
    let app = build_app(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "derivative service listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
