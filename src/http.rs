use crate::config::Config;
use crate::derivative::validate_slug;
use crate::pipeline::{
    DERIVATIVE_CONTENT_TYPE, DerivativeBody, DerivativeError, DerivativeRequest,
    DerivativeResponse,
};
use crate::rate_limit::RateLimitInfo;
use crate::state::AppState;
use crate::warmup::{self, WarmRequest, WarmupJob, WarmupQueueError};
use axum::body::{Body, Bytes};
use axum::extract::rejection::PathRejection;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ipnet::IpNet;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use subtle::ConstantTimeEq;

const OPENAPI_YAML: &str = include_str!("../openapi.yaml");
const MAX_FORWARDED_IPS: usize = 20;
const RATE_LIMIT_RETRY_AFTER_SECONDS: &str = "60";
const QUEUE_FULL_RETRY_AFTER_SECONDS: &str = "5";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DerivativeQuery {
    pub w: Option<String>,
    pub refresh: Option<String>,
    pub debug: Option<String>,
}

impl DerivativeQuery {
    /// Lenient parse: unknown keys are ignored and the first occurrence of a
    /// repeated key wins.
    pub fn parse(raw: Option<&str>) -> Self {
        let mut query = Self::default();
        for (key, value) in url::form_urlencoded::parse(raw.unwrap_or_default().as_bytes()) {
            let slot = match key.as_ref() {
                "w" => &mut query.w,
                "refresh" => &mut query.refresh,
                "debug" => &mut query.debug,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        query
    }
}

/// Undecodable path parameters get the same JSON 400 as a malformed slug.
fn slug_param(path: Result<Path<String>, PathRejection>) -> Result<String, ApiError> {
    path.map(|Path(slug)| slug)
        .map_err(|rejection| {
            ApiError::bad_request("invalid slug").with_log_detail(rejection.body_text())
        })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/openapi.yaml", get(openapi_yaml))
        .route("/api/wm/{*slug}", get(serve_derivative))
        .route("/admin/wm/{slug}/warm", post(warm_derivative))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.db.ping().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(err) => {
            tracing::warn!(error = ?err, "health check database ping failed");
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "database unavailable").into_response()
        }
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let text = state.metrics.gather()?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
    );
    Ok((headers, text).into_response())
}

async fn openapi_yaml() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/yaml"),
    );
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    (headers, OPENAPI_YAML)
}

async fn serve_derivative(
    State(state): State<Arc<AppState>>,
    path: Result<Path<String>, PathRejection>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let slug = slug_param(path)?;
    let query = DerivativeQuery::parse(raw_query.as_deref());
    let debug = state.debug_honored(parse_flag(query.debug.as_deref()));
    let mut request = DerivativeRequest::new(slug, query.w.as_deref());
    request.refresh = parse_flag(query.refresh.as_deref());
    request.debug = debug;
    request.if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let response = state
        .pipeline
        .serve(request)
        .await
        .map_err(|err| map_derivative_error(err, debug))?;
    Ok(to_http_response(&state.config, response))
}

fn to_http_response(config: &Config, response: DerivativeResponse) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(etag) = HeaderValue::from_str(&response.etag()) {
        headers.insert(header::ETAG, etag);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(&cache_control(config))
            .unwrap_or(HeaderValue::from_static("no-store")),
    );
    if matches!(response.body, DerivativeBody::NotModified) {
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }

    let cache_label = response.cache.header_value();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(DERIVATIVE_CONTENT_TYPE),
    );
    headers.insert("X-Cache", HeaderValue::from_static(cache_label));
    headers.insert(
        "Server-Timing",
        HeaderValue::from_str(&format!("cache;desc=\"{cache_label}\""))
            .unwrap_or(HeaderValue::from_static("cache")),
    );
    headers.insert("X-Derivative-Width", HeaderValue::from(response.width));
    match response.body {
        DerivativeBody::Cached(stream) => {
            if let Some(length) = response.content_length {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            }
            (headers, Body::from_stream(stream)).into_response()
        }
        DerivativeBody::Fresh(bytes) => (headers, bytes).into_response(),
        DerivativeBody::NotModified => (StatusCode::NOT_MODIFIED, headers).into_response(),
    }
}

/// Browsers always revalidate; shared caches keep the response for the CDN window.
fn cache_control(config: &Config) -> String {
    format!(
        "public, max-age=0, s-maxage={}, stale-while-revalidate={}",
        config.cdn_cache_seconds, config.stale_while_revalidate_seconds
    )
}

async fn warm_derivative(
    State(state): State<Arc<AppState>>,
    path: Result<Path<String>, PathRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Some(admin_token) = state.config.admin_token.as_deref() else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "not found"));
    };
    if !is_authorized(&headers, admin_token) {
        return Err(
            ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized").with_header(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            ),
        );
    }
    let slug = slug_param(path)?;
    let slug = validate_slug(&slug)
        .map_err(|_| ApiError::bad_request("invalid slug"))?
        .to_string();
    let request = if body.is_empty() {
        WarmRequest::default()
    } else {
        serde_json::from_slice::<WarmRequest>(&body).map_err(|err| {
            ApiError::bad_request("invalid warm request").with_log_detail(err.to_string())
        })?
    };
    match state.db.find_photo_by_slug(&slug).await? {
        Some(photo) if photo.published => {}
        _ => return Err(ApiError::new(StatusCode::NOT_FOUND, "photo not found")),
    }

    let widths = warmup::plan_widths(request.widths.as_deref(), &state.config.warmup_widths);
    let queued = widths.len();
    let job = WarmupJob {
        slug: slug.clone(),
        widths: widths.clone(),
    };
    warmup::try_enqueue(&state.warmup_tx, &state.metrics, job).map_err(map_warmup_error)?;
    tracing::info!(slug = %slug, ?widths, "warmup job queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "slug": slug,
            "widths": widths,
            "queued": queued
        })),
    )
        .into_response())
}

fn is_authorized(headers: &HeaderMap, admin_token: &str) -> bool {
    match extract_bearer_token(headers) {
        Some(token) => bool::from(token.as_bytes().ct_eq(admin_token.as_bytes())),
        None => false,
    }
}

fn parse_flag(raw: Option<&str>) -> bool {
    raw.map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_lowercase())
        .map(|value| value == "1" || value == "true" || value == "yes")
        .unwrap_or(false)
}

/// Counts requests per route group and enforces the per-IP limit on the
/// derivative route.
pub async fn access_middleware(
    state: Arc<AppState>,
    request: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route_group = route_group(&path);
    let _inflight = state.metrics.inflight_guard();

    if route_group == "derivative" {
        if let Some(ip) = client_ip(&request, &state) {
            let info = state.rate_limiter.check(ip);
            if !info.allowed {
                tracing::debug!(ip = %ip, path = %path, "rate limited");
                let response = rate_limit_response(Some(info));
                observe_response(&state, route_group, &method, &response);
                return response;
            }
        }
    }

    let response = next.run(request).await;
    if response.status().is_server_error() {
        if let Some(context) = response.extensions().get::<ErrorLogContext>() {
            tracing::warn!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                detail = %context.detail,
                "request failed"
            );
        }
    }
    observe_response(&state, route_group, &method, &response);
    response
}

fn observe_response(
    state: &AppState,
    route_group: &str,
    method: &axum::http::Method,
    response: &Response,
) {
    state
        .metrics
        .observe_http_request(route_group, method.as_str(), response.status().as_str());
}

fn rate_limit_response(info: Option<RateLimitInfo>) -> Response {
    let mut response =
        ApiError::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    let retry_after = info
        .as_ref()
        .map(|info| info.reset_seconds)
        .filter(|value| *value > 0)
        .unwrap_or_else(|| RATE_LIMIT_RETRY_AFTER_SECONDS.parse().unwrap_or(60));
    let _ = response.headers_mut().insert(
        header::RETRY_AFTER,
        HeaderValue::from_str(&retry_after.to_string())
            .unwrap_or(HeaderValue::from_static(RATE_LIMIT_RETRY_AFTER_SECONDS)),
    );
    if let Some(info) = info {
        let _ = response
            .headers_mut()
            .insert("X-RateLimit-Limit", HeaderValue::from(info.limit));
        let _ = response
            .headers_mut()
            .insert("X-RateLimit-Remaining", HeaderValue::from(info.remaining));
        let _ = response
            .headers_mut()
            .insert("X-RateLimit-Reset", HeaderValue::from(info.reset_seconds));
    }
    response
}

pub(crate) fn client_ip(request: &axum::http::Request<Body>, state: &AppState) -> Option<IpAddr> {
    let peer_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    if state.config.trusted_proxies.is_empty() {
        return peer_ip;
    }
    let peer_ip = peer_ip?;
    let trusted = state
        .config
        .trusted_proxies
        .iter()
        .any(|net| net.contains(&peer_ip));
    if !trusted {
        return Some(peer_ip);
    }
    let mut forwarded = parse_forwarded_chain(request.headers());
    if forwarded.len() > MAX_FORWARDED_IPS {
        forwarded.truncate(MAX_FORWARDED_IPS);
    }
    Some(select_client_ip(
        forwarded,
        &state.config.trusted_proxies,
        peer_ip,
    ))
}

/// Walks the chain from the nearest hop and returns the first untrusted address.
fn select_client_ip(mut forwarded: Vec<IpAddr>, trusted: &[IpNet], peer_ip: IpAddr) -> IpAddr {
    forwarded.push(peer_ip);
    for ip in forwarded.iter().rev() {
        let is_trusted = trusted.iter().any(|net| net.contains(ip));
        if !is_trusted {
            return *ip;
        }
    }
    peer_ip
}

fn parse_forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    if let Some(value) = headers.get("x-forwarded-for") {
        if let Ok(value) = value.to_str() {
            return parse_x_forwarded_for(value);
        }
    }
    if let Some(value) = headers.get("forwarded") {
        if let Ok(value) = value.to_str() {
            return parse_forwarded_header(value);
        }
    }
    Vec::new()
}

fn parse_x_forwarded_for(value: &str) -> Vec<IpAddr> {
    value
        .split(',')
        .filter_map(|item| parse_ip_candidate(item.trim()))
        .take(MAX_FORWARDED_IPS)
        .collect()
}

fn parse_forwarded_header(value: &str) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for segment in value.split(',') {
        for pair in segment.split(';') {
            if ips.len() >= MAX_FORWARDED_IPS {
                return ips;
            }
            let Some((key, value)) = pair.trim().split_once('=') else {
                continue;
            };
            if !key.trim().eq_ignore_ascii_case("for") {
                continue;
            }
            if let Some(ip) = parse_ip_candidate(value.trim().trim_matches('"')) {
                ips.push(ip);
            }
        }
    }
    ips
}

fn parse_ip_candidate(value: &str) -> Option<IpAddr> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown") {
        return None;
    }
    if let Some(bracketed) = trimmed.strip_prefix('[') {
        if let Some(end) = bracketed.find(']') {
            if let Ok(addr) = bracketed[..end].parse::<IpAddr>() {
                return Some(addr);
            }
        }
    }
    if let Ok(addr) = trimmed.parse::<IpAddr>() {
        return Some(addr);
    }
    if let Some((host, _)) = trimmed.rsplit_once(':') {
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Some(addr);
        }
    }
    None
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let mut parts = value.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token)
    } else {
        None
    }
}

fn route_group(path: &str) -> &'static str {
    if path.starts_with("/api/wm/") {
        return "derivative";
    }
    if path.starts_with("/admin") {
        return "admin";
    }
    match path {
        "/healthz" => "health",
        "/metrics" => "metrics",
        _ => "other",
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
    pub headers: HeaderMap,
    pub log_detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }),
            headers: HeaderMap::new(),
            log_detail: None,
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn with_log_detail(mut self, detail: String) -> Self {
        if !detail.is_empty() {
            self.log_detail = Some(detail);
        }
        self
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "request failed")
            .with_log_detail(format!("{error:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        response.headers_mut().extend(self.headers);
        if let Some(detail) = self.log_detail {
            response.extensions_mut().insert(ErrorLogContext { detail });
        }
        response
    }
}

#[derive(Clone)]
struct ErrorLogContext {
    detail: String,
}

fn map_warmup_error(error: WarmupQueueError) -> ApiError {
    match error {
        WarmupQueueError::QueueFull => {
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "warmup queue full")
                .with_field("queue_full", Value::Bool(true))
                .with_header(
                    header::RETRY_AFTER,
                    HeaderValue::from_static(QUEUE_FULL_RETRY_AFTER_SECONDS),
                )
        }
        WarmupQueueError::Closed => {
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "warmup unavailable")
                .with_log_detail(error.to_string())
        }
    }
}

/// The body only carries the error chain when the request's debug flag was honored.
fn map_derivative_error(error: anyhow::Error, debug: bool) -> ApiError {
    let detail = format!("{error:#}");
    let mapped = match error.downcast_ref::<DerivativeError>() {
        Some(DerivativeError::InvalidSlug) => ApiError::bad_request("invalid slug"),
        Some(DerivativeError::PhotoNotFound) => {
            ApiError::new(StatusCode::NOT_FOUND, "photo not found")
        }
        Some(DerivativeError::SourceNotFound) => {
            ApiError::new(StatusCode::NOT_FOUND, "source image not found")
        }
        Some(DerivativeError::UnsupportedImage) => {
            tracing::warn!(error = ?error, "source image could not be processed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "unsupported source image")
        }
        Some(DerivativeError::ComposeTimeout) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "derivative generation timed out")
        }
        None => {
            tracing::warn!(error = ?error, "derivative request failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "derivative generation failed")
        }
    };
    let mapped = if debug {
        mapped.with_field("detail", Value::String(detail.clone()))
    } else {
        mapped
    };
    mapped.with_log_detail(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::pipeline::tests::harness;
    use crate::state::tests::test_state;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(state: Arc<AppState>) -> Router {
        let access_state = state.clone();
        router(state).layer(axum::middleware::from_fn(move |request, next| {
            let state = access_state.clone();
            async move { access_middleware(state, request, next).await }
        }))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn openapi_yaml_parses() {
        let spec: openapiv3::OpenAPI =
            serde_yaml::from_str(OPENAPI_YAML).expect("valid openapi yaml");
        assert!(spec.openapi.starts_with('3'));
        assert!(spec.paths.paths.contains_key("/api/wm/{slug}"));
        assert!(spec.paths.paths.contains_key("/admin/wm/{slug}/warm"));
    }

    #[tokio::test]
    async fn serves_quantized_jpeg_with_cache_headers() {
        let h = harness().await;
        let (state, _rx) = test_state(&h, test_config());
        let app = app(state);

        let response = app
            .clone()
            .oneshot(get_request("/api/wm/sample-photo?w=1000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(headers["X-Cache"], "MISS");
        assert_eq!(headers["Server-Timing"], "cache;desc=\"MISS\"");
        assert_eq!(headers[header::ETAG], "\"sample-photo_wm_1024_v1.jpg\"");
        assert_eq!(
            headers[header::CACHE_CONTROL],
            "public, max-age=0, s-maxage=2592000, stale-while-revalidate=86400"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 1024);
        assert_eq!(decoded.height(), 683);

        let response = app
            .oneshot(get_request("/api/wm/sample-photo?w=1000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-Cache"], "HIT");
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            bytes.len().to_string().as_str()
        );
        let cached = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(cached, bytes);
    }

    #[tokio::test]
    async fn bad_slugs_are_rejected_before_storage() {
        let h = harness().await;
        let (state, _rx) = test_state(&h, test_config());
        let app = app(state);
        for uri in ["/api/wm/../etc", "/api/wm/UPPERCASE", "/api/wm/a/b"] {
            let response = app.clone().oneshot(get_request(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(json_body(response).await["error"], "invalid slug");
        }
        assert_eq!(h.photos.counts().total(), 0);
        assert_eq!(h.watermarks.counts().total(), 0);
    }

    #[tokio::test]
    async fn repeated_width_takes_the_first_value() {
        let h = harness().await;
        let (state, _rx) = test_state(&h, test_config());
        let response = app(state)
            .oneshot(get_request("/api/wm/sample-photo?w=1000&w=2000&refresh=0&refresh=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-Derivative-Width"], "1024");
        assert_eq!(response.headers()["X-Cache"], "MISS");
        assert_eq!(h.watermarks.counts().puts, 1);
    }

    #[tokio::test]
    async fn undecodable_slug_is_json_400() {
        let h = harness().await;
        let (state, _rx) = test_state(&h, test_config());
        let response = app(state)
            .oneshot(get_request("/api/wm/%FF%FE"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(json_body(response).await["error"], "invalid slug");
        assert_eq!(h.photos.counts().total(), 0);
    }

    #[test]
    fn query_parsing_is_first_wins_and_lenient() {
        let query = DerivativeQuery::parse(Some("w=%31%30%30&w=2000&debug=1&x=&refresh"));
        assert_eq!(query.w.as_deref(), Some("100"));
        assert_eq!(query.debug.as_deref(), Some("1"));
        assert_eq!(query.refresh.as_deref(), Some(""));
        assert_eq!(DerivativeQuery::parse(None), DerivativeQuery::default());
    }

    #[tokio::test]
    async fn missing_photo_is_404_without_detail() {
        let h = harness().await;
        let (state, _rx) = test_state(&h, test_config());
        let response = app(state)
            .oneshot(get_request("/api/wm/does-not-exist?debug=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"], "photo not found");
        assert!(body.get("detail").is_none());
    }

    #[tokio::test]
    async fn honored_debug_adds_error_detail() {
        let h = harness().await;
        h.db.insert_photo("broken", "originals/broken.jpg", true, &[])
            .await
            .unwrap();
        h.photos
            .insert("originals/broken.jpg", &b"not an image"[..], "image/jpeg");
        let mut config = test_config();
        config.debug_query_enabled = true;
        let (state, _rx) = test_state(&h, config);
        let app = app(state);

        let response = app
            .clone()
            .oneshot(get_request("/api/wm/broken"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "unsupported source image");
        assert!(body.get("detail").is_none());

        let response = app
            .oneshot(get_request("/api/wm/broken?debug=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["detail"].as_str().unwrap().contains("unsupported source image"));
    }

    #[tokio::test]
    async fn matching_if_none_match_is_not_modified() {
        let h = harness().await;
        let (state, _rx) = test_state(&h, test_config());
        let request = Request::builder()
            .uri("/api/wm/sample-photo?w=2048")
            .header(header::IF_NONE_MATCH, "\"sample-photo_wm_2048_v1.jpg\"")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(
            response.headers()[header::ETAG],
            "\"sample-photo_wm_2048_v1.jpg\""
        );
        assert_eq!(h.watermarks.counts().total(), 0);
    }

    #[tokio::test]
    async fn rate_limit_applies_per_client_ip() {
        let h = harness().await;
        let mut config = test_config();
        config.rate_limit_per_minute = 1;
        config.rate_limit_burst = 1;
        let (state, _rx) = test_state(&h, config);
        let app = app(state);
        let request = |last: u8| {
            let mut request = get_request("/api/wm/does-not-exist");
            request
                .extensions_mut()
                .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, last], 40000))));
            request
        };

        let first = app.clone().oneshot(request(7)).await.unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);
        let limited = app.clone().oneshot(request(7)).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(limited.headers()["X-RateLimit-Limit"], "1");
        let other = app.oneshot(request(8)).await.unwrap();
        assert_eq!(other.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn warm_endpoint_requires_configured_token() {
        let h = harness().await;
        let (state, _rx) = test_state(&h, test_config());
        let request = Request::builder()
            .method("POST")
            .uri("/admin/wm/sample-photo/warm")
            .header(header::AUTHORIZATION, "Bearer anything")
            .body(Body::empty())
            .unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn warm_endpoint_queues_jobs() {
        let h = harness().await;
        let mut config = test_config();
        config.admin_token = Some("s3cret-admin-token".to_string());
        config.warmup_queue_capacity = 1;
        let (state, mut rx) = test_state(&h, config);
        let app = app(state);
        let warm = |token: &str, body: &'static str| {
            Request::builder()
                .method("POST")
                .uri("/admin/wm/sample-photo/warm")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let response = app.clone().oneshot(warm("wrong", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(warm("s3cret-admin-token", r#"{"sizes":[1]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(warm("s3cret-admin-token", r#"{"widths":[1000,4000]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["queued"], 2);

        let response = app
            .clone()
            .oneshot(warm("s3cret-admin-token", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");

        let job = rx.recv().await.unwrap();
        assert_eq!(job.slug, "sample-photo");
        assert_eq!(job.widths, vec![1024, 4096]);

        let request = Request::builder()
            .method("POST")
            .uri("/admin/wm/draft-photo/warm")
            .header(header::AUTHORIZATION, "Bearer s3cret-admin-token")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_and_health_endpoints() {
        let h = harness().await;
        let (state, _rx) = test_state(&h, test_config());
        let app = app(state);
        let response = app.clone().oneshot(get_request("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        app.clone()
            .oneshot(get_request("/api/wm/does-not-exist"))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("wm_derivative_requests_total{result=\"error\"} 1"));
        assert!(text.contains(
            "wm_http_requests_total{method=\"GET\",route_group=\"derivative\",status=\"404\"} 1"
        ));
    }

    #[test]
    fn forwarded_chain_skips_trusted_hops() {
        let trusted: Vec<IpNet> = vec!["10.0.0.0/8".parse().unwrap()];
        let chain = parse_x_forwarded_for("198.51.100.4, 10.1.2.3");
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            select_client_ip(chain, &trusted, peer),
            "198.51.100.4".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            parse_forwarded_header("for=\"[2001:db8::1]:4711\";proto=https, for=192.0.2.60"),
            vec![
                "2001:db8::1".parse::<IpAddr>().unwrap(),
                "192.0.2.60".parse::<IpAddr>().unwrap()
            ]
        );
        assert!(parse_ip_candidate("unknown").is_none());
    }

    #[test]
    fn flags_and_route_groups() {
        assert!(parse_flag(Some("1")));
        assert!(parse_flag(Some("TRUE")));
        assert!(!parse_flag(Some("0")));
        assert!(!parse_flag(None));
        assert_eq!(route_group("/api/wm/a"), "derivative");
        assert_eq!(route_group("/admin/wm/a/warm"), "admin");
        assert_eq!(route_group("/metrics"), "metrics");
    }
}
