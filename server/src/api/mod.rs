use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Tracker;

mod http;

pub struct Api {
    tracker: Arc<Tracker>,
}

#[derive(Clone)]
struct OriginConfig {
    allowed_origins: Arc<HashSet<String>>,
    allow_any_origin: bool,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

impl Api {
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self { tracker }
    }

    pub fn router(&self) -> Router {
        let allowed_origins = parse_allowed_origins("ALLOWED_HTTP_ORIGINS");
        let allow_any_origin = allowed_origins.is_empty() || allowed_origins.contains("*");
        if allowed_origins.is_empty() {
            tracing::warn!("ALLOWED_HTTP_ORIGINS is empty; accepting any browser origin");
        }
        let cors_origins = allowed_origins
            .iter()
            .filter(|origin| *origin != "*")
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Invalid origin in ALLOWED_HTTP_ORIGINS: {}", origin);
                    None
                }
            })
            .collect::<Vec<_>>();
        let origin_config = OriginConfig {
            allowed_origins: Arc::new(allowed_origins),
            allow_any_origin,
        };

        let cors = if allow_any_origin {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            CorsLayer::new().allow_origin(AllowOrigin::list(cors_origins))
        }
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([header::HeaderName::from_static("x-request-id")]);

        // Writes share one per-IP limiter; reads are unlimited.
        let submit_rate_per_min = parse_env_u64("RATE_LIMIT_SUBMIT_PER_MIN")
            .or(self.tracker.config.submit_rate_limit_per_minute);
        let submit_rate_burst = parse_env_u32("RATE_LIMIT_SUBMIT_BURST")
            .or(self.tracker.config.submit_rate_limit_burst);
        let submit_routes = Router::new()
            .route("/api/wallet", post(http::submit_progress))
            .route("/api/finish", post(http::submit_finish));
        let submit_routes = match submit_governor_config(submit_rate_per_min, submit_rate_burst) {
            Some(config) => submit_routes.layer(GovernorLayer { config }),
            None => submit_routes,
        };

        let router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/config", get(http::config))
            .route("/api/wallet/:address", get(http::wallet_details))
            .route("/api/leaderboard", get(http::leaderboard))
            .route("/metrics/http", get(http::http_metrics))
            .route("/metrics/referrals", get(http::referral_metrics))
            .route("/metrics/prometheus", get(http::prometheus_metrics))
            .merge(submit_routes);

        let router = router.layer(cors);
        let router = router.layer(middleware::from_fn(move |req, next| {
            let origin_config = origin_config.clone();
            async move { enforce_origin(origin_config, req, next).await }
        }));
        let router = match self.tracker.config.http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router,
        };
        let router = router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(
                    self.tracker.clone(),
                    request_id_middleware,
                )),
        );

        router.with_state(self.tracker.clone())
    }
}

fn submit_governor_config(
    rate_per_minute: Option<u64>,
    burst_size: Option<u32>,
) -> Option<Arc<IpGovernorConfig>> {
    match (rate_per_minute, burst_size) {
        (Some(rate_per_minute), Some(burst_size)) if rate_per_minute > 0 && burst_size > 0 => {
            let nanos_per_request = (60_000_000_000u64 / rate_per_minute).max(1);
            let period = Duration::from_nanos(nanos_per_request);
            tracing::info!(
                rate_per_minute,
                burst_size,
                period_ms = period.as_millis(),
                "Submit endpoint rate limit configured"
            );
            let config = GovernorConfigBuilder::default()
                .period(period)
                .burst_size(burst_size)
                .key_extractor(SmartIpKeyExtractor)
                .finish();
            if config.is_none() {
                tracing::warn!("invalid submit rate-limit config; submit routes are unlimited");
            }
            config.map(Arc::new)
        }
        _ => None,
    }
}

fn parse_allowed_origins(var: &str) -> HashSet<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn parse_env_u32(var: &str) -> Option<u32> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

/// Reject browser requests from origins outside the allow-list. Requests
/// without an `Origin` header (game servers, curl) pass through.
async fn enforce_origin(config: OriginConfig, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Some(origin) = origin {
        if !config.allow_any_origin && !config.allowed_origins.contains(origin) {
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }
    next.run(req).await
}

async fn request_id_middleware(
    AxumState(tracker): AxumState<Arc<Tracker>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    match response.status() {
        StatusCode::FORBIDDEN => tracker.http_metrics().inc_reject_origin(),
        StatusCode::PAYLOAD_TOO_LARGE => tracker.http_metrics().inc_reject_body_limit(),
        StatusCode::TOO_MANY_REQUESTS => tracker.http_metrics().inc_reject_rate_limit(),
        _ => {}
    }
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
