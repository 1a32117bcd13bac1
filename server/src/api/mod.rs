use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Arena;

mod http;

pub(crate) const REQUEST_ID_HEADER: &str = "x-request-id";
pub(crate) const USER_ID_HEADER: &str = "x-user-id";
pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
pub(crate) const REPLAY_HEADER: &str = "x-idempotent-replay";

pub struct Api {
    arena: Arc<Arena>,
}

#[derive(Clone)]
struct OriginConfig {
    allowed_origins: Arc<HashSet<String>>,
    allow_any_origin: bool,
    allow_no_origin: bool,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

fn default_governor_config() -> Option<IpGovernorConfig> {
    GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .finish()
}

impl Api {
    pub fn new(arena: Arc<Arena>) -> Self {
        Self { arena }
    }

    pub fn router(&self) -> Router {
        let config = self.arena.config();
        // Environment variables override the configured origin policy.
        let allowed_origins = parse_allowed_origins("ALLOWED_HTTP_ORIGINS")
            .unwrap_or_else(|| config.allowed_origins.iter().cloned().collect());
        let allow_any_origin = allowed_origins.contains("*");
        let allow_no_origin =
            parse_allow_no_origin("ALLOW_HTTP_NO_ORIGIN").unwrap_or(config.allow_no_origin);
        if allowed_origins.is_empty() {
            tracing::warn!("no allowed HTTP origins; all browser origins will be rejected");
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
            allow_no_origin,
        };

        let cors = if allow_any_origin {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            CorsLayer::new().allow_origin(AllowOrigin::list(cors_origins))
        }
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static(REQUEST_ID_HEADER),
            header::HeaderName::from_static(USER_ID_HEADER),
            header::HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
        ])
        .expose_headers([
            header::HeaderName::from_static(REQUEST_ID_HEADER),
            header::HeaderName::from_static(REPLAY_HEADER),
        ]);

        let http_rate_per_sec =
            parse_env_u64("RATE_LIMIT_HTTP_PER_SEC").or(config.http_rate_limit_per_second);
        let http_rate_burst =
            parse_env_u32("RATE_LIMIT_HTTP_BURST").or(config.http_rate_limit_burst);
        let governor_conf = match (http_rate_per_sec, http_rate_burst) {
            (Some(rate_per_second), Some(burst_size)) if rate_per_second > 0 && burst_size > 0 => {
                let nanos_per_request = (1_000_000_000u64 / rate_per_second).max(1);
                let period = Duration::from_nanos(nanos_per_request);
                let config = GovernorConfigBuilder::default()
                    .period(period)
                    .burst_size(burst_size)
                    .key_extractor(SmartIpKeyExtractor)
                    .finish()
                    .or_else(|| {
                        tracing::warn!("invalid rate-limit config; falling back to defaults");
                        default_governor_config()
                    });
                config.map(Arc::new)
            }
            _ => None,
        };

        let router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/metrics/prometheus", get(http::prometheus_metrics))
            .route("/tournaments", post(http::create_tournament))
            .route("/tournaments/:id", get(http::get_tournament))
            .route("/tournaments/:id/matches", get(http::get_matches))
            .route("/tournaments/:id/register", post(http::register))
            .route("/tournaments/:id/join", post(http::register))
            .route("/tournaments/:id/leave", post(http::leave))
            .route(
                "/tournaments/:id/players/:user_id",
                delete(http::remove_player),
            )
            .route("/tournaments/:id/requests", get(http::list_requests))
            .route(
                "/tournaments/:id/requests/:team_id/approve",
                post(http::approve_request),
            )
            .route(
                "/tournaments/:id/requests/:team_id/reject",
                post(http::reject_request),
            )
            .route("/tournaments/:id/start", post(http::start_tournament))
            .route(
                "/prizes/tournament/:id/distribute",
                post(http::distribute_prizes),
            )
            .route("/prizes/tournament/:id/status", get(http::prize_status))
            .route("/referrals/apply", post(http::apply_referral));

        let router = match governor_conf {
            Some(config) => router.layer(GovernorLayer { config }),
            None => router,
        };
        let router = router.layer(cors);
        let router = router.layer(middleware::from_fn(move |req, next| {
            let origin_config = origin_config.clone();
            async move { enforce_origin(origin_config, req, next).await }
        }));
        let router = match config.http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router,
        };
        let router = router.layer(middleware::from_fn_with_state(
            self.arena.clone(),
            request_id_middleware,
        ));
        let router = router.layer(TraceLayer::new_for_http());

        router.with_state(self.arena.clone())
    }
}

/// `None` when the variable is unset, so configuration can apply.
fn parse_allowed_origins(var: &str) -> Option<HashSet<String>> {
    let raw = std::env::var(var).ok()?;
    Some(
        raw.split(',')
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect(),
    )
}

fn parse_allow_no_origin(var: &str) -> Option<bool> {
    let raw = std::env::var(var).ok()?;
    Some(matches!(
        raw.as_str(),
        "1" | "true" | "TRUE" | "yes" | "YES"
    ))
}

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn parse_env_u32(var: &str) -> Option<u32> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

async fn enforce_origin(config: OriginConfig, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Some(origin) = origin {
        if !config.allow_any_origin && !config.allowed_origins.contains(origin) {
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    } else if !config.allow_no_origin {
        return (StatusCode::FORBIDDEN, "Origin required").into_response();
    }
    next.run(req).await
}

async fn request_id_middleware(
    AxumState(arena): AxumState<Arc<Arena>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static(REQUEST_ID_HEADER))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let start = Instant::now();
    let mut response = next.run(req).await;
    // Engine errors carry a JSON envelope; only layer rejections are counted here.
    if !is_json(&response) {
        match response.status() {
            StatusCode::FORBIDDEN => arena.http_metrics().inc_reject_origin(),
            StatusCode::PAYLOAD_TOO_LARGE => arena.http_metrics().inc_reject_body_limit(),
            StatusCode::TOO_MANY_REQUESTS => arena.http_metrics().inc_reject_rate_limit(),
            _ => {}
        }
    }
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(header::HeaderName::from_static(REQUEST_ID_HEADER), header_value);
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        user_id = user_id.as_deref().unwrap_or("-"),
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .is_some_and(|value| value.as_bytes().starts_with(b"application/json"))
}
