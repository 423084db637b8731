use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, header::HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::{GovernorConfig, GovernorConfigBuilder},
    key_extractor::SmartIpKeyExtractor,
    GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{Service, ServiceConfig};

mod http;

const REQUEST_ID: &str = "x-request-id";

type JoinLimiter = GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

pub struct Api {
    service: Arc<Service>,
}

impl Api {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }

    /// The join limiter keys on client IP, so serve with
    /// `into_make_service_with_connect_info` when it is enabled.
    pub fn router(&self) -> Router {
        let origins = OriginPolicy::from_env();
        let cors = origins.cors();

        let mut joins = Router::new()
            .route("/challenges", post(http::join))
            .route("/challenges/join", post(http::join));
        if let Some(config) = join_limiter(&self.service.config) {
            joins = joins.layer(GovernorLayer { config });
        }

        let mut router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/config", get(http::config))
            .route("/metrics/challenges", get(http::challenge_metrics))
            .route("/metrics/http", get(http::http_metrics))
            .route("/challenges/results", get(http::list_challenges))
            .route("/challenges/:id", get(http::get_challenge))
            .route("/players/:player_id/eligibility", get(http::eligibility))
            .route("/prize-pool", get(http::prize_pool))
            .merge(joins)
            .layer(cors)
            .layer(middleware::from_fn(move |req, next| {
                let origins = origins.clone();
                async move { origins.enforce(req, next).await }
            }));
        if let Some(limit) = self.service.config.http_body_limit_bytes.filter(|l| *l > 0) {
            router = router.layer(DefaultBodyLimit::max(limit));
        }
        router
            .layer(middleware::from_fn_with_state(
                self.service.clone(),
                track_request,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.service.clone())
    }
}

/// Browser origin gate. `*` in `ALLOWED_HTTP_ORIGINS` admits any origin;
/// requests without an `Origin` header pass only with `ALLOW_HTTP_NO_ORIGIN`.
#[derive(Clone, Debug, Default)]
struct OriginPolicy {
    allowed: Arc<HashSet<String>>,
    any: bool,
    allow_missing: bool,
}

impl OriginPolicy {
    fn from_env() -> Self {
        let allowed: HashSet<String> = std::env::var("ALLOWED_HTTP_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();
        if allowed.is_empty() {
            tracing::warn!("ALLOWED_HTTP_ORIGINS is empty; all browser origins will be rejected");
        }
        Self {
            any: allowed.contains("*"),
            allowed: Arc::new(allowed),
            allow_missing: env_flag("ALLOW_HTTP_NO_ORIGIN"),
        }
    }

    fn check(&self, origin: Option<&str>) -> Result<(), &'static str> {
        match origin {
            Some(origin) if self.any || self.allowed.contains(origin) => Ok(()),
            Some(_) => Err("Origin not allowed"),
            None if self.allow_missing => Ok(()),
            None => Err("Origin required"),
        }
    }

    async fn enforce(&self, req: Request, next: Next) -> Response {
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        if let Err(reason) = self.check(origin) {
            return (StatusCode::FORBIDDEN, reason).into_response();
        }
        next.run(req).await
    }

    fn cors(&self) -> CorsLayer {
        let allow_origin = if self.any {
            AllowOrigin::any()
        } else {
            AllowOrigin::list(self.allowed.iter().filter_map(|origin| {
                HeaderValue::from_str(origin)
                    .map_err(|_| tracing::warn!(origin = %origin, "invalid allowed origin"))
                    .ok()
            }))
        };
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static(REQUEST_ID),
            ])
            .expose_headers([HeaderName::from_static(REQUEST_ID)])
    }
}

/// Per-IP limiter for the join routes. `RATE_LIMIT_HTTP_PER_SEC` and
/// `RATE_LIMIT_HTTP_BURST` override the config; zero disables it.
fn join_limiter(config: &ServiceConfig) -> Option<Arc<JoinLimiter>> {
    let per_second =
        env_parse::<u64>("RATE_LIMIT_HTTP_PER_SEC").or(config.http_rate_limit_per_second)?;
    let burst = env_parse::<u32>("RATE_LIMIT_HTTP_BURST").or(config.http_rate_limit_burst)?;
    if per_second == 0 || burst == 0 {
        return None;
    }
    let period = Duration::from_nanos((1_000_000_000 / per_second).max(1));
    let limiter = GovernorConfigBuilder::default()
        .period(period)
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish();
    if limiter.is_none() {
        tracing::warn!(per_second, burst, "invalid join rate limit; joins are unthrottled");
    }
    limiter.map(Arc::new)
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|value| value.trim().parse().ok())
}

fn env_flag(var: &str) -> bool {
    matches!(
        std::env::var(var).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

/// Tags the response with a request id, counts middleware rejections and
/// emits one `http.request` line.
async fn track_request(
    AxumState(service): AxumState<Arc<Service>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(req).await;
    let status = response.status().as_u16();
    service.http_metrics().record_status(status);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID), value);
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allowed: &[&str], allow_missing: bool) -> OriginPolicy {
        let allowed: HashSet<String> = allowed.iter().map(|value| value.to_string()).collect();
        OriginPolicy {
            any: allowed.contains("*"),
            allowed: Arc::new(allowed),
            allow_missing,
        }
    }

    #[test]
    fn listed_origins_pass_and_others_are_refused() {
        let policy = policy(&["https://play.example"], false);
        assert_eq!(policy.check(Some("https://play.example")), Ok(()));
        assert_eq!(policy.check(Some("https://evil.example")), Err("Origin not allowed"));
        assert_eq!(policy.check(None), Err("Origin required"));
    }

    #[test]
    fn wildcard_and_missing_origin_flags() {
        let policy = policy(&["*"], true);
        assert_eq!(policy.check(Some("https://anything.example")), Ok(()));
        assert_eq!(policy.check(None), Ok(()));
    }

    #[test]
    fn join_limiter_needs_rate_and_burst() {
        let config = ServiceConfig {
            http_rate_limit_per_second: Some(10),
            http_rate_limit_burst: Some(0),
            ..ServiceConfig::default()
        };
        assert!(join_limiter(&config).is_none());

        let config = ServiceConfig {
            http_rate_limit_per_second: None,
            ..config
        };
        assert!(join_limiter(&config).is_none());

        let config = ServiceConfig {
            http_rate_limit_per_second: Some(10),
            http_rate_limit_burst: Some(5),
            ..ServiceConfig::default()
        };
        assert!(join_limiter(&config).is_some());
    }
}
