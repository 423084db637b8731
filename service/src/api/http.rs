use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State as AxumState,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use endless_types::{ChallengeId, ChallengesQuery, ErrorResponse, JoinRequest, JoinResponse, PlayerId};
use serde::Serialize;
use std::sync::Arc;

use crate::{JoinError, Service, StoreError};

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

/// 425 Too Early.
fn too_early() -> StatusCode {
    StatusCode::from_u16(425).unwrap_or(StatusCode::TOO_MANY_REQUESTS)
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            retry_after_ms: None,
        }),
    )
        .into_response()
}

fn storage_error(err: StoreError) -> Response {
    tracing::warn!(error = %err, "ledger read failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
}

fn join_error(err: JoinError) -> Response {
    match err {
        JoinError::Validation(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
        JoinError::TooEarly { retry_after_ms } => {
            let mut response = (
                too_early(),
                Json(ErrorResponse {
                    error: "too early to join again".to_string(),
                    retry_after_ms: Some(retry_after_ms),
                }),
            )
                .into_response();
            let seconds = retry_after_ms.div_ceil(1_000);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
        JoinError::Transaction(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "join transaction failed")
        }
    }
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn config(AxumState(service): AxumState<Arc<Service>>) -> Response {
    Json(service.config.clone()).into_response()
}

pub(super) async fn challenge_metrics(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(service.metrics_snapshot()).into_response()
}

pub(super) async fn http_metrics(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(service.http_metrics().snapshot()).into_response()
}

pub(super) async fn join(
    AxumState(service): AxumState<Arc<Service>>,
    payload: Result<Json<JoinRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match service.join(request).await {
        Ok(receipt) => (
            StatusCode::CREATED,
            Json(JoinResponse {
                challenge_id: receipt.challenge_id,
                status: receipt.status,
            }),
        )
            .into_response(),
        Err(err) => join_error(err),
    }
}

pub(super) async fn list_challenges(
    AxumState(service): AxumState<Arc<Service>>,
    query: Result<Query<ChallengesQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match service.challenges(query).await {
        Ok(challenges) => Json(challenges).into_response(),
        Err(err) => storage_error(err),
    }
}

pub(super) async fn get_challenge(
    AxumState(service): AxumState<Arc<Service>>,
    id: Result<Path<ChallengeId>, PathRejection>,
) -> Response {
    let Path(id) = match id {
        Ok(id) => id,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match service.challenge(id).await {
        Ok(Some(challenge)) => Json(challenge).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "challenge not found"),
        Err(err) => storage_error(err),
    }
}

pub(super) async fn eligibility(
    AxumState(service): AxumState<Arc<Service>>,
    player_id: Result<Path<PlayerId>, PathRejection>,
) -> Response {
    let Path(player_id) = match player_id {
        Ok(player_id) => player_id,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match service.eligibility(player_id).await {
        Ok(eligibility) => Json(eligibility).into_response(),
        Err(err) => storage_error(err),
    }
}

pub(super) async fn prize_pool(AxumState(service): AxumState<Arc<Service>>) -> Response {
    match service.prize_pool().await {
        Ok(pool) => Json(pool).into_response(),
        Err(err) => storage_error(err),
    }
}

fn metrics_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("METRICS_AUTH_TOKEN").unwrap_or_default();
    metrics_token_error(headers, &token)
}

fn metrics_token_error(headers: &HeaderMap, token: &str) -> Option<StatusCode> {
    if token.is_empty() {
        return None;
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok());
    if bearer == Some(token) || header_token == Some(token) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;
    use crate::{Api, ServiceConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use axum::Router;
    use endless_types::{Challenge, ChallengeStatus, Eligibility, PrizePool, STAKE};
    use serde::de::DeserializeOwned;
    use std::sync::Once;
    use tower::ServiceExt;

    static INIT: Once = Once::new();

    fn router() -> (Router, crate::test_support::Harness) {
        INIT.call_once(|| std::env::set_var("ALLOW_HTTP_NO_ORIGIN", "1"));
        let h = harness(ServiceConfig {
            resolution_delay_ms: 3_600_000,
            http_rate_limit_per_second: None,
            http_rate_limit_burst: None,
            ..ServiceConfig::default()
        });
        (Api::new(h.service.clone()).router(), h)
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<&str>) -> Response {
        let mut request = Request::builder().method(method).uri(uri);
        if body.is_some() {
            request = request.header(header::CONTENT_TYPE, "application/json");
        }
        let request = request
            .body(body.map(|body| Body::from(body.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        router.clone().oneshot(request).await.unwrap()
    }

    async fn json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn join_then_rejoin_is_too_early() {
        let (router, h) = router();
        let body = r#"{"player_id":1001,"amount":20.01}"#;

        let response = send(&router, Method::POST, "/challenges", Some(body)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("x-request-id"));
        let joined: JoinResponse = json(response).await;
        assert_eq!(joined.status, ChallengeStatus::Joined);

        h.clock.advance(10_000);
        let response = send(&router, Method::POST, "/challenges/join", Some(body)).await;
        assert_eq!(response.status().as_u16(), 425);
        assert_eq!(response.headers()[header::RETRY_AFTER], "50");
        let error: ErrorResponse = json(response).await;
        assert_eq!(error.retry_after_ms, Some(50_000));

        let response = send(&router, Method::GET, "/prize-pool", None).await;
        let pool: PrizePool = json(response).await;
        assert_eq!(pool.amount, STAKE);
    }

    #[tokio::test]
    async fn malformed_bodies_are_bad_requests() {
        let (router, _h) = router();
        for body in [
            r#"{"player_id":1001,"amount":20.00}"#,
            r#"{"player_id":1001,"amount":20.015}"#,
            r#"{"player_id":1001}"#,
            r#"{"player_id":0,"amount":20.01}"#,
            "not json",
        ] {
            let response = send(&router, Method::POST, "/challenges", Some(body)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            let error: ErrorResponse = json(response).await;
            assert!(!error.error.is_empty());
        }
    }

    #[tokio::test]
    async fn reads_report_challenges_and_eligibility() {
        let (router, _h) = router();
        let body = r#"{"player_id":7,"amount":20.01}"#;
        let joined: JoinResponse =
            json(send(&router, Method::POST, "/challenges", Some(body)).await).await;

        let response = send(&router, Method::GET, &format!("/challenges/{}", joined.challenge_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let challenge: Challenge = json(response).await;
        assert_eq!(challenge.player_id, 7);
        assert_eq!(challenge.amount, STAKE);

        let response = send(&router, Method::GET, "/challenges/999999", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = send(&router, Method::GET, "/challenges/abc", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let listed: Vec<Challenge> =
            json(send(&router, Method::GET, "/challenges/results?limit=5&player_id=7", None).await).await;
        assert_eq!(listed.len(), 1);
        let response = send(&router, Method::GET, "/challenges/results?limit=lots", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let eligibility: Eligibility =
            json(send(&router, Method::GET, "/players/7/eligibility", None).await).await;
        assert_eq!(eligibility.status, ChallengeStatus::Joined);
        assert_eq!(eligibility.retry_after_ms, 60_000);
    }

    #[tokio::test]
    async fn broken_ledger_answers_internal_error() {
        let (router, h) = router();
        h.ledger.execute_raw("DROP TABLE prize_pool").unwrap();

        let body = r#"{"player_id":1001,"amount":20.01}"#;
        let response = send(&router, Method::POST, "/challenges", Some(body)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error: ErrorResponse = json(response).await;
        assert!(!error.error.is_empty());
        assert_eq!(error.retry_after_ms, None);

        let response = send(&router, Method::GET, "/prize-pool", None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error: ErrorResponse = json(response).await;
        assert!(!error.error.is_empty());
    }

    #[tokio::test]
    async fn join_limiter_throttles_joins_but_not_reads() {
        INIT.call_once(|| std::env::set_var("ALLOW_HTTP_NO_ORIGIN", "1"));
        let h = harness(ServiceConfig {
            resolution_delay_ms: 3_600_000,
            http_rate_limit_per_second: Some(1),
            http_rate_limit_burst: Some(1),
            ..ServiceConfig::default()
        });
        let router = Api::new(h.service.clone()).router();
        let join = |player: i64| {
            Request::builder()
                .method(Method::POST)
                .uri("/challenges")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-forwarded-for", "203.0.113.7")
                .body(Body::from(format!(r#"{{"player_id":{player},"amount":20.01}}"#)))
                .unwrap()
        };

        let first = router.clone().oneshot(join(1)).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = router.clone().oneshot(join(2)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = send(&router, Method::GET, "/prize-pool", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.service.http_metrics().snapshot().reject_rate_limit, 1);
    }

    #[tokio::test]
    async fn healthz_and_config_respond() {
        let (router, _h) = router();
        let response = send(&router, Method::GET, "/healthz", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let config: serde_json::Value =
            json(send(&router, Method::GET, "/config", None).await).await;
        assert_eq!(config["join_cooldown_ms"], 60_000);
    }

    #[test]
    fn metrics_token_accepts_bearer_or_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(metrics_token_error(&headers, ""), None);
        assert_eq!(
            metrics_token_error(&headers, "secret"),
            Some(StatusCode::UNAUTHORIZED)
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(metrics_token_error(&headers, "secret"), None);

        let mut headers = HeaderMap::new();
        headers.insert("x-metrics-token", HeaderValue::from_static("secret"));
        assert_eq!(metrics_token_error(&headers, "secret"), None);
        assert_eq!(
            metrics_token_error(&headers, "other"),
            Some(StatusCode::UNAUTHORIZED)
        );
    }
}
