//! Axum middleware wrapping [`SecurityGate`].
//!
//! Identity is the client IP from `ConnectInfo`, plus the authenticated user
//! when an earlier layer inserted a [`UserId`] extension. `X-Forwarded-For`
//! is only honored when the direct peer is loopback (a local reverse proxy).

use crate::gate::{GateDecision, SecurityGate};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::middleware::Next;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Authenticated caller, set by the auth layer before the gate runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

/// Gate every request, then feed the outcome back into abuse scoring.
pub async fn security_gate(
    State(gate): State<Arc<SecurityGate>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let ip = client_ip(&request).to_string();
    let user = request.extensions().get::<UserId>().map(|u| u.0.clone());
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let decision = gate.check_request(&ip, user.as_deref(), &path, user_agent.as_deref());
    if !decision.allowed {
        tracing::warn!(
            ip = %ip,
            path = %path,
            status = decision.status(),
            reason = decision.reason().unwrap_or(""),
            "Request denied by security gate"
        );
        return denial_response(&decision);
    }

    let mut response = next.run(request).await;
    if response.status().as_u16() < 400 {
        gate.record_api_success(&ip, user.as_deref());
    } else {
        gate.record_api_failure(&ip, user.as_deref());
    }
    apply_headers(&mut response, &decision);
    response
}

fn client_ip(request: &Request<Body>) -> IpAddr {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));
    if !peer.is_loopback() {
        return peer;
    }
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(peer)
}

fn denial_response(decision: &GateDecision) -> Response<Body> {
    let status = StatusCode::from_u16(decision.status()).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    let mut body = serde_json::json!({
        "success": false,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(denial) = &decision.denial {
        body["error"] = denial.code.error_code().into();
        body["message"] = denial.message.clone().into();
        if let Some(secs) = denial.retry_after {
            body["retryAfter"] = secs.into();
        }
    }
    let mut response = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default();
    apply_headers(&mut response, decision);
    response
}

fn apply_headers(response: &mut Response<Body>, decision: &GateDecision) {
    let headers = response.headers_mut();
    for (name, value) in &decision.headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(*name), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use fleetlink_types::config::SecurityConfig;
    use tower::ServiceExt;

    fn app(config: SecurityConfig) -> Router {
        let gate = Arc::new(SecurityGate::new(config));
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "missing") }),
            )
            .layer(axum::middleware::from_fn_with_state(gate, security_gate))
    }

    fn req(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .extension(ConnectInfo(SocketAddr::from(([10, 0, 0, 5], 4000))))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_response_carries_headers() {
        let app = app(SecurityConfig::default());
        let response = app.oneshot(req("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let h = response.headers();
        assert_eq!(h["x-content-type-options"], "nosniff");
        assert_eq!(h["x-frame-options"], "DENY");
        assert_eq!(h["x-ratelimit-limit"], "120");
        assert_eq!(h["x-ratelimit-remaining"], "119");
        assert!(h.contains_key("x-ratelimit-reset"));
    }

    #[tokio::test]
    async fn test_rate_limited_body() {
        let app = app(SecurityConfig {
            rate_limit_max_requests: 1,
            ..SecurityConfig::default()
        });
        let first = app.clone().oneshot(req("/ok")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(req("/ok")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()["retry-after"], "60");
        assert_eq!(second.headers()["x-ratelimit-remaining"], "0");
        let body = body_json(second).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(body["retryAfter"], 60);
        assert!(body["message"].as_str().unwrap().contains("Rate limit"));
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_error_responses_feed_scoring() {
        let app = app(SecurityConfig {
            suspicious_threshold: 6,
            ..SecurityConfig::default()
        });
        // Two 404s: 2 * failure_weight(3) = 6.
        for _ in 0..2 {
            let r = app.clone().oneshot(req("/missing")).await.unwrap();
            assert_eq!(r.status(), StatusCode::NOT_FOUND);
        }
        let r = app.oneshot(req("/ok")).await.unwrap();
        assert_eq!(r.status(), StatusCode::FORBIDDEN);
        let body = body_json(r).await;
        assert_eq!(body["error"], "suspicious_activity");
    }

    #[tokio::test]
    async fn test_blocked_agent() {
        let app = app(SecurityConfig::default());
        let mut request = req("/ok");
        request
            .headers_mut()
            .insert("user-agent", HeaderValue::from_static("masscan/1.3"));
        let r = app.oneshot(request).await.unwrap();
        assert_eq!(r.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(r).await["error"], "blocked");
    }

    #[test]
    fn test_forwarded_for_only_from_loopback() {
        let mut local = Request::builder()
            .uri("/")
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 1))))
            .body(Body::empty())
            .unwrap();
        local
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(client_ip(&local), IpAddr::from([203, 0, 113, 9]));

        let mut remote = req("/");
        remote
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        assert_eq!(client_ip(&remote), IpAddr::from([10, 0, 0, 5]));

        let bare = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(client_ip(&bare), IpAddr::from([127, 0, 0, 1]));
    }
}
