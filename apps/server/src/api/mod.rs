//! HTTP surface of the sync service.

pub mod auth;
pub mod devices;
pub mod sync;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::rate_limit::RateDecision;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/params", post(auth::params))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route(
            "/sync/:data_type/delta",
            post(sync::upload_delta).get(sync::download_delta),
        )
        .route("/sync/:data_type/deleted", get(sync::download_deleted))
        .route("/devices", get(devices::list_devices))
        .route("/devices/:device_id", delete(devices::revoke_device))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Route class for the limiter window. Sync limits are per user, auth limits
/// per IP; everything else shares the download window so every response still
/// carries the rate headers.
fn classify(method: &Method, path: &str) -> (&'static str, bool) {
    if path == "/auth/register" {
        return ("register", false);
    }
    if path == "/auth/login" {
        return ("login", false);
    }
    if path.starts_with("/sync/") && method == Method::POST {
        return ("upload", true);
    }
    ("download", true)
}

fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

fn apply_rate_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    headers.insert(
        "x-ratelimit-limit",
        HeaderValue::from_str(&decision.limit.to_string()).unwrap_or(HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-ratelimit-remaining",
        HeaderValue::from_str(&decision.remaining.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from_str(&decision.reset.to_string()).unwrap_or(HeaderValue::from_static("0")),
    );
}

/// Enforce per-class limits and stamp `X-RateLimit-*` on every response.
async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let (class, per_user) = classify(request.method(), request.uri().path());

    let principal = if per_user {
        // Sync routes are limited per user; an unreadable token falls back to
        // the IP and lets the auth layer reject the request properly.
        request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .and_then(|token| {
                crate::auth::decode_access_token(&state.config.jwt_secret, token).ok()
            })
            .map(|claims| claims.sub)
            .unwrap_or_else(|| client_ip(&request))
    } else {
        client_ip(&request)
    };

    let (limit, window_secs) = match class {
        "register" => (state.config.register_limit_per_hour, 3600),
        "login" => (state.config.login_limit_per_min, 60),
        "upload" => (state.config.upload_limit_per_min, 60),
        _ => (state.config.download_limit_per_min, 60),
    };

    let key = format!("{}:{}", class, principal);
    let decision = state.limiter.check(&key, limit, window_secs);

    if !decision.allowed {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "code": "RATE_LIMITED",
                "message": "Too many requests; slow down",
            })),
        )
            .into_response();
        apply_rate_headers(&mut response, &decision);
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from_str(&decision.retry_after.to_string())
                .unwrap_or(HeaderValue::from_static("1")),
        );
        return response;
    }

    let mut response = next.run(request).await;
    apply_rate_headers(&mut response, &decision);
    response
}
