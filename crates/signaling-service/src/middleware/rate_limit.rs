//! Per-class rate limiting for the Control API.
//!
//! Class is derived from the route: registration and refresh are `auth`,
//! other reads are `read`, everything else is `write`. The caller is the
//! verified token subject when present, otherwise the peer address.
//! `X-Forwarded-For` is only consulted when `TRUST_FORWARDED_FOR` is set.

use crate::cluster::RateClass;
use crate::errors::SignalingError;
use crate::middleware::auth::extract_bearer_token;
use crate::routes::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

#[must_use]
pub fn classify(method: &Method, path: &str) -> RateClass {
    if path.starts_with("/api/agents/register") || path.starts_with("/api/auth/") {
        RateClass::Auth
    } else if method == Method::GET || method == Method::HEAD {
        RateClass::Read
    } else {
        RateClass::Write
    }
}

fn caller_identity(state: &AppState, request: &Request) -> String {
    if let Some(token) = extract_bearer_token(request.headers()) {
        if let Ok(claims) = state.credentials.verify(token) {
            return format!("sub:{}", claims.sub);
        }
    }

    if state.config.trust_forwarded_for {
        if let Some(ip) = forwarded_client(request.headers()) {
            return format!("ip:{ip}");
        }
    }

    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_string(),
    }
}

/// Left-most `X-Forwarded-For` entry.
fn forwarded_client(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
}

pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, SignalingError> {
    let class = classify(request.method(), request.uri().path());
    let identity = caller_identity(&state, &request);

    let decision = state
        .cluster
        .rate_limiter
        .check(class, &identity)
        .await
        .into_result()?;

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    Ok(response)
}
