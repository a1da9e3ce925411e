//! HTTP middleware and request extractors.

pub mod auth;
pub mod http_metrics;
pub mod rate_limit;

pub use auth::{extract_bearer_token, AuthClaims};
pub use http_metrics::http_metrics_middleware;
pub use rate_limit::enforce_rate_limit;
