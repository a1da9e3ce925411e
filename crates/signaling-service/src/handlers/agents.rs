//! Agent identity handlers.
//!
//! - `POST /api/agents/register` - mint an agent identity with access and
//!   refresh tokens (optionally gated by `X-Registration-Secret`)
//! - `GET /api/agents/me` - identity of the calling access token
//! - `POST /api/auth/refresh` - exchange a refresh token for an access token

use super::parse_json_body;
use crate::auth::AgentProfile;
use crate::errors::SignalingError;
use crate::middleware::AuthClaims;
use crate::models::{
    DataResponse, MeResponse, RefreshTokenRequest, RegisterAgentRequest, RegisterAgentResponse,
    TokenResponse, MAX_AGENT_NAME_LENGTH, MAX_PROFILE_ATTRIBUTE_LENGTH,
};
use crate::routes::AppState;
use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, Json};
use chrono::{TimeZone, Utc};
use common::secret::ExposeSecret;
use ring::hmac;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const REGISTRATION_SECRET_HEADER: &str = "x-registration-secret";

const REGISTRATION_CONTEXT: &[u8] = b"agent-registration";

/// Constant-time equality of `provided` and `expected`.
///
/// Both sides are reduced to an HMAC tag under the other's key material, so
/// the comparison is `hmac::verify` and does not leak length.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided_tag = hmac::sign(
        &hmac::Key::new(hmac::HMAC_SHA256, provided.as_bytes()),
        REGISTRATION_CONTEXT,
    );
    let expected_key = hmac::Key::new(hmac::HMAC_SHA256, expected.as_bytes());
    hmac::verify(&expected_key, REGISTRATION_CONTEXT, provided_tag.as_ref()).is_ok()
}

fn check_registration_secret(state: &AppState, headers: &HeaderMap) -> Result<(), SignalingError> {
    let Some(expected) = state.config.agent_registration_secret.as_ref() else {
        return Ok(());
    };

    let provided = headers
        .get(REGISTRATION_SECRET_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    if provided.is_empty() || !secrets_match(provided, expected.expose_secret()) {
        warn!(target: "sig.api", "Agent registration refused: bad registration secret");
        return Err(SignalingError::Forbidden(
            "Invalid registration secret".to_string(),
        ));
    }
    Ok(())
}

/// Blank values count as absent.
fn profile_attribute(field: &str, value: Option<String>) -> Result<Option<String>, SignalingError> {
    let Some(value) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if value.chars().count() > MAX_PROFILE_ATTRIBUTE_LENGTH {
        return Err(SignalingError::BadRequest(format!(
            "Agent {field} must be at most {MAX_PROFILE_ATTRIBUTE_LENGTH} characters"
        )));
    }
    Ok(Some(value))
}

#[instrument(skip_all, name = "sig.api.agent.register")]
pub async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<DataResponse<RegisterAgentResponse>>), SignalingError> {
    check_registration_secret(&state, &headers)?;

    let request: RegisterAgentRequest = parse_json_body(&body)?;
    let name = request.name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_AGENT_NAME_LENGTH {
        return Err(SignalingError::BadRequest(format!(
            "Agent name must be 1 to {MAX_AGENT_NAME_LENGTH} characters"
        )));
    }

    let emoji = profile_attribute("emoji", request.emoji)?;
    let color = profile_attribute("color", request.color)?;

    let agent_id = format!("agent-{}", Uuid::new_v4().simple());
    let profile = AgentProfile {
        name: Some(name.clone()),
        emoji: emoji.clone(),
        color: color.clone(),
    };
    let access = state.credentials.issue_access(&agent_id, &profile)?;
    let refresh = state.credentials.issue_refresh(&agent_id, &profile)?;

    info!(target: "sig.api", "Agent registered");

    Ok((
        StatusCode::CREATED,
        Json(DataResponse::new(RegisterAgentResponse {
            agent_id,
            api_key: access.token.clone(),
            access_token: access.token,
            refresh_token: refresh.token,
            expires_in: access.expires_in,
            name,
            emoji,
            color,
        })),
    ))
}

pub async fn get_me(AuthClaims(claims): AuthClaims) -> Result<Json<DataResponse<MeResponse>>, SignalingError> {
    let expires_at = Utc
        .timestamp_opt(claims.exp, 0)
        .single()
        .ok_or_else(|| SignalingError::Internal("token expiry out of range".to_string()))?;

    Ok(Json(DataResponse::new(MeResponse {
        id: claims.sub.clone(),
        agent_id: claims.sub,
        name: claims.name,
        emoji: claims.emoji,
        color: claims.color,
        expires_at,
    })))
}

#[instrument(skip_all, name = "sig.api.auth.refresh")]
pub async fn refresh_token(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DataResponse<TokenResponse>>, SignalingError> {
    let request: RefreshTokenRequest = parse_json_body(&body)?;

    let issued = state.credentials.refresh(&request.refresh_token).map_err(|e| {
        debug!(target: "sig.api", error = %e, "Refresh refused");
        SignalingError::from(e)
    })?;

    Ok(Json(DataResponse::new(TokenResponse {
        access_token: issued.token,
        expires_in: issued.expires_in,
    })))
}
