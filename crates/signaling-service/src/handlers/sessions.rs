//! `GET /api/sessions` - the caller's relay sessions across all instances.

use crate::errors::SignalingError;
use crate::middleware::AuthClaims;
use crate::models::{DataResponse, SessionListResponse};
use crate::routes::AppState;
use axum::{extract::State, Json};

pub async fn list_sessions(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
) -> Result<Json<DataResponse<SessionListResponse>>, SignalingError> {
    let mut sessions = state.cluster.sessions.list_for_subject(&claims.sub).await?;
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    Ok(Json(DataResponse::new(SessionListResponse { sessions })))
}
