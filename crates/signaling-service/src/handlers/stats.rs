//! `GET /api/stats` - aggregate counts for this instance (public).

use crate::errors::SignalingError;
use crate::models::{DataResponse, StatsResponse};
use crate::routes::AppState;
use axum::{extract::State, Json};
use std::sync::atomic::Ordering;

pub async fn get_stats(
    State(state): State<AppState>,
) -> Result<Json<DataResponse<StatsResponse>>, SignalingError> {
    let local = state.registry.stats().await?;

    Ok(Json(DataResponse::new(StatsResponse {
        rooms: local.rooms,
        remote_rooms: state.directory.len().await,
        participants: local.participants,
        connections: state.connections.load(Ordering::Relaxed),
        instance_id: state.config.instance_id.clone(),
        cluster_mode: state.cluster.mode.as_str(),
    })))
}
