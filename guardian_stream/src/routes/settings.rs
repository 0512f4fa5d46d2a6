use super::ApiError;
use crate::server::SharedState;
use axum::{
    extract::{Query, State},
    Json,
};
use guardian_proto::InferenceSettings;
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct EnabledQuery {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct IntervalQuery {
    interval: i64,
}

#[derive(Serialize)]
pub struct WriteReply {
    accepted: bool,
    settings: Option<InferenceSettings>,
}

#[instrument(skip(state))]
pub async fn get_settings(State(state): State<SharedState>) -> Result<Json<InferenceSettings>, ApiError> {
    Ok(Json(state.settings.fetch_settings().await?))
}

#[instrument(skip(state))]
pub async fn set_enabled(
    State(state): State<SharedState>,
    Query(query): Query<EnabledQuery>,
) -> Result<Json<WriteReply>, ApiError> {
    let accepted = state.settings.set_enabled(query.enabled).await?;
    Ok(Json(WriteReply {
        accepted,
        settings: state.settings.cached(),
    }))
}

#[instrument(skip(state))]
pub async fn toggle(State(state): State<SharedState>) -> Result<Json<WriteReply>, ApiError> {
    let accepted = state.settings.toggle().await?;
    Ok(Json(WriteReply {
        accepted,
        settings: state.settings.cached(),
    }))
}

/// Out-of-range values are answered with 422 without reaching the backend.
#[instrument(skip(state))]
pub async fn set_interval(
    State(state): State<SharedState>,
    Query(query): Query<IntervalQuery>,
) -> Result<Json<WriteReply>, ApiError> {
    let accepted = state.settings.set_interval(query.interval).await?;
    Ok(Json(WriteReply {
        accepted,
        settings: state.settings.cached(),
    }))
}
