use super::ApiError;
use crate::{server::SharedState, session::StatusReport};
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct SelectQuery {
    id: String,
}

#[derive(Serialize)]
pub struct DeviceEntry {
    id: String,
    label: String,
    display_name: String,
}

#[derive(Serialize)]
pub struct DeviceList {
    selected: Option<String>,
    devices: Vec<DeviceEntry>,
}

#[instrument(skip(state))]
pub async fn list_devices(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<DeviceList>, ApiError> {
    let mut devices = state.registry.devices();
    if query.refresh || devices.is_empty() {
        devices = state.registry.list().await?;
    }

    let devices = devices
        .into_iter()
        .enumerate()
        .map(|(position, device)| DeviceEntry {
            display_name: device.display_name(position),
            id: device.id,
            label: device.label,
        })
        .collect();

    Ok(Json(DeviceList {
        selected: state.registry.selected(),
        devices,
    }))
}

/// Switching devices ends the current session before the new one starts.
#[instrument(skip(state))]
pub async fn select_device(
    State(state): State<SharedState>,
    Query(query): Query<SelectQuery>,
) -> Result<Json<StatusReport>, ApiError> {
    state.registry.select(query.id.clone());
    state.session.start(&query.id).await?;
    Ok(Json(state.session.status_report()))
}
