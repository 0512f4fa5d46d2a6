mod devices;
mod health;
mod metrics;
mod session;
mod settings;
mod video_feed;

use crate::{
    capture::CaptureError, server::SharedState, session::SessionError, settings::SettingsError,
    transport::ChannelError,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use thiserror::Error;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/video_feed", get(video_feed::video_feed))
        .route("/session/status", get(session::session_status))
        .route("/session/navigate", post(session::navigate))
        .route("/session/navigate/resolve", post(session::resolve_navigation))
        .route("/devices", get(devices::list_devices))
        .route("/devices/select", post(devices::select_device))
        .route("/settings", get(settings::get_settings))
        .route("/settings/enabled", post(settings::set_enabled))
        .route("/settings/toggle", post(settings::toggle))
        .route("/settings/interval", post(settings::set_interval))
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("{0}")]
    Conflict(String),
}

fn capture_status(error: &CaptureError) -> StatusCode {
    match error {
        CaptureError::PermissionDenied => StatusCode::FORBIDDEN,
        CaptureError::DeviceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Session(SessionError::Capture(e)) | ApiError::Capture(e) => capture_status(e),
            ApiError::Session(
                SessionError::Superseded | SessionError::Channel(ChannelError::Cancelled),
            ) => StatusCode::CONFLICT,
            ApiError::Session(SessionError::Channel(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Session(SessionError::Guard(_)) | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Settings(SettingsError::InvalidArgument(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Settings(SettingsError::Request(_) | SettingsError::Rejected(_)) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Settings(SettingsError::Url(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
