use super::ApiError;
use crate::{
    guard::{GuardAction, Navigation},
    server::SharedState,
    session::StatusReport,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

const LEAVE_PROMPT: &str = "Monitoring is active. Leave and stop the session?";

#[derive(Debug, Deserialize)]
pub struct NavigateRequest {
    target: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    leave: bool,
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NavigationReply {
    Proceed { navigation: Navigation },
    Confirm { prompt: &'static str, navigation: Navigation },
    Stayed { navigation: Navigation },
    Blocked,
}

pub async fn session_status(State(state): State<SharedState>) -> Json<StatusReport> {
    Json(state.session.status_report())
}

/// In-app navigation away from the monitoring view. While monitoring, the
/// attempt is held and answered with 409 until it is resolved.
#[instrument(skip(state))]
pub async fn navigate(
    State(state): State<SharedState>,
    Json(request): Json<NavigateRequest>,
) -> Result<Response, ApiError> {
    let navigation = Navigation::InApp {
        target: request.target,
    };
    let reply = match state.session.begin_navigation(navigation)? {
        GuardAction::Proceed(navigation) | GuardAction::TeardownAndProceed(navigation) => {
            (StatusCode::OK, NavigationReply::Proceed { navigation })
        }
        GuardAction::AwaitConfirmation(navigation) => (
            StatusCode::CONFLICT,
            NavigationReply::Confirm {
                prompt: LEAVE_PROMPT,
                navigation,
            },
        ),
        _ => (StatusCode::CONFLICT, NavigationReply::Blocked),
    };
    Ok((reply.0, Json(reply.1)).into_response())
}

#[instrument(skip(state))]
pub async fn resolve_navigation(
    State(state): State<SharedState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<NavigationReply>, ApiError> {
    let reply = match state.session.resolve_navigation(query.leave)? {
        GuardAction::TeardownAndProceed(navigation) => NavigationReply::Proceed { navigation },
        GuardAction::Revert(navigation) => NavigationReply::Stayed { navigation },
        other => {
            return Err(ApiError::Conflict(format!(
                "Unexpected guard action {:?}",
                other
            )))
        }
    };
    Ok(Json(reply))
}
