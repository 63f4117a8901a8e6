use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::broker::{BrokerError, VIDEOS};
use crate::types::job::SdpPayload;
use crate::wire::protocol::{
    CreateSessionReq, CreateSessionResp, HealthResp, OfferResp, VideosResp,
};

use super::AppState;

/// Broker rejection in HTTP clothing: client-input errors map to 404,
/// capacity errors to 503.
pub struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(value: BrokerError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            BrokerError::NoWorkers => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::UnknownFilename
            | BrokerError::UnknownSession
            | BrokerError::UnknownJob => StatusCode::NOT_FOUND,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// GET /videos: the static catalogue.
pub async fn videos() -> Json<VideosResp> {
    Json(VideosResp { videos: VIDEOS })
}

/// GET /health: registry counters.
pub async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    Json(state.broker.health().await)
}

/// POST /session: create a session for one catalogue video.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionReq>,
) -> Result<Json<CreateSessionResp>, ApiError> {
    Ok(Json(state.broker.create_session(req).await?))
}

/// POST /session/{sid}/offer: wrap an SDP offer into a job.
pub async fn submit_offer(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<SdpPayload>,
) -> Result<(StatusCode, Json<OfferResp>), ApiError> {
    let resp = state.broker.submit_offer(&session_id, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(resp)))
}
