use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::broker::Broker;

pub mod api;
pub mod client_ws;
pub mod worker_ws;

/// Everything the handlers need: the broker plus the knobs that arrive from
/// the command line.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    /// How long a connecting worker gets to identify itself before the
    /// broker assigns it a random id.
    pub hello_timeout: Duration,
}

/// Builds the broker's full HTTP surface: the REST endpoints plus the two
/// WebSocket upgrade routes.
pub fn router(broker: Arc<Broker>, hello_timeout: Duration) -> Router {
    let state = AppState {
        broker,
        hello_timeout,
    };

    Router::new()
        .route("/videos", get(api::videos))
        .route("/health", get(api::health))
        .route("/session", post(api::create_session))
        .route("/session/{sid}/offer", post(api::submit_offer))
        .route("/worker", get(worker_ws::worker_ws))
        .route("/queue/{job_id}", get(client_ws::queue_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
